//! End-to-end QUIC tests over loopback

use infinitoon_proto::{Message, MessageType};
use infinitoon_transport::{
    FailureKind, StreamReceiver, StreamSender, StreamSide, TransportConnection,
    TransportConnector, TransportError, TransportListener, TransportStream,
};
use infinitoon_transport_quic::{QuicConfig, QuicConnection, QuicConnector, QuicListener};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn echo(client_id: &str) -> Message {
    Message::new(MessageType::EchoRequest, client_id, Vec::new())
}

/// Relay and tunnel connections joined over loopback
struct Pair {
    client: QuicConnection,
    server: QuicConnection,
    _listener: QuicListener,
}

impl Pair {
    async fn connect() -> Self {
        let listener = QuicListener::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(QuicConfig::server_ephemeral().unwrap()),
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = QuicConnector::new(Arc::new(
            QuicConfig::client_insecure().with_idle_timeout(Duration::from_secs(10)),
        ))
        .unwrap();

        let (client, accepted) =
            within(async { tokio::join!(connector.connect(addr, "localhost"), listener.accept()) })
                .await;
        let (server, peer) = accepted.unwrap();
        let client = client.unwrap();

        assert_eq!(client.remote_address(), addr);
        assert_eq!(server.remote_address(), peer);

        Self {
            client,
            server,
            _listener: listener,
        }
    }
}

#[tokio::test]
async fn test_request_reply() {
    let pair = Pair::connect().await;
    assert!(!pair.client.is_closed());
    assert!(pair.client.connection_id().starts_with("quic-"));

    let mut outbound = pair.client.open_stream().await.unwrap();
    assert_eq!(outbound.initiator(), StreamSide::Client);

    let request = Message::new(
        MessageType::EchoRequest,
        "edge",
        br#"{"message":"echo"}"#.to_vec(),
    );
    // The peer only sees the stream after the first write
    outbound.send_message(&request).await.unwrap();

    let mut inbound = within(pair.server.accept_stream()).await.unwrap().unwrap();
    assert_eq!(inbound.initiator(), StreamSide::Client);
    assert_eq!(inbound.stream_id(), outbound.stream_id());
    assert_eq!(inbound.recv_message().await.unwrap().as_ref(), Some(&request));

    let reply = Message::new(MessageType::EchoResponse, "edge", request.payload.clone());
    inbound.send_message(&reply).await.unwrap();
    assert_eq!(outbound.recv_message().await.unwrap(), Some(reply));
}

#[tokio::test]
async fn test_concurrent_streams_are_distinct() {
    let pair = Pair::connect().await;

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let mut stream = pair.client.open_stream().await.unwrap();
        stream.send_message(&echo(name)).await.unwrap();
        ids.push(stream.stream_id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    let mut names = Vec::new();
    for _ in 0..3 {
        let mut stream = within(pair.server.accept_stream()).await.unwrap().unwrap();
        names.push(stream.recv_message().await.unwrap().unwrap().client_id);
    }
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);
}

#[tokio::test]
async fn test_relay_opened_stream() {
    let pair = Pair::connect().await;

    let mut stream = pair.server.open_stream().await.unwrap();
    assert_eq!(stream.initiator(), StreamSide::Server);
    stream.send_message(&echo("relay")).await.unwrap();

    let mut accepted = within(pair.client.accept_stream()).await.unwrap().unwrap();
    assert_eq!(accepted.initiator(), StreamSide::Server);
    assert_eq!(
        accepted.recv_message().await.unwrap().unwrap().client_id,
        "relay"
    );
}

#[tokio::test]
async fn test_close_reaches_peer() {
    let pair = Pair::connect().await;

    pair.server.close(0, "close normal").await;
    assert!(pair.server.is_closed());

    let err = within(pair.client.accept_stream()).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::GracefulClose);
    assert!(matches!(
        err,
        TransportError::ClosedByPeer { code: 0, ref reason } if reason == "close normal"
    ));

    assert!(pair.server.accept_stream().await.unwrap().is_none());
}

#[tokio::test]
async fn test_finish_ends_stream() {
    let pair = Pair::connect().await;

    let mut outbound = pair.client.open_stream().await.unwrap();
    outbound.send_message(&echo("last")).await.unwrap();
    outbound.finish().await.unwrap();
    outbound.finish().await.unwrap();

    let mut inbound = within(pair.server.accept_stream()).await.unwrap().unwrap();
    assert!(inbound.recv_message().await.unwrap().is_some());
    assert!(inbound.recv_message().await.unwrap().is_none());

    assert!(matches!(
        outbound.send_message(&echo("late")).await,
        Err(TransportError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_stream_survives_malformed_frame() {
    let pair = Pair::connect().await;

    let mut outbound = pair.client.open_stream().await.unwrap();
    outbound.send_bytes(b"{not an envelope}\n").await.unwrap();

    let mut inbound = within(pair.server.accept_stream()).await.unwrap().unwrap();
    let err = inbound.recv_message().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Malformed);

    outbound.send_message(&echo("edge")).await.unwrap();
    assert_eq!(
        inbound.recv_message().await.unwrap().unwrap().client_id,
        "edge"
    );
}

#[tokio::test]
async fn test_envelope_behind_malformed_frame_is_kept() {
    let pair = Pair::connect().await;

    let mut chunk = b"garbage\n".to_vec();
    chunk.extend_from_slice(&infinitoon_proto::EnvelopeCodec::encode(&echo("after")).unwrap());

    let mut outbound = pair.client.open_stream().await.unwrap();
    outbound.send_bytes(&chunk).await.unwrap();
    outbound.finish().await.unwrap();

    let mut inbound = within(pair.server.accept_stream()).await.unwrap().unwrap();
    let err = within(inbound.recv_message()).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Malformed);
    assert_eq!(
        within(inbound.recv_message()).await.unwrap().unwrap().client_id,
        "after"
    );
    assert!(inbound.recv_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_split_reader_and_writer() {
    let pair = Pair::connect().await;

    let mut outbound = pair.client.open_stream().await.unwrap();
    outbound.send_message(&echo("one")).await.unwrap();

    let (mut tx, mut rx) = within(pair.server.accept_stream())
        .await
        .unwrap()
        .unwrap()
        .split();
    assert_eq!(tx.stream_id(), rx.stream_id());

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(message) = rx.recv_message().await.unwrap() {
            seen.push(message.client_id);
        }
        seen
    });

    tx.send_message(&Message::new(MessageType::EchoResponse, "one", Vec::new()))
        .await
        .unwrap();
    assert_eq!(
        outbound.recv_message().await.unwrap().unwrap().message_type,
        MessageType::EchoResponse
    );

    outbound.send_message(&echo("two")).await.unwrap();
    outbound.finish().await.unwrap();

    assert_eq!(within(reader).await.unwrap(), ["one", "two"]);
}

#[tokio::test]
async fn test_pinned_root_certificate() {
    let generated = infinitoon_cert::generate_self_signed_cert().unwrap();
    let dir = std::env::temp_dir().join(format!("infinitoon-pin-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let (cert, key) = (dir.join("relay.crt"), dir.join("relay.key"));
    generated.save_to_files(&cert, &key).unwrap();

    let listener = QuicListener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(QuicConfig::server_default(&cert, &key).unwrap()),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let trusting = QuicConnector::new(Arc::new(
        QuicConfig::client_default().with_root_certificate(generated.cert_der.to_vec()),
    ))
    .unwrap();
    let (client, accepted) =
        within(async { tokio::join!(trusting.connect(addr, "localhost"), listener.accept()) })
            .await;
    client.unwrap();
    accepted.unwrap();

    // Without the pin the web PKI roots reject the certificate
    let strict = QuicConnector::new(Arc::new(QuicConfig::client_default())).unwrap();
    let rejected = within(async {
        tokio::select! {
            result = strict.connect(addr, "localhost") => result,
            _ = listener.accept() => panic!("untrusted handshake completed"),
        }
    })
    .await;
    assert!(rejected.is_err());

    std::fs::remove_dir_all(&dir).unwrap();
}
