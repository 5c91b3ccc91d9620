//! Endpoint behaviour over the in-process transport

use async_trait::async_trait;
use infinitoon_proto::{EchoPayload, EnvelopeCodec, Message, MessageType, Payload};
use infinitoon_transport::memory::{
    MemoryConfig, MemoryConnection, MemoryNetwork, MemoryStream, MemoryTransportFactory,
};
use infinitoon_transport::{
    TransportConnection, TransportConnector, TransportError, TransportFactory, TransportStream,
};
use infinitoon_tunnel::{
    Client, ClientConfig, ClientState, EchoHandler, Responder, Server, ServerConfig,
    StreamContext, StreamHandler, TunnelClient, TunnelError, TunnelServer,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// Echo handler that counts requests and can be told to hang
#[derive(Default)]
struct CountingHandler {
    echoes: AtomicUsize,
    /// Answer this many upcoming echoes with `err_stream`
    failures: AtomicUsize,
}

impl CountingHandler {
    fn failing_first(count: usize) -> Self {
        Self {
            failures: AtomicUsize::new(count),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StreamHandler for CountingHandler {
    async fn handle(
        &self,
        ctx: StreamContext,
        responder: Responder,
        message: Message,
    ) -> Result<(), TunnelError> {
        if message.message_type == MessageType::EchoRequest {
            self.echoes.fetch_add(1, Ordering::SeqCst);

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                let reply = Message::new(MessageType::ErrStream, message.client_id, Vec::new());
                return responder.send(&reply).await;
            }
        }
        if message.client_id == "block" {
            std::future::pending::<()>().await;
        }
        EchoHandler.handle(ctx, responder, message).await
    }
}

type MemoryServer = Server<MemoryTransportFactory>;
type MemoryClient = Client<MemoryTransportFactory>;

async fn start_server(
    factory: &MemoryTransportFactory,
    handler: Arc<dyn StreamHandler>,
) -> (Arc<MemoryServer>, SocketAddr, JoinHandle<Result<(), TunnelError>>) {
    let server = Arc::new(Server::new(
        factory.clone(),
        ServerConfig::new("relay", "127.0.0.1", 0),
        Arc::new(MemoryConfig::default()),
        handler,
    ));

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.start_server().await }
    });

    let addr = server.wait_listening().await.unwrap();
    (server, addr, task)
}

fn client(factory: &MemoryTransportFactory, addr: SocketAddr) -> MemoryClient {
    let config = ClientConfig::new("edge", "127.0.0.1", addr.port());
    Client::new(factory, config, Arc::new(MemoryConfig::default())).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_client_retries_until_relay_reachable() {
    let network = MemoryNetwork::new();
    let factory = MemoryTransportFactory::new(network.clone());
    let (_server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    network.fail_next_connects(3);
    let client = client(&factory, addr);

    let started = Instant::now();
    client.setup().await.unwrap();

    assert_eq!(client.state(), ClientState::Streaming);
    assert_eq!(network.connect_attempts(), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(15));

    client.shutdown_client().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_client_waits_for_late_relay() {
    let factory = MemoryTransportFactory::default();
    // Nothing listens on this port until the relay starts below
    let port = 47001;
    let client = Arc::new(client(&factory, SocketAddr::from(([127, 0, 0, 1], port))));

    let setup = tokio::spawn({
        let client = client.clone();
        async move { client.setup().await }
    });

    sleep(Duration::from_secs(12)).await;
    assert_eq!(client.state(), ClientState::Dialing);

    let server = Arc::new(Server::new(
        factory.clone(),
        ServerConfig::new("relay", "127.0.0.1", port),
        Arc::new(MemoryConfig::default()),
        Arc::new(EchoHandler),
    ));
    tokio::spawn({
        let server = server.clone();
        async move { server.start_server().await }
    });

    setup.await.unwrap().unwrap();
    assert_eq!(client.state(), ClientState::Streaming);
}

#[tokio::test]
async fn test_client_request_reply() {
    let factory = MemoryTransportFactory::default();
    let (_server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let client = client(&factory, addr);
    client.setup().await.unwrap();

    let mut request = EchoPayload::new("edge");
    request.message = "are you there".to_string();

    let reply = client
        .send_message(&request.encode_request().unwrap())
        .await
        .unwrap();
    let reply = EchoPayload::decode_response(&reply).unwrap();
    assert_eq!(reply, request);
}

#[tokio::test]
async fn test_registry_follows_connection_lifecycle() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let client = client(&factory, addr);
    client.setup().await.unwrap();

    eventually(|| server.connected_clients().len() == 1).await;
    let key = server.connected_clients().remove(0);
    assert!(server.is_connected(&key));

    client.shutdown_client().await.unwrap();

    eventually(|| !server.is_connected(&key)).await;
    assert!(server.connected_clients().is_empty());

    // Addressing the departed client fails cleanly
    let echo = EchoPayload::new("relay").encode_request().unwrap();
    assert!(matches!(
        server.send_message(&key, &echo).await,
        Err(TunnelError::ClientNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence() {
    let factory = MemoryTransportFactory::default();
    let handler = Arc::new(CountingHandler::default());
    let (_server, addr, _task) = start_server(&factory, handler.clone()).await;

    let client = client(&factory, addr);
    let start = Instant::now();
    client.setup().await.unwrap();

    // One echo right away
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);

    sleep_until(start, 59).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);

    // Then exactly one per interval
    sleep_until(start, 61).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 2);

    sleep_until(start, 121).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 3);

    client.shutdown_client().await.unwrap();
    sleep_until(start, 400).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_keeps_ticking() {
    let factory = MemoryTransportFactory::default();
    let handler = Arc::new(CountingHandler::failing_first(1));
    let (_server, addr, _task) = start_server(&factory, handler.clone()).await;

    let client = client(&factory, addr);
    let start = Instant::now();
    client.setup().await.unwrap();

    // The first echo is answered with err_stream
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);
    assert_eq!(handler.failures.load(Ordering::SeqCst), 0);

    sleep_until(start, 59).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);

    sleep_until(start, 61).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 2);

    sleep_until(start, 121).await;
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), ClientState::Streaming);

    // The primary stream still pairs requests with their replies
    let mut request = EchoPayload::new("edge");
    request.message = "after a bad tick".to_string();
    let reply = client
        .send_message(&request.encode_request().unwrap())
        .await
        .unwrap();
    assert_eq!(EchoPayload::decode_response(&reply).unwrap(), request);

    client.shutdown_client().await.unwrap();
}

async fn sleep_until(start: Instant, secs: u64) {
    tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
}

#[tokio::test]
async fn test_blocked_handler_does_not_stall_other_streams() {
    let factory = MemoryTransportFactory::default();
    let (_server, addr, _task) = start_server(&factory, Arc::new(CountingHandler::default())).await;

    let connector = factory
        .create_connector(Arc::new(MemoryConfig::default()))
        .unwrap();
    let connection = connector.connect(addr, "localhost").await.unwrap();

    let mut blocked = connection.open_stream().await.unwrap();
    blocked
        .send_message(&EchoPayload::new("block").encode_request().unwrap())
        .await
        .unwrap();

    let mut other = connection.open_stream().await.unwrap();
    other
        .send_message(&EchoPayload::new("free").encode_request().unwrap())
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), other.recv_message())
        .await
        .expect("second stream was starved")
        .unwrap()
        .unwrap();
    assert_eq!(reply.message_type, MessageType::EchoResponse);
    assert_eq!(reply.client_id, "free");
}

#[tokio::test]
async fn test_malformed_frame_gets_one_error_reply() {
    let factory = MemoryTransportFactory::default();
    let handler = Arc::new(CountingHandler::default());
    let (_server, addr, _task) = start_server(&factory, handler.clone()).await;

    let connector = factory
        .create_connector(Arc::new(MemoryConfig::default()))
        .unwrap();
    let connection = connector.connect(addr, "localhost").await.unwrap();
    let mut stream = connection.open_stream().await.unwrap();

    stream.send_bytes(b"<<garbage>>\n").await.unwrap();

    let reply = stream.recv_message().await.unwrap().unwrap();
    assert_eq!(reply.message_type, MessageType::ErrInvalidPayload);
    assert_eq!(reply.client_id, "client");
    assert!(reply.payload.is_empty());

    // The next reply on the stream belongs to the next request
    stream
        .send_message(&EchoPayload::new("edge").encode_request().unwrap())
        .await
        .unwrap();
    let reply = stream.recv_message().await.unwrap().unwrap();
    assert_eq!(reply.message_type, MessageType::EchoResponse);
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_behind_malformed_frame_is_answered() {
    let factory = MemoryTransportFactory::default();
    let handler = Arc::new(CountingHandler::default());
    let (_server, addr, _task) = start_server(&factory, handler.clone()).await;

    let connector = factory
        .create_connector(Arc::new(MemoryConfig::default()))
        .unwrap();
    let connection = connector.connect(addr, "localhost").await.unwrap();
    let mut stream = connection.open_stream().await.unwrap();

    // Both frames arrive in a single write
    let mut chunk = b"<<garbage>>\n".to_vec();
    chunk.extend_from_slice(
        &EnvelopeCodec::encode(&EchoPayload::new("edge").encode_request().unwrap()).unwrap(),
    );
    stream.send_bytes(&chunk).await.unwrap();

    let first = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.message_type, MessageType::ErrInvalidPayload);

    let second = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .expect("request after the bad frame was lost")
        .unwrap()
        .unwrap();
    assert_eq!(second.message_type, MessageType::EchoResponse);
    assert_eq!(second.client_id, "edge");
    assert_eq!(handler.echoes.load(Ordering::SeqCst), 1);
}

/// Dial the relay directly and wait until it has registered the connection
async fn raw_connection(
    factory: &MemoryTransportFactory,
    server: &MemoryServer,
    addr: SocketAddr,
) -> (MemoryConnection, MemoryStream, String) {
    let connector = factory
        .create_connector(Arc::new(MemoryConfig::default()))
        .unwrap();
    let connection = connector.connect(addr, "localhost").await.unwrap();

    let mut stream = connection.open_stream().await.unwrap();
    stream
        .send_message(&EchoPayload::new("edge").encode_request().unwrap())
        .await
        .unwrap();
    assert!(stream.recv_message().await.unwrap().is_some());

    eventually(|| server.connected_clients().len() == 1).await;
    let key = server.connected_clients().remove(0);
    (connection, stream, key)
}

#[tokio::test]
async fn test_registry_drops_aborted_connection() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let (connection, _stream, key) = raw_connection(&factory, &server, addr).await;
    connection.close(7, "abort").await;

    eventually(|| !server.is_connected(&key)).await;
    assert!(server.connected_clients().is_empty());
}

#[tokio::test]
async fn test_registry_drops_idle_connection() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let (connection, mut stream, key) = raw_connection(&factory, &server, addr).await;

    connection.expire();

    assert!(matches!(
        stream.recv_message().await,
        Err(TransportError::IdleTimeout)
    ));
    eventually(|| !server.is_connected(&key)).await;

    let echo = EchoPayload::new("relay").encode_request().unwrap();
    assert!(matches!(
        server.send_message(&key, &echo).await,
        Err(TunnelError::ClientNotFound(_))
    ));
}

#[tokio::test]
async fn test_server_addresses_connected_client() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let client = client(&factory, addr).with_inbound_handler(Arc::new(EchoHandler));
    client.setup().await.unwrap();

    eventually(|| server.connected_clients().len() == 1).await;
    let key = server.connected_clients().remove(0);

    let mut request = EchoPayload::new("relay");
    request.message = "from the relay".to_string();
    let reply = server
        .send_message(&key, &request.encode_request().unwrap())
        .await
        .unwrap();

    assert_eq!(EchoPayload::decode_response(&reply).unwrap(), request);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_while_running() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let client = client(&factory, addr);
    client.setup().await.unwrap();

    client.shutdown_client().await.unwrap();
    client.shutdown_client().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);

    let echo = EchoPayload::new("edge").encode_request().unwrap();
    assert!(client.send_message(&echo).await.is_err());

    server.shutdown_server().await.unwrap();
    server.shutdown_server().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(server.connected_clients().is_empty());
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let factory = MemoryTransportFactory::default();
    let (server, addr, _task) = start_server(&factory, Arc::new(EchoHandler)).await;

    let client = client(&factory, addr);
    client.setup().await.unwrap();
    eventually(|| server.connected_clients().len() == 1).await;

    server.shutdown_server().await.unwrap();

    let echo = EchoPayload::new("edge").encode_request().unwrap();
    let err = client.send_message(&echo).await.unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Transport(TransportError::ClosedByPeer { code: 0, .. })
    ));
}
