//! Stream handlers and inbound dispatch
//!
//! Every envelope read from an inbound stream is handed to a [`StreamHandler`]
//! on its own task, together with a [`Responder`] bound to the same stream.
//! A handler that never returns therefore only holds up its own exchange.

use async_trait::async_trait;
use infinitoon_proto::{EchoPayload, Message, MessageType, Payload};
use infinitoon_transport::{FailureKind, StreamReceiver, StreamSender, StreamSide, TransportStream};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TunnelError;

/// Where an inbound envelope came from
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Name of the local endpoint that accepted the stream
    pub endpoint: Arc<str>,
    pub peer: SocketAddr,
    pub stream_id: u64,
    /// Side of the connection that opened the stream
    pub initiator: StreamSide,
    /// Cancelled when the local endpoint shuts down
    pub shutdown: CancellationToken,
}

/// Write access to the stream an envelope arrived on
///
/// Clones share the underlying send half; writes from concurrent handlers
/// are serialized so envelopes never interleave on the wire.
#[derive(Clone)]
pub struct Responder {
    sender: Arc<Mutex<Box<dyn StreamSender>>>,
    stream_id: u64,
}

impl Responder {
    pub fn new(sender: Box<dyn StreamSender>) -> Self {
        let stream_id = sender.stream_id();
        Self {
            sender: Arc::new(Mutex::new(sender)),
            stream_id,
        }
    }

    /// Write one envelope to the stream
    pub async fn send(&self, message: &Message) -> Result<(), TunnelError> {
        self.sender.lock().await.send_message(message).await?;
        Ok(())
    }

    /// Finish the sending side of the stream
    pub async fn finish(&self) -> Result<(), TunnelError> {
        self.sender.lock().await.finish().await?;
        Ok(())
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Application callback for inbound envelopes
///
/// A handler may write any number of envelopes through the responder,
/// including none.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: StreamContext,
        responder: Responder,
        message: Message,
    ) -> Result<(), TunnelError>;
}

/// Answers echo requests with an echo response carrying the same body
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(
        &self,
        ctx: StreamContext,
        responder: Responder,
        message: Message,
    ) -> Result<(), TunnelError> {
        match message.message_type {
            MessageType::EchoRequest => {
                let echo = EchoPayload::decode_request(&message)?;
                debug!(
                    endpoint = %ctx.endpoint,
                    peer = %ctx.peer,
                    client_id = %echo.client_id,
                    "echo: {}",
                    echo.message
                );
                responder.send(&echo.encode_response()?).await
            }
            other => {
                info!(
                    endpoint = %ctx.endpoint,
                    peer = %ctx.peer,
                    stream_id = ctx.stream_id,
                    "Ignoring unsupported message type {}",
                    other
                );
                Ok(())
            }
        }
    }
}

/// How many envelopes to read from an inbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Read one envelope, then leave the stream to the handler
    Single,
    /// Keep reading until the stream or connection ends
    UntilClosed,
}

/// Read envelopes from an inbound stream and dispatch each to `handler`
///
/// Malformed input is answered with `err_invalid_payload` addressed to the
/// stream initiator and is not dispatched.
pub(crate) async fn serve_stream<S>(
    stream: S,
    handler: Arc<dyn StreamHandler>,
    endpoint: Arc<str>,
    peer: SocketAddr,
    shutdown: CancellationToken,
    mode: ReadMode,
) where
    S: TransportStream + 'static,
{
    let stream_id = stream.stream_id();
    let initiator = stream.initiator();
    let (send, mut recv) = stream.split();
    let responder = Responder::new(Box::new(send));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = recv.recv_message() => next,
        };

        match next {
            Ok(Some(message)) => {
                let ctx = StreamContext {
                    endpoint: endpoint.clone(),
                    peer,
                    stream_id,
                    initiator,
                    shutdown: shutdown.clone(),
                };
                let handler = handler.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let message_type = message.message_type;
                    if let Err(e) = handler.handle(ctx, responder, message).await {
                        warn!(
                            peer = %peer,
                            stream_id,
                            "Handler failed for {}: {}",
                            message_type,
                            e
                        );
                    }
                });
            }
            Ok(None) => {
                debug!(endpoint = %endpoint, peer = %peer, stream_id, "Stream finished by peer");
                break;
            }
            Err(e) => match e.kind() {
                FailureKind::Malformed => {
                    error!(
                        endpoint = %endpoint,
                        peer = %peer,
                        stream_id,
                        "Error decoding message: {}",
                        e
                    );
                    let reply = Message::invalid_payload(initiator.as_str());
                    if let Err(e) = responder.send(&reply).await {
                        warn!(peer = %peer, stream_id, "Failed to report invalid payload: {}", e);
                        break;
                    }
                }
                FailureKind::IdleTimeout => {
                    info!(endpoint = %endpoint, peer = %peer, "Client idle timeout");
                    break;
                }
                FailureKind::GracefulClose => {
                    info!(endpoint = %endpoint, peer = %peer, stream_id, "Client closed stream");
                    break;
                }
                FailureKind::Fatal | FailureKind::Other => {
                    error!(endpoint = %endpoint, peer = %peer, stream_id, "Stream error: {}", e);
                    break;
                }
            },
        }

        if mode == ReadMode::Single {
            break;
        }
    }
}
