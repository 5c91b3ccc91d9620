//! Transport abstraction layer for tunnel endpoints
//!
//! Tunnel clients and relays are generic over these traits. Any transport
//! that offers encrypted connections with many ordered streams fits.
//!
//! Two implementations exist: `infinitoon-transport-quic` for real
//! deployments and the in-process `memory` transport (feature `memory`)
//! used by endpoint tests.
//!
//! Every stream carries [`Message`] envelopes. Failures are classified with
//! [`TransportError::kind`] so endpoints can tell a peer's graceful close from
//! an idle timeout, a malformed frame, or a real fault.

use async_trait::async_trait;
use bytes::Bytes;
use infinitoon_proto::Message;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

/// Errors raised by transports
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Closed by peer (code {code}): {reason}")]
    ClosedByPeer { code: u64, reason: String },

    #[error("Idle timeout: no recent network activity")]
    IdleTimeout,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// How an endpoint should react to a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Peer closed with application code 0, or the stream simply ended
    GracefulClose,
    /// No network activity within the idle timeout
    IdleTimeout,
    /// The peer sent bytes that are not a valid envelope
    Malformed,
    /// Cannot be retried (bind, TLS or configuration failures)
    Fatal,
    /// Anything else; treated as connection loss
    Other,
}

impl TransportError {
    /// Classify this error
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::ClosedByPeer { code: 0, .. }
            | TransportError::StreamClosed
            | TransportError::ListenerClosed => FailureKind::GracefulClose,
            TransportError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                FailureKind::GracefulClose
            }
            TransportError::IdleTimeout => FailureKind::IdleTimeout,
            TransportError::MalformedMessage(_) => FailureKind::Malformed,
            TransportError::BindFailed { .. }
            | TransportError::TlsError(_)
            | TransportError::ConfigurationError(_) => FailureKind::Fatal,
            _ => FailureKind::Other,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// The side of a connection that opened a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSide {
    Client,
    Server,
}

impl StreamSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSide::Client => "client",
            StreamSide::Server => "server",
        }
    }
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write half of a stream
#[async_trait]
pub trait StreamSender: Send + Sync + Debug {
    /// Send one envelope
    async fn send_message(&mut self, message: &Message) -> TransportResult<()>;

    /// Send raw bytes, bypassing envelope encoding
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Signal end of data to the peer; idempotent
    async fn finish(&mut self) -> TransportResult<()>;

    fn stream_id(&self) -> u64;
}

/// Read half of a stream
#[async_trait]
pub trait StreamReceiver: Send + Sync + Debug {
    /// Receive one envelope
    ///
    /// Returns `None` once the peer has finished the stream. A frame that
    /// cannot be decoded yields [`TransportError::MalformedMessage`] and the
    /// buffered bytes are discarded so the next call starts on fresh input.
    async fn recv_message(&mut self) -> TransportResult<Option<Message>>;

    fn stream_id(&self) -> u64;
}

/// Ordered bidirectional envelope channel
///
/// Envelopes on one stream are strictly ordered. A stream can be split into
/// independently owned halves so one task keeps reading while others write.
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    type SendHalf: StreamSender + 'static;
    type RecvHalf: StreamReceiver + 'static;

    /// Send an envelope on this stream
    async fn send_message(&mut self, message: &Message) -> TransportResult<()>;

    /// Receive an envelope from this stream
    ///
    /// Same contract as [`StreamReceiver::recv_message`].
    async fn recv_message(&mut self) -> TransportResult<Option<Message>>;

    /// Send raw bytes (for protocol-level data that doesn't use envelopes)
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Up to `max_size` raw bytes; empty once the peer finished
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;

    async fn finish(&mut self) -> TransportResult<()>;

    /// Unique within the connection
    fn stream_id(&self) -> u64;

    /// Which side of the connection opened this stream
    fn initiator(&self) -> StreamSide;

    /// Both directions are done
    fn is_closed(&self) -> bool;

    /// Split into send and receive halves
    fn split(self) -> (Self::SendHalf, Self::RecvHalf)
    where
        Self: Sized;
}

/// One multiplexed connection between a tunnel client and a relay
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    type Stream: TransportStream + 'static;

    /// Open a stream; the peer sees it once something is written
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Next stream opened by the peer
    ///
    /// Returns `None` once this side closed the connection. Closure by the
    /// peer, idle timeout and other failures are returned as errors so the
    /// caller can classify them.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close with an application code; the peer treats code 0 as graceful
    async fn close(&self, error_code: u32, reason: &str);

    fn is_closed(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Stable label used in logs and as registry key
    fn connection_id(&self) -> String;
}

/// Relay side: accepts connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection + 'static;

    /// Next established connection and its peer address
    ///
    /// Fails with [`TransportError::ListenerClosed`] once the listener is closed.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting; pending and future `accept` calls fail
    async fn close(&self);
}

/// Tunnel side: dials relays
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection + 'static;

    /// Dial `addr`, verifying the relay as `server_name`
    async fn connect(&self, addr: SocketAddr, server_name: &str)
        -> TransportResult<Self::Connection>;
}

/// TLS settings shared by every transport
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// `false` accepts any relay certificate
    pub verify_server_cert: bool,

    /// DER trust anchors replacing the built-in roots when non-empty
    pub root_certs: Vec<Vec<u8>>,

    /// ALPN identifiers offered in the handshake
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec!["infinitoon-tunnel".to_string()],
        }
    }
}

/// Settings type of a transport
pub trait TransportConfig: Send + Sync + Debug {
    fn security_config(&self) -> &TransportSecurityConfig;

    /// Reject settings the transport cannot honor
    fn validate(&self) -> TransportResult<()>;
}

/// Builds listeners and connectors for one transport
pub trait TransportFactory: Send + Sync + Debug + 'static {
    type Listener: TransportListener<Connection = Self::Connection> + 'static;

    type Connector: TransportConnector<Connection = Self::Connection> + 'static;

    type Connection: TransportConnection + 'static;

    type Config: TransportConfig + 'static;

    fn create_listener(
        &self,
        bind_addr: SocketAddr,
        config: Arc<Self::Config>,
    ) -> TransportResult<Self::Listener>;

    fn create_connector(&self, config: Arc<Self::Config>) -> TransportResult<Self::Connector>;

    /// Short name for logs, e.g. `QUIC`
    fn name(&self) -> &str;

    fn is_encrypted(&self) -> bool;
}
