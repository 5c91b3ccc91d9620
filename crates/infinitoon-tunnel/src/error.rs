use infinitoon_proto::PayloadError;
use infinitoon_transport::TransportError;
use thiserror::Error;

/// Tunnel endpoint errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] PayloadError),

    #[error("Client is not connected")]
    NotConnected,

    #[error("client connection not found: {0}")]
    ClientNotFound(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Endpoint is shutting down")]
    Shutdown,

    #[error("Peer finished the stream without replying")]
    NoReply,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TunnelError {
    /// Whether the endpoint can never recover from this error on its own
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Bind { .. } | TunnelError::Configuration(_)
        )
    }
}
