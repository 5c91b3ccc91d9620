//! QUIC transport for tunnel endpoints, built on quinn
//!
//! Connections are TLS 1.3 with the `ring` provider. Keep-alive, idle
//! timeout and stream limits come from [`QuicConfig`].
//!
//! ```no_run
//! use infinitoon_transport::TransportFactory;
//! use infinitoon_transport_quic::{QuicConfig, QuicTransportFactory};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = QuicTransportFactory::new();
//!
//! let relay = Arc::new(QuicConfig::server_default("relay.crt", "relay.key")?);
//! let _listener = factory.create_listener("0.0.0.0:54321".parse()?, relay)?;
//!
//! let tunnel = Arc::new(QuicConfig::client_default());
//! let _connector = factory.create_connector(tunnel)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
mod error;
pub mod stream;

pub use config::{QuicConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_KEEP_ALIVE};
pub use connection::QuicConnection;
pub use endpoint::{QuicConnector, QuicListener};
pub use stream::{QuicRecvHalf, QuicSendHalf, QuicStream};

use infinitoon_transport::{TransportFactory, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// [`TransportFactory`] producing quinn endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct QuicTransportFactory;

impl QuicTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for QuicTransportFactory {
    type Listener = QuicListener;
    type Connector = QuicConnector;
    type Connection = QuicConnection;
    type Config = QuicConfig;

    fn create_listener(
        &self,
        bind_addr: SocketAddr,
        config: Arc<QuicConfig>,
    ) -> TransportResult<QuicListener> {
        QuicListener::new(bind_addr, config)
    }

    fn create_connector(&self, config: Arc<QuicConfig>) -> TransportResult<QuicConnector> {
        QuicConnector::new(config)
    }

    fn name(&self) -> &str {
        "QUIC"
    }

    fn is_encrypted(&self) -> bool {
        true
    }
}
