//! quinn endpoints: relay-side listener and tunnel-side connector

use async_trait::async_trait;
use infinitoon_transport::{
    TransportConfig, TransportConnector, TransportError, TransportListener, TransportResult,
};
use quinn::Endpoint;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;
use crate::error;

/// Accepts tunnel connections on a bound UDP socket
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let endpoint = Endpoint::server(config.build_server_config()?, bind_addr)
            .map_err(|source| TransportError::BindFailed {
                addr: bind_addr,
                source,
            })?;

        info!(addr = ?endpoint.local_addr().ok(), "QUIC listener bound");
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(QuicConnection, SocketAddr)> {
        // A failed handshake only affects that peer
        while let Some(incoming) = self.endpoint.accept().await {
            let peer = incoming.remote_address();
            match incoming.await {
                Ok(conn) => {
                    debug!(peer = %peer, "QUIC handshake complete");
                    return Ok((QuicConnection::new(conn), peer));
                }
                Err(e) => warn!(peer = %peer, "QUIC handshake failed: {}", e),
            }
        }
        Err(TransportError::ListenerClosed)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"close normal");
        debug!("QUIC listener closed");
    }
}

/// Dials relays from an unspecified local port
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(config.build_client_config()?);
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<QuicConnection> {
        let conn = self
            .endpoint
            .connect(addr, server_name)
            .map_err(error::from_connect)?
            .await
            .map_err(error::from_connection)?;

        debug!(peer = %addr, server_name, "QUIC connection established");
        Ok(QuicConnection::new(conn))
    }
}
