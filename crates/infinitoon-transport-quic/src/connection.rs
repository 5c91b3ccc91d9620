use async_trait::async_trait;
use infinitoon_transport::{TransportConnection, TransportResult};
use quinn::{Connection, ConnectionError, VarInt};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::error;
use crate::stream::QuicStream;

/// An established QUIC connection
///
/// Cloning is cheap; clones share the underlying quinn connection.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    conn: Connection,
    label: String,
}

impl QuicConnection {
    pub fn new(conn: Connection) -> Self {
        let label = format!("quic-{}", conn.stable_id());
        Self { conn, label }
    }

    pub fn inner(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<QuicStream> {
        let (send, recv) = self.conn.open_bi().await.map_err(error::from_connection)?;
        trace!(conn = %self.label, stream = %send.id(), "opened stream");
        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<QuicStream>> {
        let accepted = self.conn.accept_bi().await;

        match accepted {
            Ok((send, recv)) => {
                trace!(conn = %self.label, stream = %send.id(), "accepted stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            Err(ConnectionError::LocallyClosed) => Ok(None),
            Err(e) => {
                debug!(conn = %self.label, "connection ended: {}", e);
                Err(error::from_connection(e))
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(conn = %self.label, code = error_code, "closing: {}", reason);
        self.conn.close(VarInt::from_u32(error_code), reason.as_bytes());
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    fn connection_id(&self) -> String {
        self.label.clone()
    }
}
