//! Inbound relay endpoint

use async_trait::async_trait;
use infinitoon_proto::Message;
use infinitoon_transport::{
    FailureKind, TransportConnection, TransportError, TransportFactory, TransportListener,
    TransportStream,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::exchange;
use crate::handler::{serve_stream, ReadMode, StreamHandler};
use crate::registry::ConnectionRegistry;
use crate::{ServerConfig, TunnelError};

/// Operations of an inbound endpoint
#[async_trait]
pub trait TunnelServer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Bind, then accept connections until shutdown
    ///
    /// Fails only when the listener cannot be created; per-connection
    /// problems are logged and never end the accept loop.
    async fn start_server(&self) -> Result<(), TunnelError>;

    /// Open a new stream to the connected client `conn_key` and exchange one
    /// request/reply pair on it
    async fn send_message(&self, conn_key: &str, message: &Message)
        -> Result<Message, TunnelError>;

    /// Stop accepting and close every client connection
    async fn shutdown_server(&self) -> Result<(), TunnelError>;
}

/// Inbound endpoint over any transport
pub struct Server<F: TransportFactory> {
    factory: F,
    config: ServerConfig,
    transport: Arc<F::Config>,
    handler: Arc<dyn StreamHandler>,
    name: Arc<str>,
    listener: Mutex<Option<Arc<F::Listener>>>,
    registry: Arc<ConnectionRegistry<F::Connection>>,
    local_addr: watch::Sender<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl<F: TransportFactory> Server<F> {
    pub fn new(
        factory: F,
        config: ServerConfig,
        transport: Arc<F::Config>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let (local_addr, _) = watch::channel(None);

        Self {
            factory,
            name: Arc::from(config.name.as_str()),
            config,
            transport,
            handler,
            listener: Mutex::new(None),
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.borrow()
    }

    /// Wait until the listener is bound
    pub async fn wait_listening(&self) -> Result<SocketAddr, TunnelError> {
        let mut rx = self.local_addr.subscribe();
        let addr = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TunnelError::Shutdown)?;
        (*addr).ok_or(TunnelError::Shutdown)
    }

    /// Remote addresses of the connected clients
    pub fn connected_clients(&self) -> Vec<String> {
        self.registry.keys()
    }

    pub fn is_connected(&self, conn_key: &str) -> bool {
        self.registry.contains(conn_key)
    }

    fn bind(&self, addr: SocketAddr) -> Result<F::Listener, TunnelError> {
        self.factory
            .create_listener(addr, self.transport.clone())
            .map_err(|source| match source {
                TransportError::ConfigurationError(msg) | TransportError::TlsError(msg) => {
                    TunnelError::Configuration(msg)
                }
                source => TunnelError::Bind {
                    addr: addr.to_string(),
                    source,
                },
            })
    }
}

async fn serve_connection<C>(
    connection: Arc<C>,
    registry: Arc<ConnectionRegistry<C>>,
    handler: Arc<dyn StreamHandler>,
    server: Arc<str>,
    shutdown: CancellationToken,
) where
    C: TransportConnection + 'static,
{
    let peer = connection.remote_address();
    info!(server = %server, client = %peer, "new client connected to server");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                connection.close(0, "close normal").await;
                break;
            }
            accepted = connection.accept_stream() => accepted,
        };

        match accepted {
            Ok(Some(stream)) => {
                debug!(server = %server, client = %peer, stream_id = stream.stream_id(), "Accepted stream");
                tokio::spawn(serve_stream(
                    stream,
                    handler.clone(),
                    server.clone(),
                    peer,
                    shutdown.clone(),
                    ReadMode::UntilClosed,
                ));
            }
            Ok(None) => {
                debug!(server = %server, client = %peer, "Connection closed locally");
                break;
            }
            Err(e) => {
                match e.kind() {
                    FailureKind::GracefulClose => {
                        info!(server = %server, client = %peer, "Client closed session")
                    }
                    FailureKind::IdleTimeout => {
                        info!(server = %server, client = %peer, "Client idle timeout")
                    }
                    _ => error!(server = %server, client = %peer, "Client error: {}", e),
                }
                break;
            }
        }
    }

    registry.unregister(&connection);
    info!(server = %server, client = %peer, "client disconnected");
}

#[async_trait]
impl<F: TransportFactory> TunnelServer for Server<F> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_server(&self) -> Result<(), TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Shutdown);
        }

        // Nothing can be listened on until the configuration changes
        let addr = self
            .config
            .resolve()
            .await
            .map_err(|e| TunnelError::Configuration(format!("Cannot listen: {}", e)))?;
        let listener = Arc::new(self.bind(addr)?);
        let local_addr = listener.local_addr()?;

        *self.listener.lock().await = Some(listener.clone());
        self.local_addr.send_replace(Some(local_addr));

        info!(server = %self.name, addr = %local_addr, "Server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((connection, _)) => {
                    let connection = Arc::new(connection);
                    self.registry.register(connection.clone());

                    tokio::spawn(serve_connection(
                        connection,
                        self.registry.clone(),
                        self.handler.clone(),
                        self.name.clone(),
                        self.shutdown.clone(),
                    ));
                }
                Err(TransportError::ListenerClosed) => break,
                Err(e) if e.kind() == FailureKind::Fatal => {
                    error!(server = %self.name, "Accept failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(server = %self.name, "Accept failed: {}", e);
                }
            }
        }

        info!(server = %self.name, "Server stopped accepting connections");
        Ok(())
    }

    async fn send_message(
        &self,
        conn_key: &str,
        message: &Message,
    ) -> Result<Message, TunnelError> {
        let connection = self
            .registry
            .get(conn_key)
            .ok_or_else(|| TunnelError::ClientNotFound(conn_key.to_string()))?;

        let mut stream = connection.open_stream().await?;

        let reply = tokio::select! {
            _ = self.shutdown.cancelled() => Err(TunnelError::Shutdown),
            reply = exchange(&mut stream, message) => reply,
        }?;

        if let Err(e) = stream.finish().await {
            debug!(server = %self.name, client = %conn_key, "Failed to finish stream: {}", e);
        }

        Ok(reply)
    }

    async fn shutdown_server(&self) -> Result<(), TunnelError> {
        self.shutdown.cancel();

        if let Some(listener) = self.listener.lock().await.take() {
            listener.close().await;
        }

        for connection in self.registry.drain() {
            connection.close(0, "close normal").await;
        }

        info!(server = %self.name, "Server shut down");
        Ok(())
    }
}

impl<F: TransportFactory> fmt::Debug for Server<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr())
            .field("clients", &self.registry.len())
            .finish()
    }
}
