//! Outbound tunnel endpoint
//!
//! A client dials one relay, keeps a single long-lived primary stream for
//! request/response exchanges (heartbeats included) and optionally serves
//! streams the relay opens towards it.

use async_trait::async_trait;
use infinitoon_proto::{EchoPayload, Message, Payload};
use infinitoon_transport::{
    FailureKind, TransportConnection, TransportConnector, TransportFactory, TransportStream,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{serve_stream, ReadMode, StreamHandler};
use crate::retry::Retry;
use crate::{ClientConfig, TunnelError};

/// Lifecycle of a client endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Dialing,
    Connected,
    Streaming,
    Closed,
}

/// Operations of an outbound endpoint
#[async_trait]
pub trait TunnelClient: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Dial the relay until a connection and primary stream are up
    ///
    /// Dial and stream failures are retried forever with the configured
    /// delay. Only shutdown ends the loop early, with [`TunnelError::Shutdown`].
    async fn setup(&self) -> Result<(), TunnelError>;

    /// Write `message` on the primary stream and read exactly one reply
    async fn send_message(&self, message: &Message) -> Result<Message, TunnelError>;

    /// Serve streams opened by the relay until the connection ends
    async fn stream(&self, handler: Arc<dyn StreamHandler>) -> Result<(), TunnelError>;

    /// Close the primary stream and the connection
    async fn shutdown_client(&self) -> Result<(), TunnelError>;
}

/// Write one envelope and read the next one as its reply
pub(crate) async fn exchange<S: TransportStream>(
    stream: &mut S,
    message: &Message,
) -> Result<Message, TunnelError> {
    stream.send_message(message).await?;
    stream.recv_message().await?.ok_or(TunnelError::NoReply)
}

struct ClientShared<C: TransportConnection> {
    config: ClientConfig,
    name: Arc<str>,
    connection: Mutex<Option<Arc<C>>>,
    primary: Mutex<Option<C::Stream>>,
    state: watch::Sender<ClientState>,
    shutdown: CancellationToken,
}

impl<C: TransportConnection> ClientShared<C> {
    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(client = %self.name, "State {:?} -> {:?}", previous, state);
        }
    }

    async fn send_message(&self, message: &Message) -> Result<Message, TunnelError> {
        let mut primary = self.primary.lock().await;
        let stream = primary.as_mut().ok_or(TunnelError::NotConnected)?;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TunnelError::Shutdown),
            reply = exchange(stream, message) => reply,
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // First tick completes immediately
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let request = match EchoPayload::new(self.name.as_ref()).encode_request() {
                Ok(request) => request,
                Err(e) => {
                    error!(client = %self.name, "Failed to encode echo: {}", e);
                    continue;
                }
            };

            match self.send_message(&request).await {
                Ok(reply) => match EchoPayload::decode_response(&reply) {
                    Ok(echo) => info!(client = %self.name, "echo: {}", echo.message),
                    Err(e) => warn!(client = %self.name, "Unexpected echo reply: {}", e),
                },
                Err(TunnelError::Shutdown) => break,
                Err(e) => warn!(client = %self.name, "Heartbeat failed: {}", e),
            }
        }

        debug!(client = %self.name, "Heartbeat stopped");
    }

    async fn stream(&self, handler: Arc<dyn StreamHandler>) -> Result<(), TunnelError> {
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or(TunnelError::NotConnected)?;
        let peer = connection.remote_address();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = connection.accept_stream() => accepted,
            };

            match accepted {
                Ok(Some(stream)) => {
                    debug!(client = %self.name, stream_id = stream.stream_id(), "Accepted stream from relay");
                    tokio::spawn(serve_stream(
                        stream,
                        handler.clone(),
                        self.name.clone(),
                        peer,
                        self.shutdown.clone(),
                        ReadMode::Single,
                    ));
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    return match e.kind() {
                        FailureKind::GracefulClose | FailureKind::IdleTimeout => {
                            info!(client = %self.name, peer = %peer, "Relay connection ended: {}", e);
                            Ok(())
                        }
                        _ => {
                            error!(client = %self.name, peer = %peer, "Relay connection failed: {}", e);
                            Err(e.into())
                        }
                    };
                }
            }
        }
    }
}

/// Outbound endpoint over any transport
pub struct Client<F: TransportFactory> {
    shared: Arc<ClientShared<F::Connection>>,
    connector: F::Connector,
    inbound: Option<Arc<dyn StreamHandler>>,
}

impl<F: TransportFactory> Client<F> {
    pub fn new(
        factory: &F,
        config: ClientConfig,
        transport: Arc<F::Config>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;

        let connector = factory
            .create_connector(transport)
            .map_err(|e| TunnelError::Configuration(e.to_string()))?;

        let (state, _) = watch::channel(ClientState::Idle);

        Ok(Self {
            shared: Arc::new(ClientShared {
                name: Arc::from(config.name.as_str()),
                config,
                connection: Mutex::new(None),
                primary: Mutex::new(None),
                state,
                shutdown: CancellationToken::new(),
            }),
            connector,
            inbound: None,
        })
    }

    /// Serve relay-initiated streams with `handler` once connected
    pub fn with_inbound_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.inbound = Some(handler);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client reaches `target`
    pub async fn wait_for_state(&self, target: ClientState) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only ends on a match
        let _ = rx.wait_for(|state| *state == target).await;
    }

    async fn connect_once(&self) -> Result<(), TunnelError> {
        let config = &self.shared.config;
        let addr = config.resolve().await?;

        let connection = self.connector.connect(addr, config.tls_server_name()).await?;
        self.shared.set_state(ClientState::Connected);

        let stream = match connection.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                connection.close(0, "close normal").await;
                return Err(e.into());
            }
        };

        // Same lock order as shutdown_client, which cancels before locking
        let mut primary = self.shared.primary.lock().await;
        let mut slot = self.shared.connection.lock().await;
        if self.shared.shutdown.is_cancelled() {
            connection.close(0, "close normal").await;
            return Err(TunnelError::Shutdown);
        }
        *primary = Some(stream);
        *slot = Some(Arc::new(connection));
        self.shared.set_state(ClientState::Streaming);

        info!(client = %self.shared.name, relay = %addr, "Connected to relay");
        Ok(())
    }
}

#[async_trait]
impl<F: TransportFactory> TunnelClient for Client<F> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn setup(&self) -> Result<(), TunnelError> {
        let shutdown = self.shared.shutdown.clone();
        if shutdown.is_cancelled() {
            return Err(TunnelError::Shutdown);
        }

        let mut retry = Retry::new(self.shared.config.retry_delay);

        loop {
            self.shared.set_state(ClientState::Dialing);

            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(TunnelError::Shutdown),
                attempt = self.connect_once() => attempt,
            };

            let result = match attempt {
                Ok(()) => break,
                Err(TunnelError::Shutdown) => Err(TunnelError::Shutdown),
                Err(e) => {
                    warn!(
                        client = %self.shared.name,
                        attempt = retry.attempt() + 1,
                        "Failed to connect: {}; retrying in {:?}",
                        e,
                        self.shared.config.retry_delay
                    );
                    retry.wait(&shutdown).await
                }
            };

            if let Err(e) = result {
                self.shared.set_state(ClientState::Closed);
                return Err(e);
            }
        }

        tokio::spawn(self.shared.clone().heartbeat());

        if let Some(handler) = &self.inbound {
            let shared = self.shared.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.stream(handler).await {
                    warn!(client = %shared.name, "Inbound streams stopped: {}", e);
                }
            });
        }

        Ok(())
    }

    async fn send_message(&self, message: &Message) -> Result<Message, TunnelError> {
        self.shared.send_message(message).await
    }

    async fn stream(&self, handler: Arc<dyn StreamHandler>) -> Result<(), TunnelError> {
        self.shared.stream(handler).await
    }

    async fn shutdown_client(&self) -> Result<(), TunnelError> {
        self.shared.shutdown.cancel();

        if let Some(mut stream) = self.shared.primary.lock().await.take() {
            if let Err(e) = stream.finish().await {
                debug!(client = %self.shared.name, "Primary stream already closed: {}", e);
            }
        }

        if let Some(connection) = self.shared.connection.lock().await.take() {
            connection.close(0, "close normal").await;
        }

        self.shared.set_state(ClientState::Closed);
        info!(client = %self.shared.name, "Client shut down");
        Ok(())
    }
}

impl<F: TransportFactory> fmt::Debug for Client<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
