//! Named collection of tunnel endpoints started and stopped together

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{TunnelClient, TunnelError, TunnelServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Client,
    Server,
}

/// Tasks spawned by [`Tunnel::start`]
#[derive(Debug)]
pub struct TunnelHandles {
    tasks: JoinSet<(EndpointKind, String, Result<(), TunnelError>)>,
}

impl TunnelHandles {
    /// Number of endpoint tasks still tracked
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Registry of clients and servers keyed by logical name
///
/// Populated before [`Tunnel::start`]; adding requires `&mut self`, so the
/// set of endpoints cannot change while they run.
#[derive(Default)]
pub struct Tunnel {
    clients: HashMap<String, Arc<dyn TunnelClient>>,
    servers: HashMap<String, Arc<dyn TunnelServer>>,
}

impl Tunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; an existing client with the same key is replaced
    pub fn add_client(&mut self, key: impl Into<String>, client: Arc<dyn TunnelClient>) {
        self.clients.insert(key.into(), client);
    }

    /// Register a server; an existing server with the same key is replaced
    pub fn add_server(&mut self, key: impl Into<String>, server: Arc<dyn TunnelServer>) {
        self.servers.insert(key.into(), server);
    }

    pub fn get_client(&self, key: &str) -> Option<Arc<dyn TunnelClient>> {
        self.clients.get(key).cloned()
    }

    pub fn get_server(&self, key: &str) -> Option<Arc<dyn TunnelServer>> {
        self.servers.get(key).cloned()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Start every endpoint on its own task
    ///
    /// Clients run `setup`, servers run `start_server`. A failing endpoint is
    /// logged and never affects the others.
    pub fn start(&self) -> TunnelHandles {
        let mut tasks = JoinSet::new();

        for (key, client) in &self.clients {
            let key = key.clone();
            let client = client.clone();
            tasks.spawn(async move {
                info!(client = %key, "Starting tunnel client");
                let result = client.setup().await;
                match &result {
                    Ok(()) => info!(client = %key, "Tunnel client started"),
                    Err(e) => error!(client = %key, "Failed to start tunnel client: {}", e),
                }
                (EndpointKind::Client, key, result)
            });
        }

        for (key, server) in &self.servers {
            let key = key.clone();
            let server = server.clone();
            tasks.spawn(async move {
                info!(server = %key, "Starting tunnel server");
                let result = server.start_server().await;
                if let Err(e) = &result {
                    error!(server = %key, "Failed to start tunnel server: {}", e);
                }
                (EndpointKind::Server, key, result)
            });
        }

        TunnelHandles { tasks }
    }

    /// Wait for the endpoint tasks
    ///
    /// Returns the first fatal server error as soon as it happens; the other
    /// endpoints keep running in the background. Otherwise returns once every
    /// task has finished.
    pub async fn join(mut handles: TunnelHandles) -> Result<(), TunnelError> {
        while let Some(joined) = handles.tasks.join_next().await {
            match joined {
                Ok((EndpointKind::Server, key, Err(e))) if e.is_fatal() => {
                    error!(server = %key, "Tunnel server failed: {}", e);
                    handles.tasks.detach_all();
                    return Err(e);
                }
                Ok(_) => {}
                Err(e) => error!("Tunnel endpoint task panicked: {}", e),
            }
        }

        Ok(())
    }

    /// Shut every endpoint down
    ///
    /// Every endpoint is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> Result<(), TunnelError> {
        let mut first_error = None;

        for (key, client) in &self.clients {
            info!(client = %key, "Shutting down tunnel client");
            if let Err(e) = client.shutdown_client().await {
                warn!(client = %key, "Failed to shut down tunnel client: {}", e);
                first_error.get_or_insert(e);
            }
        }

        for (key, server) in &self.servers {
            info!(server = %key, "Shutting down tunnel server");
            if let Err(e) = server.shutdown_server().await {
                warn!(server = %key, "Failed to shut down tunnel server: {}", e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("clients", &self.client_names())
            .field("servers", &self.server_names())
            .finish()
    }
}
