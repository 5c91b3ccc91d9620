//! Server-side registry of connected clients
//!
//! Keys are the remote address of each accepted connection. The accept loop
//! inserts, per-connection tasks remove, and `send_message` looks entries up,
//! all concurrently.

use dashmap::DashMap;
use infinitoon_transport::TransportConnection;
use std::sync::Arc;
use tracing::{debug, info};

/// Live connections keyed by remote address
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    connections: DashMap<String, Arc<C>>,
}

impl<C: TransportConnection> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection under its remote address
    ///
    /// A previous entry for the same address is replaced and returned.
    pub fn register(&self, connection: Arc<C>) -> Option<Arc<C>> {
        let key = connection.remote_address().to_string();
        let replaced = self.connections.insert(key.clone(), connection);

        if replaced.is_some() {
            info!(client = %key, "Replaced stale client connection");
        } else {
            debug!(client = %key, "Registered client connection");
        }

        replaced
    }

    /// Remove the entry for `connection`
    ///
    /// Only removes the entry if it still refers to this very connection, so a
    /// late cleanup never evicts a newer connection from the same address.
    pub fn unregister(&self, connection: &C) -> bool {
        let key = connection.remote_address().to_string();
        let id = connection.connection_id();

        let removed = self
            .connections
            .remove_if(&key, |_, current| current.connection_id() == id)
            .is_some();

        if removed {
            debug!(client = %key, "Unregistered client connection");
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<Arc<C>> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Remote addresses of every registered connection
    pub fn keys(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<Arc<C>> {
        let keys = self.keys();
        keys.iter()
            .filter_map(|key| self.connections.remove(key).map(|(_, conn)| conn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<C: TransportConnection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
