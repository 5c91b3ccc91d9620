//! Container command running a [`Tunnel`]

use async_trait::async_trait;
use infinitoon_container::Command;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Tunnel;

/// Runs every endpoint of a tunnel as one container command
///
/// `run` starts the endpoints and stays up until `shutdown`. A server that
/// cannot listen ends `run` with an error right away.
#[derive(Debug)]
pub struct TunnelCommand {
    name: String,
    tunnel: Arc<Tunnel>,
    stopped: CancellationToken,
}

impl TunnelCommand {
    pub fn new(name: impl Into<String>, tunnel: Tunnel) -> Self {
        Self {
            name: name.into(),
            tunnel: Arc::new(tunnel),
            stopped: CancellationToken::new(),
        }
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}

#[async_trait]
impl Command for TunnelCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        let handles = self.tunnel.start();
        Tunnel::join(handles).await?;

        // Clients run in the background once connected
        self.stopped.cancelled().await;
        info!(command = %self.name, "Tunnel command stopped");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.stopped.cancel();
        self.tunnel.shutdown().await?;
        Ok(())
    }
}
