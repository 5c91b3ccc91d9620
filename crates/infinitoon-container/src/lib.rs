//! Process supervisor for long-running commands
//!
//! A [`Container`] runs every registered [`Command`] on its own task. When one
//! command fails the container raises its cancellation token; siblings may
//! observe it, but nothing is stopped forcibly. [`Container::shutdown`] is the
//! coordinated stop.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use infinitoon_container::{Command, Container};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl Command for Noop {
//!     fn name(&self) -> &str {
//!         "noop"
//!     }
//!
//!     async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&self) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), infinitoon_container::ContainerError> {
//! let mut container = Container::new();
//! container.register_command(Arc::new(Noop));
//! container.run().await?;
//! container.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Container errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("command {name} failed: {source}")]
    CommandFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("command {name} failed to shut down: {source}")]
    ShutdownFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A named background service
#[async_trait]
pub trait Command: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run the service until it finishes or is shut down
    ///
    /// `cancel` is raised when a sibling command fails.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Runs commands concurrently
#[derive(Default)]
pub struct Container {
    commands: Vec<Arc<dyn Command>>,
    cancel: CancellationToken,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command
    ///
    /// A command with the same name replaces the earlier one and takes over
    /// its position in the shutdown order.
    pub fn register_command(&mut self, command: Arc<dyn Command>) {
        match self
            .commands
            .iter_mut()
            .find(|existing| existing.name() == command.name())
        {
            Some(existing) => {
                warn!(command = %command.name(), "Replacing registered command");
                *existing = command;
            }
            None => self.commands.push(command),
        }
    }

    /// Names of the registered commands, in registration order
    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.name().to_string()).collect()
    }

    /// Token raised on the first command failure or on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every command and wait for all of them to finish
    ///
    /// Returns the first command failure, after every task has completed.
    pub async fn run(&self) -> Result<(), ContainerError> {
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for command in &self.commands {
            let command = command.clone();
            let cancel = self.cancel.clone();
            let name = command.name().to_string();
            info!(command = %name, "Starting command");

            let handle = tasks.spawn(async move { command.run(cancel).await });
            names.insert(handle.id(), name);
        }

        let mut first_error = None;

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => (
                    e.id(),
                    Err(anyhow::anyhow!("command task panicked: {}", e)),
                ),
            };
            let name = names.remove(&id).unwrap_or_default();

            match result {
                Ok(()) => info!(command = %name, "Command finished"),
                Err(source) => {
                    error!(command = %name, "Command failed: {:#}", source);
                    self.cancel.cancel();
                    first_error.get_or_insert(ContainerError::CommandFailed { name, source });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Raise cancellation and shut every command down in registration order
    ///
    /// Every command is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> Result<(), ContainerError> {
        self.cancel.cancel();

        let mut first_error = None;

        for command in &self.commands {
            info!(command = %command.name(), "Shutting down command");
            if let Err(source) = command.shutdown().await {
                warn!(command = %command.name(), "Shutdown failed: {:#}", source);
                first_error.get_or_insert(ContainerError::ShutdownFailed {
                    name: command.name().to_string(),
                    source,
                });
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("commands", &self.command_names())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
