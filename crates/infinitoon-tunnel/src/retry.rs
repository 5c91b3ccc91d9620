//! Fixed-delay retry for client dialing

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TunnelError;

/// Retries forever with a constant delay until cancelled
#[derive(Debug)]
pub struct Retry {
    delay: Duration,
    attempt: usize,
}

impl Retry {
    pub fn new(delay: Duration) -> Self {
        Self { delay, attempt: 0 }
    }

    /// Wait before the next attempt
    ///
    /// Returns [`TunnelError::Shutdown`] as soon as `shutdown` is cancelled.
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> Result<(), TunnelError> {
        self.attempt += 1;

        debug!(
            "Waiting {:?} before attempt {}",
            self.delay,
            self.attempt + 1
        );

        tokio::select! {
            _ = shutdown.cancelled() => Err(TunnelError::Shutdown),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }

    /// Number of failed attempts so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
