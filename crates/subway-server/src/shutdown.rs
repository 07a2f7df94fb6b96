//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Every connection's token is a child of the coordinator's, so one
//! [`ShutdownCoordinator::shutdown`] reaches all of them. Each session then
//! sends a going-away close and tears itself down;
//! [`ShutdownCoordinator::graceful_shutdown`] waits for that, bounded by the
//! grace period.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connections::ConnectionTracker;

/// Grace period when none is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across the listener and all connections.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// A clone of the root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Grace period for draining.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then wait for connections to drain and the listener
    /// task to exit. Connections still open after the grace period are torn
    /// down forcibly.
    pub async fn graceful_shutdown(
        &self,
        connections: &ConnectionTracker,
        listener: Option<JoinHandle<()>>,
    ) {
        self.shutdown();
        info!(
            connections = connections.count(),
            grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
            "draining connections"
        );

        if tokio::time::timeout(self.grace, connections.wait_idle())
            .await
            .is_err()
        {
            warn!(
                remaining = connections.count(),
                "shutdown timed out after {:?}, disposing remaining connections", self.grace
            );
            connections.dispose_all();
        }

        if let Some(handle) = listener {
            if tokio::time::timeout(self.grace, handle).await.is_err() {
                warn!("listener did not stop within {:?}", self.grace);
            }
        }
        info!("shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}
