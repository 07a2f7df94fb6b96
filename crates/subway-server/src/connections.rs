//! Live connection bookkeeping.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::controller::ConnectionController;

/// Tracks every open connection so the server can report on them and wait
/// for them to drain at shutdown.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: DashMap<String, Arc<ConnectionController>>,
    idle: Notify,
}

impl ConnectionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn add(&self, controller: Arc<ConnectionController>) {
        let id = controller.id().to_owned();
        if self.connections.insert(id.clone(), controller).is_some() {
            debug!(connection_id = %id, "replaced tracked connection");
        }
    }

    /// Forget a connection. Wakes [`wait_idle`](Self::wait_idle) callers once
    /// none remain.
    pub fn remove(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() && self.connections.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Open connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Active operations across all connections.
    pub fn active_operations(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.value().registry().len())
            .sum()
    }

    /// Ids of the open connections.
    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down every tracked connection.
    pub fn dispose_all(&self) {
        for entry in &self.connections {
            entry.value().dispose();
        }
    }

    /// Resolves once no connection is tracked.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.connections.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("connections", &self.count())
            .finish_non_exhaustive()
    }
}
