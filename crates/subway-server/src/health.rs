//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has begun.
    pub status: String,
    /// When the server started.
    pub started_at: DateTime<Utc>,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Active operations across all connections.
    pub active_operations: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    started_at: DateTime<Utc>,
    start_time: Instant,
    connections: usize,
    active_operations: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        started_at,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_operations,
    }
}
