//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Returns the handle used to render `/metrics`. Call once at startup, before
/// any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connections closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Operations accepted for execution (counter).
pub const OPERATIONS_STARTED_TOTAL: &str = "operations_started_total";
/// Operations with a live event stream (gauge).
pub const OPERATIONS_ACTIVE: &str = "operations_active";
/// Error messages sent for operations (counter, labels: kind).
pub const OPERATION_ERRORS_TOTAL: &str = "operation_errors_total";
/// Keep-alive messages sent (counter).
pub const KEEP_ALIVES_SENT_TOTAL: &str = "keep_alives_sent_total";
/// Outbound messages dropped because the transport was closed (counter).
pub const WRITER_DROPPED_MESSAGES_TOTAL: &str = "writer_dropped_messages_total";
