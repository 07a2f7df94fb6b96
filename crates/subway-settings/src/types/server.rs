//! HTTP listener and logging settings.

use serde::{Deserialize, Serialize};

/// Network listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` to auto-assign).
    pub port: u16,
    /// Route serving WebSocket upgrades.
    pub path: String,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Grace period for draining connections on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            path: "/graphql".to_string(),
            max_message_size: 4 * 1024 * 1024, // 4 MB
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
