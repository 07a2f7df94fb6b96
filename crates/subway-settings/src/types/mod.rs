//! Settings types, grouped by concern.

mod auth;
mod server;
mod websocket;

pub use auth::{AuthSettings, TokenGrant};
pub use server::{LoggingSettings, ServerSettings};
pub use websocket::{KeepAliveMode, MAX_TIMEOUT_MS, TimeoutSetting, WebSocketSettings};

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection protocol settings.
    pub websocket: WebSocketSettings,
    /// Authorization settings.
    pub auth: AuthSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.websocket.validate()
    }
}
