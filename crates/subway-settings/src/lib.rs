//! # subway-settings
//!
//! Configuration management with layered sources for the Subway gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`GatewaySettings::default()`]
//! 2. **User file** — `~/.subway/settings.json`
//! 3. **Environment variables** — `SUBWAY_*` overrides (highest priority)
//!
//! Timeouts are validated eagerly: a zero or out-of-range duration is a
//! [`SettingsError::InvalidValue`] at load time rather than a surprise on the
//! first connection.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<GatewaySettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.subway/settings.json` with env var
/// overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static GatewaySettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            GatewaySettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns `Err(settings)` if they were already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: GatewaySettings) -> std::result::Result<(), GatewaySettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = GatewaySettings::default();
        let _path = settings_path();
        let _mode = KeepAliveMode::IdleAdaptive;
    }

    #[test]
    fn init_then_get_returns_same_value() {
        let mut custom = GatewaySettings::default();
        custom.server.port = 4321;
        // Another test may have initialized it first; either way get() is stable.
        let _ = init_settings(custom);
        let first = get_settings();
        let second = get_settings();
        assert!(std::ptr::eq(first, second));
    }
}
