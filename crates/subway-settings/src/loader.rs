//! Layered settings loading.
//!
//! Loading flow (later layers win):
//! 1. Compiled [`GatewaySettings::default()`]
//! 2. `~/.subway/settings.json`, if present
//! 3. `SUBWAY_*` environment variables, with `__` separating sections
//!    (e.g. `SUBWAY_WEBSOCKET__KEEP_ALIVE_TIMEOUT=15000`)
//!
//! The merged result is validated before it is returned.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SUBWAY_";

/// Resolve the path to the settings file (`~/.subway/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".subway").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file contributes nothing; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    let settings: GatewaySettings = figment(path).extract()?;
    settings.validate()?;
    Ok(settings)
}

/// The layered provider stack, exposed for callers that add their own layers.
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(GatewaySettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
