//! Per-connection protocol settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Largest timeout accepted, in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = i32::MAX as u64;

/// A timeout that is either disabled or a number of milliseconds.
///
/// Serialized as the string `"disabled"` or an integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimeoutRepr", into = "TimeoutRepr")]
pub enum TimeoutSetting {
    /// Never fires.
    Disabled,
    /// Fires after this many milliseconds.
    Millis(u64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TimeoutRepr {
    Millis(u64),
    Keyword(String),
}

impl TryFrom<TimeoutRepr> for TimeoutSetting {
    type Error = String;

    fn try_from(value: TimeoutRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            TimeoutRepr::Millis(ms) => Ok(Self::Millis(ms)),
            TimeoutRepr::Keyword(word) => match word.to_ascii_lowercase().as_str() {
                "disabled" | "infinite" | "off" => Ok(Self::Disabled),
                other => other
                    .parse::<u64>()
                    .map(Self::Millis)
                    .map_err(|_| format!("expected \"disabled\" or milliseconds, got {word:?}")),
            },
        }
    }
}

impl From<TimeoutSetting> for TimeoutRepr {
    fn from(value: TimeoutSetting) -> Self {
        match value {
            TimeoutSetting::Disabled => Self::Keyword("disabled".into()),
            TimeoutSetting::Millis(ms) => Self::Millis(ms),
        }
    }
}

impl TimeoutSetting {
    /// Check the value is disabled or strictly positive and representable.
    pub fn validate(self, name: &str) -> Result<()> {
        match self {
            Self::Disabled => Ok(()),
            Self::Millis(0) => Err(SettingsError::InvalidValue(format!(
                "{name} must be \"disabled\" or a positive duration"
            ))),
            Self::Millis(ms) if ms > MAX_TIMEOUT_MS => Err(SettingsError::InvalidValue(format!(
                "{name} must not exceed {MAX_TIMEOUT_MS} ms (got {ms})"
            ))),
            Self::Millis(_) => Ok(()),
        }
    }

    /// Validate and convert; `None` means disabled.
    pub fn resolve(self, name: &str) -> Result<Option<Duration>> {
        self.validate(name)?;
        Ok(match self {
            Self::Disabled => None,
            Self::Millis(ms) => Some(Duration::from_millis(ms)),
        })
    }
}

/// How keep-alive messages are scheduled once a connection is initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMode {
    /// Send on a fixed cadence regardless of other traffic.
    #[default]
    Fixed,
    /// Send only after the connection has been silent for the interval.
    IdleAdaptive,
}

/// Protocol settings applied to every connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// How long to wait for `connection_init` before closing with 4408.
    pub connection_init_wait_timeout: TimeoutSetting,
    /// Keep-alive interval once initialized.
    pub keep_alive_timeout: TimeoutSetting,
    /// Keep-alive scheduling.
    pub keep_alive_mode: KeepAliveMode,
    /// Replace an active operation when `start` reuses its id.
    pub overwrite_duplicate_ids: bool,
    /// End an operation when its event stream reports an error event.
    pub disconnect_after_error_event: bool,
    /// End an operation when any result it delivers carries errors.
    pub disconnect_after_any_error: bool,
    /// Outbound queue capacity; `None` for unbounded.
    pub writer_capacity: Option<usize>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connection_init_wait_timeout: TimeoutSetting::Millis(10_000),
            keep_alive_timeout: TimeoutSetting::Disabled,
            keep_alive_mode: KeepAliveMode::Fixed,
            overwrite_duplicate_ids: false,
            disconnect_after_error_event: true,
            disconnect_after_any_error: false,
            writer_capacity: Some(1024),
        }
    }
}

impl WebSocketSettings {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        self.connection_init_wait_timeout
            .validate("connection_init_wait_timeout")?;
        self.keep_alive_timeout.validate("keep_alive_timeout")?;
        if self.writer_capacity == Some(0) {
            return Err(SettingsError::InvalidValue(
                "writer_capacity must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Resolved connection-init wait; `None` when disabled.
    pub fn init_wait_timeout(&self) -> Result<Option<Duration>> {
        self.connection_init_wait_timeout
            .resolve("connection_init_wait_timeout")
    }

    /// Resolved keep-alive interval; `None` when disabled.
    pub fn keep_alive_interval(&self) -> Result<Option<Duration>> {
        self.keep_alive_timeout.resolve("keep_alive_timeout")
    }
}
