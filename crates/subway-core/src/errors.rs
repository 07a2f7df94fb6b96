//! Execution error kinds.
//!
//! Failures are tagged with an [`ErrorKind`] at the site that produces them.
//! Each kind carries a default machine-readable code, and an
//! [`ExecutionError`] maps one-to-one onto the outbound error payload
//! `{ "message", "extensions": { "code" } }`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Message used when operation setup fails with an unexpected error.
pub const SUBSCRIBE_FAILED_MESSAGE: &str = "Unable to set up subscription for the requested field.";

/// Message used when an event stream fails with an unexpected error.
pub const UNHANDLED_MESSAGE: &str = "Unhandled exception";

/// Where a failure came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request document or variables were rejected before execution.
    Validation,
    /// The caller is not allowed to run the operation.
    Authorization,
    /// The executor ran the operation and reported a failure.
    Execution,
    /// The client broke the protocol for this operation (e.g. duplicate id).
    Protocol,
    /// The operation was cancelled by something other than connection teardown.
    Cancelled,
    /// Anything unexpected.
    Unhandled,
}

impl ErrorKind {
    /// Default code reported in `extensions.code`.
    pub fn default_code(self) -> &'static str {
        match self {
            Self::Validation => "INVALID_OPERATION",
            Self::Authorization => "ACCESS_DENIED",
            Self::Execution => "EXECUTION_ERROR",
            Self::Protocol => "PROTOCOL_ERROR",
            Self::Cancelled => "OPERATION_CANCELLED",
            Self::Unhandled => "UNHANDLED_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_code())
    }
}

/// A failure reported to the client for a single operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct ExecutionError {
    /// Failure origin.
    pub kind: ErrorKind,
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ExecutionError {
    /// Build an error with the kind's default code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_owned(),
            message: message.into(),
        }
    }

    /// Override the code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Executor-reported failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Wrap an unexpected error raised while setting up an operation.
    pub fn setup_failed(source: &dyn std::error::Error) -> Self {
        tracing::debug!(error = %source, "wrapping unhandled setup error");
        Self::new(ErrorKind::Unhandled, SUBSCRIBE_FAILED_MESSAGE)
    }

    /// Wrap an unexpected error raised by an event source.
    pub fn unhandled(source: &dyn std::error::Error) -> Self {
        tracing::debug!(error = %source, "wrapping unhandled source error");
        Self::new(ErrorKind::Unhandled, UNHANDLED_MESSAGE)
    }

    /// Operation cancelled outside of connection teardown.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Operation was cancelled")
    }

    /// Wire payload.
    pub fn to_payload(&self) -> Value {
        json!({
            "message": self.message,
            "extensions": { "code": self.code },
        })
    }
}

/// A panic caught while running an executor or polling an event stream.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

impl PanicError {
    /// Recover the panic message from a `catch_unwind` payload.
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("unknown panic");
        Self(message.to_owned())
    }
}
