//! Server-side error types.

use subway_core::ExecutionError;
use subway_settings::SettingsError;
use thiserror::Error;

/// Boxed error raised by an executor for anything it did not anticipate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure returned by a [`RequestExecutor`](crate::executor::RequestExecutor).
#[derive(Debug, Error)]
pub enum RequestError {
    /// A failure the executor classified itself; forwarded verbatim.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// The executor observed cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// Anything else. Reported to the client with a generic message.
    #[error("unhandled executor error: {0}")]
    Unhandled(BoxError),
}

impl RequestError {
    /// Wrap an unexpected error.
    pub fn unhandled(source: impl Into<BoxError>) -> Self {
        Self::Unhandled(source.into())
    }
}

/// Errors surfaced by [`ConnectionController`](crate::controller::ConnectionController).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Settings were rejected at construction.
    #[error("invalid connection settings: {0}")]
    Config(#[from] SettingsError),
    /// The connection is being torn down.
    #[error("connection closed")]
    Cancelled,
}

/// The ordered writer no longer accepts messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriterError {
    /// `complete()` was called or the writer task has stopped.
    #[error("writer is closed")]
    Closed,
    /// A bounded queue was full (only from `post`).
    #[error("writer queue is full")]
    Full,
}

/// Transport-level write failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was already closed.
    #[error("transport closed")]
    Closed,
    /// The write failed.
    #[error("transport write failed: {0}")]
    Io(String),
}

/// Errors starting the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
