//! Authentication error types.

use thiserror::Error;

/// Errors raised while establishing a caller's identity.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials were present but could not be parsed.
    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),
    /// The identity backend could not be reached.
    #[error("authentication backend unavailable: {0}")]
    Backend(String),
}
