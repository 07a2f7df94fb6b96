//! Close codes used when terminating the underlying transport.

use std::fmt;

/// Normal closure requested by the client.
pub const NORMAL: u16 = 1000;
/// Server is shutting down.
pub const GOING_AWAY: u16 = 1001;
/// Server could not set up the connection.
pub const INTERNAL_ERROR: u16 = 1011;
/// Connection failed authorization.
pub const ACCESS_DENIED: u16 = 4401;
/// No `connection_init` arrived in time.
pub const INIT_TIMEOUT: u16 = 4408;
/// A second `connection_init` arrived.
pub const TOO_MANY_INIT: u16 = 4429;
/// Message type is not part of the vocabulary.
pub const UNRECOGNIZED: u16 = 4400;
/// Operation id is already in use.
pub const ID_EXISTS: u16 = 4409;
/// Operation id was empty.
pub const BLANK_ID: u16 = 4400;

/// Code and human-readable reason sent in a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// Numeric close code.
    pub code: u16,
    /// Reason text.
    pub reason: String,
}

impl CloseReason {
    /// Build a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Client asked to terminate.
    pub fn normal() -> Self {
        Self::new(NORMAL, "Normal closure")
    }

    /// Server shutdown.
    pub fn going_away() -> Self {
        Self::new(GOING_AWAY, "Server shutting down")
    }

    /// Authorization failed.
    pub fn access_denied() -> Self {
        Self::new(ACCESS_DENIED, "Access denied")
    }

    /// Initialization wait timed out.
    pub fn init_timeout() -> Self {
        Self::new(INIT_TIMEOUT, "Connection initialization timeout")
    }

    /// Repeated `connection_init`.
    pub fn too_many_init() -> Self {
        Self::new(TOO_MANY_INIT, "Too many initialization requests")
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}
