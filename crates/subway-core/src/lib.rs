//! # subway-core
//!
//! Foundation types shared by every Subway crate:
//!
//! - [`messages`]: the `graphql-ws` message vocabulary and [`OperationMessage`] envelope
//! - [`close`]: close codes used when a connection is terminated
//! - [`errors`]: tagged [`ErrorKind`]s and the [`ExecutionError`] payload mapping
//! - [`execution`]: what a request executor hands back (single result or event stream)
//! - [`logging`]: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod close;
pub mod errors;
pub mod execution;
pub mod logging;
pub mod messages;

pub use close::CloseReason;
pub use errors::{ErrorKind, ExecutionError, PanicError};
pub use execution::{EventStream, ExecutionOutcome, ExecutionResult};
pub use messages::{MessageType, OperationMessage};
