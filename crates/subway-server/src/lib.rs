//! # subway-server
//!
//! The per-connection protocol engine and the Axum server that hosts it.
//!
//! - [`controller`]: `connection_init` handshake, `start`/`stop` dispatch,
//!   init timeout and teardown for one connection
//! - [`registry`]: active operations keyed by client id, with
//!   reserve-then-swap registration so a `stop` racing setup is never lost
//! - [`writer`]: the single FIFO outbound pipeline every producer shares
//! - [`observer`]: forwards an operation's event stream as `data`/`error`/`complete`
//! - [`keepalive`]: fixed-cadence or idle-adaptive `ka` messages
//! - [`hooks`]: overridable responses to protocol events (close codes live here)
//! - [`server`]: routes, `/health`, `/metrics`, WebSocket upgrade
//! - [`shutdown`]: `CancellationToken`-based graceful drain

#![deny(unsafe_code)]

pub mod connections;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod health;
pub mod hooks;
pub mod keepalive;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use controller::{ConnectionController, ConnectionServices, ConnectionState};
pub use errors::{ConnectionError, RequestError, ServerError};
pub use executor::{OperationRequest, RequestExecutor};
pub use hooks::{ConnectionHooks, DefaultHooks, HookOutcome};
pub use server::{GatewayServer, PROTOCOL};
pub use writer::OrderedWriter;
