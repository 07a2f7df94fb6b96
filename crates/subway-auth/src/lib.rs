//! # subway-auth
//!
//! Who is calling, and may they proceed.
//!
//! - [`Identity`] is produced once per connection by an [`Authenticator`]
//! - [`AuthorizationGate`] runs the authentication → roles → policies check,
//!   calling the matching [`AuthorizationHooks`] method on the first failure
//! - [`AuthorizationRule`] reuses the gate for per-operation checks

#![deny(unsafe_code)]

pub mod authenticator;
pub mod errors;
pub mod gate;
pub mod identity;
pub mod policy;
pub mod rule;

pub use authenticator::{AnonymousAuthenticator, Authenticator, StaticTokenAuthenticator};
pub use errors::AuthError;
pub use gate::{
    AuthorizationGate, AuthorizationHooks, AuthorizationOutcome, AuthorizationRequirements,
    NoopAuthorizationHooks,
};
pub use identity::{Credentials, Identity};
pub use policy::{Policy, PolicyEvaluator, PolicyRegistry, PolicyResult, RequireClaim, RequireRole};
pub use rule::AuthorizationRule;
