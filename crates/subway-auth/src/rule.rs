//! Per-operation authorization.

use subway_core::{ErrorKind, ExecutionError};

use crate::gate::{
    AuthorizationGate, AuthorizationOutcome, AuthorizationRequirements, NoopAuthorizationHooks,
};
use crate::identity::Identity;

/// Requirements attached to a single operation, checked with a gate's evaluator.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationRule {
    requirements: AuthorizationRequirements,
}

impl AuthorizationRule {
    /// Rule enforcing `requirements`.
    pub fn new(requirements: AuthorizationRequirements) -> Self {
        Self { requirements }
    }

    /// Rule requiring one of `roles`.
    pub fn require_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(AuthorizationRequirements::authenticated().with_roles(roles))
    }

    /// Check `identity`; failures become an `Authorization` execution error.
    pub async fn check(
        &self,
        gate: &AuthorizationGate,
        identity: &Identity,
    ) -> Result<(), ExecutionError> {
        let outcome = gate
            .authorize_with(&self.requirements, identity, &NoopAuthorizationHooks)
            .await;
        let message = match outcome {
            AuthorizationOutcome::Authorized => return Ok(()),
            AuthorizationOutcome::NotAuthenticated => "Authentication required".to_owned(),
            AuthorizationOutcome::MissingRole => format!(
                "One of the roles [{}] is required",
                self.requirements.roles.join(", ")
            ),
            AuthorizationOutcome::PolicyFailed { policy, reason } => match reason {
                Some(reason) => format!("Policy '{policy}' failed: {reason}"),
                None => format!("Policy '{policy}' failed"),
            },
        };
        Err(ExecutionError::new(ErrorKind::Authorization, message))
    }
}
