//! Three-stage authorization check.
//!
//! 1. **Authentication**: when required, the identity must be authenticated.
//! 2. **Roles**: when any are configured, the identity must hold at least one.
//! 3. **Policies**: every configured policy must pass.
//!
//! Evaluation stops at the first failing stage and the matching
//! [`AuthorizationHooks`] method runs. With nothing configured the gate
//! always authorizes.

use std::sync::Arc;

use async_trait::async_trait;
use subway_settings::AuthSettings;
use tracing::debug;

use crate::identity::Identity;
use crate::policy::{PolicyEvaluator, PolicyRegistry, PolicyResult};

/// What the gate checks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationRequirements {
    /// Identity must be authenticated.
    pub authentication_required: bool,
    /// Identity must hold one of these roles.
    pub roles: Vec<String>,
    /// Identity must pass all of these policies.
    pub policies: Vec<String>,
}

impl AuthorizationRequirements {
    /// No checks at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only authentication.
    pub fn authenticated() -> Self {
        Self {
            authentication_required: true,
            ..Self::default()
        }
    }

    /// Require one of `roles`.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Require `policy`.
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Whether nothing is checked.
    pub fn is_empty(&self) -> bool {
        !self.authentication_required && self.roles.is_empty() && self.policies.is_empty()
    }
}

impl From<&AuthSettings> for AuthorizationRequirements {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            authentication_required: settings.authentication_required,
            roles: settings.authorized_roles.clone(),
            policies: settings.authorized_policies.clone(),
        }
    }
}

/// Result of running the gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// Every configured stage passed.
    Authorized,
    /// Authentication was required but the identity is anonymous.
    NotAuthenticated,
    /// None of the configured roles is held.
    MissingRole,
    /// A policy failed.
    PolicyFailed {
        /// Name of the failing policy.
        policy: String,
        /// Why it failed, if the policy said.
        reason: Option<String>,
    },
}

impl AuthorizationOutcome {
    /// Whether the caller may proceed.
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized)
    }
}

/// Per-stage failure callbacks. Every method defaults to doing nothing.
#[async_trait]
pub trait AuthorizationHooks: Send + Sync {
    /// Authentication was required and missing.
    async fn on_not_authenticated(&self) {}

    /// No configured role is held.
    async fn on_not_authorized_role(&self) {}

    /// A policy failed.
    async fn on_not_authorized_policy(&self, _policy: &str, _result: &PolicyResult) {}
}

/// Hooks that ignore every failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuthorizationHooks;

impl AuthorizationHooks for NoopAuthorizationHooks {}

/// Evaluates [`AuthorizationRequirements`] against an [`Identity`].
#[derive(Clone)]
pub struct AuthorizationGate {
    requirements: AuthorizationRequirements,
    evaluator: Arc<dyn PolicyEvaluator>,
}

impl AuthorizationGate {
    /// Gate with the given requirements and policy evaluator.
    pub fn new(requirements: AuthorizationRequirements, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            requirements,
            evaluator,
        }
    }

    /// Gate that authorizes everyone.
    pub fn allow_all() -> Self {
        Self::new(AuthorizationRequirements::none(), Arc::new(PolicyRegistry::new()))
    }

    /// Configured requirements.
    pub fn requirements(&self) -> &AuthorizationRequirements {
        &self.requirements
    }

    /// Check `identity` against the configured requirements.
    pub async fn authorize(
        &self,
        identity: &Identity,
        hooks: &dyn AuthorizationHooks,
    ) -> AuthorizationOutcome {
        self.authorize_with(&self.requirements, identity, hooks).await
    }

    /// Check `identity` against ad-hoc requirements, using this gate's evaluator.
    pub async fn authorize_with(
        &self,
        requirements: &AuthorizationRequirements,
        identity: &Identity,
        hooks: &dyn AuthorizationHooks,
    ) -> AuthorizationOutcome {
        if requirements.authentication_required && !identity.authenticated {
            debug!("authorization failed: not authenticated");
            hooks.on_not_authenticated().await;
            return AuthorizationOutcome::NotAuthenticated;
        }

        if !requirements.roles.is_empty()
            && !requirements.roles.iter().any(|r| identity.is_in_role(r))
        {
            debug!(roles = ?requirements.roles, "authorization failed: missing role");
            hooks.on_not_authorized_role().await;
            return AuthorizationOutcome::MissingRole;
        }

        for policy in &requirements.policies {
            let result = self.evaluator.evaluate(policy, identity).await;
            if !result.succeeded {
                debug!(policy, reason = result.failure_reason.as_deref(), "authorization failed: policy");
                hooks.on_not_authorized_policy(policy, &result).await;
                return AuthorizationOutcome::PolicyFailed {
                    policy: policy.clone(),
                    reason: result.failure_reason,
                };
            }
        }

        AuthorizationOutcome::Authorized
    }
}
