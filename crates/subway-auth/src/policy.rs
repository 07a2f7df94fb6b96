//! Named authorization policies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::identity::Identity;

/// Result of evaluating one policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyResult {
    /// Whether the policy passed.
    pub succeeded: bool,
    /// Why it failed.
    pub failure_reason: Option<String>,
}

impl PolicyResult {
    /// Passing result.
    pub fn success() -> Self {
        Self {
            succeeded: true,
            failure_reason: None,
        }
    }

    /// Failing result.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// A single authorization requirement evaluated against an identity.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Evaluate the requirement.
    async fn evaluate(&self, identity: &Identity) -> PolicyResult;
}

/// Looks up and evaluates policies by name.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate the named policy against `identity`.
    async fn evaluate(&self, policy: &str, identity: &Identity) -> PolicyResult;
}

/// Requires the caller to hold a role.
#[derive(Clone, Debug)]
pub struct RequireRole(pub String);

#[async_trait]
impl Policy for RequireRole {
    async fn evaluate(&self, identity: &Identity) -> PolicyResult {
        if identity.is_in_role(&self.0) {
            PolicyResult::success()
        } else {
            PolicyResult::failed(format!("role '{}' required", self.0))
        }
    }
}

/// Requires a claim, optionally with a specific value.
#[derive(Clone, Debug)]
pub struct RequireClaim {
    /// Claim key.
    pub key: String,
    /// Accepted value; any value when `None`.
    pub value: Option<String>,
}

#[async_trait]
impl Policy for RequireClaim {
    async fn evaluate(&self, identity: &Identity) -> PolicyResult {
        match (identity.claim(&self.key), &self.value) {
            (Some(_), None) => PolicyResult::success(),
            (Some(actual), Some(expected)) if actual == expected => PolicyResult::success(),
            (Some(_), Some(expected)) => {
                PolicyResult::failed(format!("claim '{}' must be '{expected}'", self.key))
            }
            (None, _) => PolicyResult::failed(format!("claim '{}' required", self.key)),
        }
    }
}

/// Registry of named policies. Unregistered names always fail.
#[derive(Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<dyn Policy>>>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a policy.
    pub fn register(&self, name: &str, policy: impl Policy + 'static) {
        let _ = self
            .policies
            .write()
            .insert(name.to_owned(), Arc::new(policy));
    }

    /// Whether a policy is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.policies.read().contains_key(name)
    }

    /// Registered policy names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PolicyEvaluator for PolicyRegistry {
    async fn evaluate(&self, policy: &str, identity: &Identity) -> PolicyResult {
        let found = self.policies.read().get(policy).cloned();
        match found {
            Some(p) => p.evaluate(identity).await,
            None => {
                tracing::warn!(policy, "policy not registered");
                PolicyResult::failed(format!("policy '{policy}' is not registered"))
            }
        }
    }
}
