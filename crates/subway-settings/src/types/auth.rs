//! Authorization requirements and static credentials.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity granted to a bearer token.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenGrant {
    /// Display name of the caller.
    pub name: String,
    /// Roles held by the caller.
    pub roles: Vec<String>,
    /// Extra claims.
    pub claims: BTreeMap<String, String>,
}

/// Connection-level authorization requirements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Reject callers that are not authenticated.
    pub authentication_required: bool,
    /// Caller must hold at least one of these roles (ignored when empty).
    pub authorized_roles: Vec<String>,
    /// Caller must satisfy every one of these policies.
    pub authorized_policies: Vec<String>,
    /// Bearer tokens accepted by the static authenticator.
    pub tokens: BTreeMap<String, TokenGrant>,
}

impl AuthSettings {
    /// Whether any check is configured.
    pub fn has_requirements(&self) -> bool {
        self.authentication_required
            || !self.authorized_roles.is_empty()
            || !self.authorized_policies.is_empty()
    }
}
