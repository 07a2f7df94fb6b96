//! Caller identity and the raw credentials it is derived from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AuthError;

/// Read-only description of who is calling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Whether the caller proved who they are.
    pub authenticated: bool,
    /// Display name, if known.
    pub name: Option<String>,
    /// Roles held by the caller.
    pub roles: BTreeSet<String>,
    /// Additional claims.
    pub claims: BTreeMap<String, String>,
}

impl Identity {
    /// Unauthenticated caller with no roles or claims.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Authenticated caller with the given name.
    pub fn authenticated(name: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let _ = self.roles.insert(role.into());
        self
    }

    /// Add a claim.
    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.claims.insert(key.into(), value.into());
        self
    }

    /// Whether the caller holds `role`.
    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Claim value, if present.
    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }
}

/// Payload keys checked for a token when no header carries one.
const PAYLOAD_TOKEN_KEYS: [&str; 3] = ["authToken", "Authorization", "authorization"];

/// Credentials gathered from the transport handshake and `connection_init`.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// Handshake headers, keys lowercased.
    pub headers: BTreeMap<String, String>,
    /// Payload of the `connection_init` message.
    pub init_payload: Option<Value>,
}

impl Credentials {
    /// Build from handshake headers.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            init_payload: None,
        }
    }

    /// Attach the `connection_init` payload.
    #[must_use]
    pub fn with_init_payload(mut self, payload: Option<Value>) -> Self {
        self.init_payload = payload;
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Bearer token from the `authorization` header, else from the init payload.
    ///
    /// A header that is present but is not a bearer token is an error.
    pub fn bearer_token(&self) -> Result<Option<String>, AuthError> {
        if let Some(header) = self.header("authorization") {
            return strip_bearer(header).map(Some).ok_or_else(|| {
                AuthError::MalformedCredentials("authorization header is not a bearer token".into())
            });
        }
        let Some(Value::Object(payload)) = &self.init_payload else {
            return Ok(None);
        };
        for key in PAYLOAD_TOKEN_KEYS {
            if let Some(Value::String(raw)) = payload.get(key) {
                let token = strip_bearer(raw).unwrap_or_else(|| raw.trim().to_owned());
                if !token.is_empty() {
                    return Ok(Some(token));
                }
            }
        }
        Ok(None)
    }
}

fn strip_bearer(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_owned())
    } else {
        None
    }
}
