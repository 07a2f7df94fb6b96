//! Turning credentials into an [`Identity`].

use std::collections::HashMap;

use async_trait::async_trait;
use subway_settings::TokenGrant;
use tracing::debug;

use crate::errors::AuthError;
use crate::identity::{Credentials, Identity};

/// Establishes the caller's identity at connection-init time.
///
/// Implementations should return an anonymous identity for missing or unknown
/// credentials; whether that is acceptable is decided by the gate.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve credentials to an identity.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
}

/// Authenticator that always yields an anonymous identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

/// Authenticator backed by a fixed table of bearer tokens.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    /// Create an empty authenticator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured token grants.
    pub fn from_grants<'a>(grants: impl IntoIterator<Item = (&'a String, &'a TokenGrant)>) -> Self {
        let mut auth = Self::new();
        for (token, grant) in grants {
            let mut identity = Identity::authenticated(grant.name.clone());
            identity.roles = grant.roles.iter().cloned().collect();
            identity.claims = grant.claims.clone();
            auth.insert(token.clone(), identity);
        }
        auth
    }

    /// Register a token.
    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        let _ = self.tokens.insert(token.into(), identity);
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let Some(token) = credentials.bearer_token()? else {
            debug!("no bearer token presented");
            return Ok(Identity::anonymous());
        };
        match self.tokens.get(&token) {
            Some(identity) => {
                debug!(name = identity.name.as_deref(), "token accepted");
                Ok(identity.clone())
            }
            None => {
                debug!("unknown bearer token");
                Ok(Identity::anonymous())
            }
        }
    }
}
