//! OAuth session record and partial updates
//!
//! A session is the per-subject state needed to make DPoP-bound calls: the
//! token pair, the session's private key, and the last nonce seen from each
//! server. The two nonces are separate fields and are never interchanged.
//!
//! Sessions are only mutated through [`SessionUpdate`], which the store
//! applies atomically.

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proof::DpopKey;

/// Per-subject OAuth state.
///
/// `updated_at` is a unix timestamp in milliseconds and only moves when the
/// token pair changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSession {
    /// Stable user key (the account DID)
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Authorization server issuer identifier
    pub issuer: String,
    /// Resource server base URL (the PDS origin)
    pub resource_url: String,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    /// Private P-256 JWK bound to the token pair
    pub dpop_private_jwk: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authserver_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_nonce: Option<String>,
    pub updated_at: u64,
}

impl OAuthSession {
    /// Parse the session's DPoP key.
    pub fn dpop_key(&self) -> Result<DpopKey> {
        DpopKey::from_jwk(self.dpop_private_jwk.expose())
    }
}

/// Access and refresh token, always replaced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Partial update to a session. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub tokens: Option<TokenPair>,
    pub authserver_nonce: Option<String>,
    pub resource_nonce: Option<String>,
    pub updated_at: Option<u64>,
}

impl SessionUpdate {
    /// Update after a successful refresh grant.
    ///
    /// Tokens, the nonce the authorization server last issued, and the
    /// timestamp land in the same write.
    pub fn refreshed(tokens: TokenPair, authserver_nonce: Option<String>) -> Self {
        Self {
            tokens: Some(tokens),
            authserver_nonce,
            resource_nonce: None,
            updated_at: Some(now_millis()),
        }
    }

    /// Update after the resource server demanded a new nonce.
    pub fn resource_nonce(nonce: impl Into<String>) -> Self {
        Self {
            resource_nonce: Some(nonce.into()),
            ..Self::default()
        }
    }

    /// Apply the set fields to `session`.
    pub fn apply(self, session: &mut OAuthSession) {
        if let Some(tokens) = self.tokens {
            session.access_token = tokens.access_token;
            session.refresh_token = tokens.refresh_token;
        }
        if let Some(nonce) = self.authserver_nonce {
            session.authserver_nonce = Some(nonce);
        }
        if let Some(nonce) = self.resource_nonce {
            session.resource_nonce = Some(nonce);
        }
        if let Some(updated_at) = self.updated_at {
            session.updated_at = updated_at;
        }
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
