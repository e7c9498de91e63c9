//! Refresh grant against the session's authorization server
//!
//! One refresh is a `POST` to the token endpoint resolved from the issuer's
//! metadata, carrying a DPoP proof signed with the session key. If the
//! server demands a nonce (`use_dpop_nonce`), the request is repeated exactly
//! once with the new nonce; this nested retry does not count against the
//! caller's own retry budget.
//!
//! The refresh client never writes to the session store. The caller persists
//! [`RefreshedTokens::into_update`] in one store update.

use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{
    AUTHSERVER_PROOF_LIFETIME, CLIENT_ASSERTION_LIFETIME, CLIENT_ASSERTION_TYPE, DPOP_AUTH_SCHEME,
    DPOP_HEADER, ERROR_INVALID_GRANT, SIGNING_ALG,
};
use crate::error::{Error, Result};
use crate::metadata::{AuthServerMetadata, MetadataCache};
use crate::proof::{DpopKey, ProofAssertion, unix_now};
use crate::session::{OAuthSession, SessionUpdate, TokenPair};
use crate::wire::{OAuthErrorBody, dpop_nonce, nonce_challenge};

/// How this client authenticates to the token endpoint.
#[derive(Debug, Clone)]
pub enum ClientAuth {
    /// Public client: `client_id` only.
    Public { client_id: String },
    /// Confidential client signing an RFC 7523 assertion with its own key.
    PrivateKeyJwt { client_id: String, key: DpopKey },
}

impl ClientAuth {
    pub fn client_id(&self) -> &str {
        match self {
            Self::Public { client_id } | Self::PrivateKeyJwt { client_id, .. } => client_id,
        }
    }

    /// Form fields identifying the client, with a fresh assertion when confidential.
    fn form_fields(&self, audience: &str) -> Result<Vec<(&'static str, String)>> {
        let mut fields = vec![("client_id", self.client_id().to_string())];
        if let Self::PrivateKeyJwt { client_id, key } = self {
            fields.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
            fields.push(("client_assertion", client_assertion(client_id, audience, key)?));
        }
        Ok(fields)
    }
}

#[derive(Serialize)]
struct ClientAssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: u64,
    exp: u64,
}

fn client_assertion(client_id: &str, audience: &str, key: &DpopKey) -> Result<String> {
    let mut header = serde_json::json!({ "alg": SIGNING_ALG });
    if let Some(kid) = key.kid() {
        header["kid"] = serde_json::Value::String(kid.to_string());
    }
    let iat = unix_now();
    let claims = ClientAssertionClaims {
        iss: client_id,
        sub: client_id,
        aud: audience,
        jti: uuid::Uuid::new_v4().to_string(),
        iat,
        exp: iat + CLIENT_ASSERTION_LIFETIME.as_secs(),
    };
    key.sign_compact(&header, &claims)
}

/// Token endpoint success body.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub tokens: TokenPair,
    /// Latest nonce seen from the authorization server: the one issued on
    /// the success response, else the one the accepted proof carried.
    pub authserver_nonce: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl RefreshedTokens {
    /// Single store update carrying tokens, nonce, and timestamp together.
    pub fn into_update(self) -> SessionUpdate {
        SessionUpdate::refreshed(self.tokens, self.authserver_nonce)
    }
}

struct EndpointResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Performs refresh grants for any session.
///
/// Holds the shared HTTP client and the per-issuer metadata cache. Every
/// request is bounded by `timeout`.
pub struct RefreshClient {
    http: reqwest::Client,
    client_auth: ClientAuth,
    timeout: Duration,
    allow_insecure_urls: bool,
    metadata: MetadataCache,
}

impl RefreshClient {
    pub fn new(http: reqwest::Client, client_auth: ClientAuth, timeout: Duration) -> Self {
        Self {
            http,
            client_auth,
            timeout,
            allow_insecure_urls: false,
            metadata: MetadataCache::new(),
        }
    }

    /// Disable the URL safety filter (local development and tests only).
    pub fn allow_insecure_urls(mut self, allow: bool) -> Self {
        self.allow_insecure_urls = allow;
        self
    }

    pub fn client_id(&self) -> &str {
        self.client_auth.client_id()
    }

    /// Exchange the session's refresh token for a new token pair.
    ///
    /// Returns [`Error::RefreshDenied`] when the grant itself is rejected;
    /// every other failure is reported with its own variant. The session is
    /// never modified here.
    pub async fn refresh(&self, session: &OAuthSession) -> Result<RefreshedTokens> {
        let result = self.try_refresh(session).await;
        if let Err(e) = &result {
            warn!(subject = %session.subject, error = %e, "token refresh failed");
            if !matches!(e, Error::RefreshDenied(_)) {
                // Endpoint may have moved; re-discover on the next refresh.
                self.metadata.invalidate(&session.issuer).await;
            }
        }
        result
    }

    async fn try_refresh(&self, session: &OAuthSession) -> Result<RefreshedTokens> {
        let subject = session.subject.as_str();
        let metadata = self
            .metadata
            .resolve(
                &self.http,
                &session.issuer,
                self.timeout,
                self.allow_insecure_urls,
            )
            .await?;
        let key = session.dpop_key()?;

        let mut nonce = session.authserver_nonce.clone();
        let mut response = self
            .post_refresh(&metadata, session, &key, nonce.as_deref())
            .await?;

        if let Some(fresh) = nonce_challenge(response.status, &response.headers, &response.body) {
            debug!(subject, "authorization server requested a new DPoP nonce, retrying once");
            nonce = Some(fresh);
            response = self
                .post_refresh(&metadata, session, &key, nonce.as_deref())
                .await?;
        }

        if let Some(issued) = dpop_nonce(&response.headers) {
            nonce = Some(issued);
        }

        if !response.status.is_success() {
            return Err(token_error(&response));
        }

        let body: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Error::TokenEndpoint(format!("invalid refresh response: {e}")))?;

        if let Some(token_type) = body
            .token_type
            .as_deref()
            .filter(|t| !t.eq_ignore_ascii_case(DPOP_AUTH_SCHEME))
        {
            return Err(Error::TokenEndpoint(format!(
                "expected a DPoP-bound token, got token_type {token_type}"
            )));
        }
        if let Some(sub) = body.sub.as_deref().filter(|sub| *sub != subject) {
            return Err(Error::TokenEndpoint(format!(
                "refresh response subject {sub} does not match session subject {subject}"
            )));
        }

        info!(subject, expires_in = ?body.expires_in, scope = ?body.scope, "refreshed tokens");
        Ok(RefreshedTokens {
            tokens: TokenPair::new(body.access_token, body.refresh_token),
            authserver_nonce: nonce,
            expires_in: body.expires_in,
            scope: body.scope,
        })
    }

    async fn post_refresh(
        &self,
        metadata: &AuthServerMetadata,
        session: &OAuthSession,
        key: &DpopKey,
        nonce: Option<&str>,
    ) -> Result<EndpointResponse> {
        let proof = ProofAssertion::new(
            "POST",
            &metadata.token_endpoint,
            nonce,
            None,
            AUTHSERVER_PROOF_LIFETIME,
        )?
        .sign(key)?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", session.refresh_token.expose().clone()),
        ];
        form.extend(self.client_auth.form_fields(&metadata.issuer)?);

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .header(DPOP_HEADER, proof)
            .header(ACCEPT, "application/json")
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("reading token refresh response: {e}")))?;

        Ok(EndpointResponse {
            status,
            headers,
            body,
        })
    }
}

fn token_error(response: &EndpointResponse) -> Error {
    let status = response.status;
    let error = OAuthErrorBody::from_response(&response.headers, &response.body);
    let detail = match &error {
        Some(e) => format!(
            "{}: {}",
            e.code().unwrap_or_default(),
            e.description().unwrap_or("no description")
        ),
        None => String::from_utf8_lossy(&response.body).chars().take(200).collect(),
    };

    let grant_rejected = error
        .as_ref()
        .is_some_and(|e| e.code() == Some(ERROR_INVALID_GRANT));
    if grant_rejected || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Error::RefreshDenied(format!("refresh token rejected ({status}): {detail}"));
    }
    Error::TokenEndpoint(format!("token refresh returned {status}: {detail}"))
}
