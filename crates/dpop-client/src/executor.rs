//! Authenticated request executor
//!
//! Sends one logical request to a subject's resource server and recovers
//! from the two recoverable DPoP failures:
//!
//! - expired access token: refresh under the subject's lock, persist the new
//!   pair, retry once
//! - stale resource server nonce: persist the new nonce, retry once
//!
//! Each failure class has its own one-shot budget, so a logical call makes at
//! most three resource server attempts. A second occurrence of either class
//! is final and is returned to the caller as [`Error::Rejected`].
//!
//! State flow per call:
//! Attempt → Classify → {Done, Refreshing, Renoncing} → Attempt → ... → Done

use std::sync::Arc;
use std::time::Duration;

use dpop_auth::{
    DPOP_AUTH_SCHEME, DPOP_HEADER, OAuthSession, ProofAssertion, RESOURCE_PROOF_LIFETIME,
    RefreshClient, SessionStore, SessionUpdate,
};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::{debug, info, warn};

use crate::classify::{RequestOutcome, classify};
use crate::error::{Error, Result};
use crate::locks::SubjectLocks;
use crate::metrics;
use crate::request::{AuthedRequest, ResourceResponse};

/// DPoP-authenticated HTTP client for many subjects.
///
/// Shared across tasks behind an `Arc`. Sessions live in the store; the
/// client itself only holds the per-subject refresh locks.
pub struct DpopClient {
    http: reqwest::Client,
    store: Arc<dyn SessionStore>,
    refresher: RefreshClient,
    locks: SubjectLocks,
    timeout: Duration,
}

impl DpopClient {
    /// `timeout` bounds every resource server call and every store call.
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn SessionStore>,
        refresher: RefreshClient,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            store,
            refresher,
            locks: SubjectLocks::new(),
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Load the current session for `subject`.
    pub async fn session(&self, subject: &str) -> Result<OAuthSession> {
        self.load(subject).await
    }

    /// Perform `request` on behalf of `subject`.
    ///
    /// Returns the 2xx response, or [`Error::Rejected`] carrying the final
    /// non-2xx response. When a refresh fails, the response that triggered
    /// it is the one returned.
    pub async fn perform(&self, subject: &str, request: AuthedRequest) -> Result<ResourceResponse> {
        let result = self.execute(subject, &request).await;
        match &result {
            Ok(_) => metrics::record_request("success"),
            Err(e) => {
                metrics::record_request(e.kind());
                if !matches!(e, Error::Rejected(_)) {
                    warn!(subject, method = %request.method, error = %e, "authenticated request failed");
                }
            }
        }
        result
    }

    async fn execute(&self, subject: &str, request: &AuthedRequest) -> Result<ResourceResponse> {
        let mut session = self.load(subject).await?;
        let mut refreshed = false;
        let mut renonced = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = self.send(&session, request).await?;
            let outcome = classify(response.status, &response.headers, &response.body);
            debug!(
                subject,
                attempt,
                status = response.status.as_u16(),
                outcome = outcome.label(),
                "resource server responded"
            );

            match outcome {
                RequestOutcome::Success => return Ok(response),
                RequestOutcome::TokenExpired if !refreshed => {
                    refreshed = true;
                    match self.recover_expired(&session).await? {
                        Some(updated) => session = updated,
                        None => return Err(Error::Rejected(Box::new(response))),
                    }
                }
                RequestOutcome::NonceRequired(nonce) if !renonced => {
                    renonced = true;
                    debug!(subject, "resource server issued a new DPoP nonce");
                    session = self
                        .update(subject, SessionUpdate::resource_nonce(nonce))
                        .await?;
                    metrics::record_nonce_rotation();
                }
                _ => return Err(Error::Rejected(Box::new(response))),
            }
        }
    }

    /// Refresh the session's tokens, or adopt a refresh another caller made.
    ///
    /// `Ok(None)` means the refresh failed and the original response should
    /// be returned. Store failures are errors.
    async fn recover_expired(&self, stale: &OAuthSession) -> Result<Option<OAuthSession>> {
        let subject = stale.subject.as_str();
        let _guard = self.locks.lock(subject).await;

        let current = self.load(subject).await?;
        if current.access_token != stale.access_token {
            debug!(subject, "tokens already refreshed by a concurrent request");
            metrics::record_refresh("skipped");
            return Ok(Some(current));
        }

        match self.refresher.refresh(&current).await {
            Ok(tokens) => {
                let scope = tokens.scope.clone();
                let updated = self.update(subject, tokens.into_update()).await?;
                metrics::record_refresh("success");
                info!(subject, scope = ?scope, "access token refreshed");
                Ok(Some(updated))
            }
            Err(e) => {
                let result = match e {
                    dpop_auth::Error::RefreshDenied(_) => "denied",
                    _ => "error",
                };
                metrics::record_refresh(result);
                warn!(subject, error = %e, "refresh failed, returning original response");
                Ok(None)
            }
        }
    }

    /// One resource server attempt with a fresh proof.
    async fn send(&self, session: &OAuthSession, request: &AuthedRequest) -> Result<ResourceResponse> {
        let key = session.dpop_key().map_err(Error::from_proof)?;
        let access_token = session.access_token.expose();
        let proof = ProofAssertion::new(
            request.method.as_str(),
            &request.url,
            session.resource_nonce.as_deref(),
            Some(access_token),
            RESOURCE_PROOF_LIFETIME,
        )
        .and_then(|claims| claims.sign(&key))
        .map_err(Error::from_proof)?;

        let mut authorization =
            HeaderValue::from_str(&format!("{DPOP_AUTH_SCHEME} {access_token}")).map_err(|_| {
                Error::InvalidRequest("access token is not a valid header value".into())
            })?;
        authorization.set_sensitive(true);
        let proof = HeaderValue::from_str(&proof)
            .map_err(|e| Error::Signing(format!("proof is not a valid header value: {e}")))?;

        let mut headers = request.headers.clone();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(DPOP_HEADER, proof);

        let response = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(headers)
            .body(request.body.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {}: {e}", request.method, request.url)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("reading response body: {e}")))?;

        Ok(ResourceResponse {
            status,
            headers,
            body,
        })
    }

    async fn load(&self, subject: &str) -> Result<OAuthSession> {
        match tokio::time::timeout(self.timeout, self.store.load(subject)).await {
            Ok(result) => result.map_err(|e| Error::from_store(subject, e)),
            Err(_) => Err(Error::Persistence(format!(
                "loading session for {subject} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn update(&self, subject: &str, update: SessionUpdate) -> Result<OAuthSession> {
        match tokio::time::timeout(self.timeout, self.store.update(subject, update)).await {
            Ok(result) => result.map_err(|e| Error::from_store(subject, e)),
            Err(_) => Err(Error::Persistence(format!(
                "updating session for {subject} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use common::Secret;
    use dpop_auth::{ClientAuth, DpopKey, FileSessionStore, StoreFuture, access_token_hash};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const SUBJECT: &str = "did:plc:alice";

    /// Scripted resource server reply; once the script runs out the server
    /// accepts `valid_token` and reports every other token as expired.
    #[derive(Clone)]
    enum Reply {
        Expired,
        Nonce(&'static str),
        OtherInvalidToken,
        ServerError,
        Hang,
    }

    struct Seen {
        authorization: String,
        proof: serde_json::Value,
    }

    #[derive(Clone)]
    struct Mock {
        issuer: String,
        script: Arc<Mutex<VecDeque<Reply>>>,
        valid_token: Arc<Mutex<String>>,
        resource_calls: Arc<Mutex<Vec<Seen>>>,
        token_calls: Arc<AtomicUsize>,
        deny_refresh: Arc<AtomicBool>,
    }

    impl Mock {
        fn resource_call_count(&self) -> usize {
            self.resource_calls.lock().unwrap().len()
        }

        fn script(&self, replies: &[Reply]) {
            self.script.lock().unwrap().extend(replies.iter().cloned());
        }
    }

    fn decode_claims(jws: &str) -> serde_json::Value {
        let claims = jws.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).unwrap()).unwrap()
    }

    fn expired() -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(
                "www-authenticate",
                r#"DPoP error="invalid_token", error_description="\"exp\" claim timestamp check failed""#,
            )],
            axum::Json(serde_json::json!({
                "error": "invalid_token",
                "message": "\"exp\" claim timestamp check failed"
            })),
        )
            .into_response()
    }

    async fn resource(State(mock): State<Mock>, headers: HeaderMap) -> Response {
        let authorization = headers
            .get("authorization")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let proof = decode_claims(headers.get("dpop").unwrap().to_str().unwrap());
        mock.resource_calls.lock().unwrap().push(Seen {
            authorization: authorization.clone(),
            proof,
        });

        let scripted = mock.script.lock().unwrap().pop_front();
        match scripted {
            Some(Reply::Expired) => expired(),
            Some(Reply::Nonce(nonce)) => (
                StatusCode::UNAUTHORIZED,
                [("dpop-nonce", nonce)],
                axum::Json(serde_json::json!({
                    "error": "use_dpop_nonce",
                    "message": "Resource server requires nonce in DPoP proof"
                })),
            )
                .into_response(),
            Some(Reply::OtherInvalidToken) => (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({
                    "error": "invalid_token",
                    "message": "token has been revoked"
                })),
            )
                .into_response(),
            Some(Reply::ServerError) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "pds unavailable").into_response()
            }
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK.into_response()
            }
            None => {
                let valid = format!("DPoP {}", mock.valid_token.lock().unwrap());
                if authorization == valid {
                    axum::Json(serde_json::json!({"handle": "alice.example.com"})).into_response()
                } else {
                    expired()
                }
            }
        }
    }

    async fn token(State(mock): State<Mock>) -> Response {
        mock.token_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if mock.deny_refresh.load(Ordering::SeqCst) {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "error": "invalid_grant",
                    "error_description": "refresh token replayed"
                })),
            )
                .into_response();
        }
        (
            [("dpop-nonce", "as-n2")],
            axum::Json(serde_json::json!({
                "access_token": "A2",
                "refresh_token": "R2",
                "token_type": "DPoP",
                "expires_in": 3600,
                "sub": SUBJECT,
            })),
        )
            .into_response()
    }

    async fn start_mock() -> Mock {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let issuer = format!("http://{}", listener.local_addr().unwrap());
        let mock = Mock {
            issuer: issuer.clone(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            valid_token: Arc::new(Mutex::new("A1".into())),
            resource_calls: Arc::new(Mutex::new(Vec::new())),
            token_calls: Arc::new(AtomicUsize::new(0)),
            deny_refresh: Arc::new(AtomicBool::new(false)),
        };

        let metadata = serde_json::json!({
            "issuer": issuer,
            "token_endpoint": format!("{issuer}/oauth/token"),
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "dpop_signing_alg_values_supported": ["ES256"],
        });
        let app = axum::Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                axum::routing::get(move || {
                    let metadata = metadata.clone();
                    async move { axum::Json(metadata) }
                }),
            )
            .route("/oauth/token", axum::routing::post(token))
            .fallback(resource)
            .with_state(mock.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        mock
    }

    fn session(mock: &Mock) -> OAuthSession {
        OAuthSession {
            subject: SUBJECT.into(),
            handle: Some("alice.example.com".into()),
            issuer: mock.issuer.clone(),
            resource_url: mock.issuer.clone(),
            access_token: Secret::new("A1".into()),
            refresh_token: Secret::new("R1".into()),
            dpop_private_jwk: DpopKey::generate().to_private_jwk(),
            authserver_nonce: Some("as-n1".into()),
            resource_nonce: None,
            updated_at: 1_735_500_000_000,
        }
    }

    struct Harness {
        mock: Mock,
        store: Arc<FileSessionStore>,
        client: Arc<DpopClient>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn url(&self) -> String {
            format!("{}/xrpc/app.bsky.actor.getProfile?actor=alice", self.mock.issuer)
        }

        async fn stored(&self) -> OAuthSession {
            self.store.get(SUBJECT).await.unwrap()
        }
    }

    fn build_client(store: Arc<dyn SessionStore>, timeout: Duration) -> DpopClient {
        let http = reqwest::Client::new();
        let refresher = RefreshClient::new(
            http.clone(),
            ClientAuth::Public {
                client_id: "https://app.example.com/oauth/client-metadata.json".into(),
            },
            timeout,
        )
        .allow_insecure_urls(true);
        DpopClient::new(http, store, refresher, timeout)
    }

    async fn harness_with(timeout: Duration, edit: impl FnOnce(&mut OAuthSession)) -> Harness {
        let mock = start_mock().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileSessionStore::load(dir.path().join("sessions.json"))
                .await
                .unwrap(),
        );
        let mut record = session(&mock);
        edit(&mut record);
        store.insert(record).await.unwrap();

        let client = Arc::new(build_client(store.clone(), timeout));
        Harness {
            mock,
            store,
            client,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(Duration::from_secs(5), |_| {}).await
    }

    /// Store wrapper whose updates fail or whose loads stall.
    struct FaultyStore {
        inner: Arc<FileSessionStore>,
        fail_updates: bool,
        stall_loads: bool,
    }

    impl SessionStore for FaultyStore {
        fn load<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, OAuthSession> {
            Box::pin(async move {
                if self.stall_loads {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                SessionStore::load(self.inner.as_ref(), subject).await
            })
        }

        fn update<'a>(
            &'a self,
            subject: &'a str,
            update: SessionUpdate,
        ) -> StoreFuture<'a, OAuthSession> {
            Box::pin(async move {
                if self.fail_updates {
                    return Err(dpop_auth::Error::Io("disk full".into()));
                }
                self.inner.update(subject, update).await
            })
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt_makes_no_updates() {
        let h = harness().await;
        let before = h.stored().await;

        let response = h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(h.mock.resource_call_count(), 1);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.stored().await, before);
    }

    #[tokio::test]
    async fn request_carries_dpop_token_and_bound_proof() {
        let h = harness().await;

        h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[0].authorization, "DPoP A1");
        assert_eq!(calls[0].proof["htm"], "GET");
        assert_eq!(
            calls[0].proof["htu"],
            format!("{}/xrpc/app.bsky.actor.getProfile", h.mock.issuer)
        );
        assert_eq!(calls[0].proof["ath"], access_token_hash("A1").as_str());
        assert!(calls[0].proof.get("nonce").is_none());
    }

    #[tokio::test]
    async fn caller_supplied_credentials_are_replaced() {
        let h = harness().await;
        let request = AuthedRequest::get(h.url())
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer stolen"))
            .header(
                reqwest::header::HeaderName::from_static("dpop"),
                HeaderValue::from_static("forged"),
            );

        h.client.perform(SUBJECT, request).await.unwrap();

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[0].authorization, "DPoP A1");
        assert_eq!(calls[0].proof["htm"], "GET");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_retried_once() {
        let h = harness().await;
        *h.mock.valid_token.lock().unwrap() = "A2".into();

        let response = h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(h.mock.resource_call_count(), 2);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);

        let stored = h.stored().await;
        assert_eq!(stored.access_token.expose(), "A2");
        assert_eq!(stored.refresh_token.expose(), "R2");
        assert_eq!(stored.authserver_nonce.as_deref(), Some("as-n2"));
        assert!(stored.updated_at > 1_735_500_000_000);

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[1].authorization, "DPoP A2");
        assert_eq!(calls[1].proof["ath"], access_token_hash("A2").as_str());
        assert_ne!(calls[0].proof["jti"], calls[1].proof["jti"]);
    }

    #[tokio::test]
    async fn denied_refresh_returns_original_response() {
        let h = harness().await;
        *h.mock.valid_token.lock().unwrap() = "A2".into();
        h.mock.deny_refresh.store(true, Ordering::SeqCst);
        let before = h.stored().await;

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        let Error::Rejected(response) = err else {
            panic!("expected rejected response, got {err:?}");
        };
        assert_eq!(response.status, reqwest::StatusCode::UNAUTHORIZED);
        assert!(response.text().contains("exp"));
        assert_eq!(h.mock.resource_call_count(), 1);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.stored().await, before, "session must be left untouched");
    }

    #[tokio::test]
    async fn nonce_rejection_persists_resource_nonce_only() {
        let h = harness().await;
        h.mock.script(&[Reply::Nonce("n1")]);

        let response = h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(h.mock.resource_call_count(), 2);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 0);

        let stored = h.stored().await;
        assert_eq!(stored.resource_nonce.as_deref(), Some("n1"));
        assert_eq!(stored.authserver_nonce.as_deref(), Some("as-n1"));
        assert_eq!(stored.updated_at, 1_735_500_000_000);

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[1].proof["nonce"], "n1");
    }

    #[tokio::test]
    async fn stored_resource_nonce_is_sent_on_first_attempt() {
        let h = harness_with(Duration::from_secs(5), |s| {
            s.resource_nonce = Some("n0".into());
        })
        .await;

        h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[0].proof["nonce"], "n0");
    }

    #[tokio::test]
    async fn second_nonce_rejection_is_final() {
        let h = harness().await;
        h.mock.script(&[Reply::Nonce("n1"), Reply::Nonce("n2")]);

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        let Error::Rejected(response) = err else {
            panic!("expected rejected response, got {err:?}");
        };
        assert_eq!(response.status, reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(h.mock.resource_call_count(), 2, "never a third call");
        assert_eq!(h.stored().await.resource_nonce.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn nonce_then_expiry_both_recover() {
        let h = harness().await;
        *h.mock.valid_token.lock().unwrap() = "A2".into();
        h.mock.script(&[Reply::Nonce("n1")]);

        let response = h.client.perform(SUBJECT, AuthedRequest::get(h.url())).await.unwrap();

        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(h.mock.resource_call_count(), 3);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls[2].authorization, "DPoP A2");
        assert_eq!(calls[2].proof["nonce"], "n1", "resource nonce survives refresh");
    }

    #[tokio::test]
    async fn second_expiry_is_final() {
        let h = harness().await;
        h.mock.script(&[Reply::Expired, Reply::Expired]);

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)), "got: {err:?}");
        assert_eq!(h.mock.resource_call_count(), 2);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_is_returned_without_retry() {
        let h = harness().await;
        h.mock.script(&[Reply::ServerError]);

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        let Error::Rejected(response) = err else {
            panic!("expected rejected response, got {err:?}");
        };
        assert_eq!(response.status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text(), "pds unavailable");
        assert_eq!(h.mock.resource_call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_token_for_other_cause_is_not_refreshed() {
        let h = harness().await;
        h.mock.script(&[Reply::OtherInvalidToken]);

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(h.mock.resource_call_count(), 1);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_subject_is_reported() {
        let h = harness().await;

        let err = h
            .client
            .perform("did:plc:nobody", AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SessionNotFound(ref s) if s == "did:plc:nobody"));
        assert_eq!(h.mock.resource_call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_key_aborts_before_sending() {
        let h = harness_with(Duration::from_secs(5), |s| {
            s.dpop_private_jwk = Secret::new(r#"{"kty":"EC","crv":"P-256"}"#.into());
        })
        .await;

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Signing(_)), "got: {err:?}");
        assert_eq!(h.mock.resource_call_count(), 0);
    }

    #[tokio::test]
    async fn relative_url_is_invalid_request() {
        let h = harness().await;

        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get("/xrpc/app.bsky.actor.getProfile"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn persistence_failure_during_recovery_is_terminal() {
        let h = harness().await;
        h.mock.script(&[Reply::Nonce("n1")]);
        let faulty = Arc::new(FaultyStore {
            inner: h.store.clone(),
            fail_updates: true,
            stall_loads: false,
        });
        let client = build_client(faulty, Duration::from_secs(5));

        let err = client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persistence(_)), "got: {err:?}");
        assert_eq!(h.mock.resource_call_count(), 1, "no retry without a recorded nonce");
    }

    #[tokio::test]
    async fn failed_token_persistence_is_terminal() {
        let h = harness().await;
        *h.mock.valid_token.lock().unwrap() = "A2".into();
        let faulty = Arc::new(FaultyStore {
            inner: h.store.clone(),
            fail_updates: true,
            stall_loads: false,
        });
        let client = build_client(faulty, Duration::from_secs(5));

        let err = client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persistence(_)), "got: {err:?}");
        assert_eq!(h.mock.resource_call_count(), 1);
        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_store_times_out_as_persistence_error() {
        let h = harness().await;
        let faulty = Arc::new(FaultyStore {
            inner: h.store.clone(),
            fail_updates: false,
            stall_loads: true,
        });
        let client = build_client(faulty, Duration::from_millis(100));

        let err = client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persistence(_)), "got: {err:?}");
        assert_eq!(h.mock.resource_call_count(), 0);
    }

    #[tokio::test]
    async fn hanging_resource_server_is_a_transport_error() {
        let h = harness_with(Duration::from_millis(200), |_| {}).await;
        h.mock.script(&[Reply::Hang]);

        let started = std::time::Instant::now();
        let err = h
            .client
            .perform(SUBJECT, AuthedRequest::get(h.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)), "got: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.mock.resource_call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_expired_requests_refresh_once() {
        let h = harness().await;
        *h.mock.valid_token.lock().unwrap() = "A2".into();

        let mut handles = vec![];
        for _ in 0..5 {
            let client = h.client.clone();
            let url = h.url();
            handles.push(tokio::spawn(async move {
                client.perform(SUBJECT, AuthedRequest::get(url)).await
            }));
        }
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, reqwest::StatusCode::OK);
        }

        assert_eq!(h.mock.token_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.stored().await.refresh_token.expose(), "R2");
    }

    #[tokio::test]
    async fn post_body_is_forwarded_on_every_attempt() {
        let h = harness().await;
        h.mock.script(&[Reply::Nonce("n1")]);
        let request = AuthedRequest::post(format!(
            "{}/xrpc/com.atproto.repo.createRecord",
            h.mock.issuer
        ))
        .json(&serde_json::json!({"repo": SUBJECT, "collection": "app.bsky.graph.follow"}))
        .unwrap();

        h.client.perform(SUBJECT, request).await.unwrap();

        let calls = h.mock.resource_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.proof["htm"] == "POST"));
    }
}
