//! HTTP front for the DPoP client
//!
//! Each inbound request names a subject in the configured header. The
//! request's path and query are appended to that subject's resource server
//! URL and performed through [`DpopClient::perform`], which owns
//! authentication and recovery. Resource server responses, including error
//! statuses, are returned verbatim.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use dpop_auth::DPOP_HEADER;
use dpop_client::{AuthedRequest, DpopClient, Error as ClientError, ResourceResponse};
use tracing::{error, info, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: Arc<DpopClient>,
    pub subject_header: HeaderName,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Counts a request as in flight until dropped.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward an inbound request to the subject's resource server.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::new(&state.in_flight);
    let started = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    let subject = match request
        .headers()
        .get(&state.subject_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(subject) => subject.to_string(),
        None => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("missing {} header", state.subject_header),
                request_id,
            );
        }
    };

    let session = match state.client.session(&subject).await {
        Ok(session) => session,
        Err(e) => return client_error(state, &e, request_id),
    };

    let (parts, body) = request.into_parts();
    let url = match parts.uri.path_and_query() {
        Some(pq) => format!("{}{}", session.resource_url.trim_end_matches('/'), pq),
        None => session.resource_url.clone(),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_stripped(name, &state.subject_header) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let mut authed = AuthedRequest::new(parts.method, url).body(body);
    authed.headers = headers;

    match state.client.perform(&subject, authed).await {
        Ok(response) => passthrough(response, request_id),
        Err(ClientError::Rejected(response)) => {
            info!(
                subject = %subject,
                status = response.status.as_u16(),
                "resource server rejected request"
            );
            passthrough(*response, request_id)
        }
        Err(e) => client_error(state, &e, request_id),
    }
}

/// Rebuild the resource server response for the inbound client.
fn passthrough(upstream: ResourceResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(upstream.body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

fn client_error(state: &ProxyState, err: &ClientError, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    metrics::record_upstream_error(err.kind());
    let status = status_for(err);
    if status.is_server_error() {
        warn!(error = %err, kind = err.kind(), "request failed");
    }
    error_response(status, err.kind(), &err.to_string(), request_id)
}

/// HTTP status for an executor error that produced no resource server response.
pub fn status_for(err: &ClientError) -> StatusCode {
    match err {
        ClientError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ClientError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ClientError::Transport(_) => StatusCode::BAD_GATEWAY,
        ClientError::Rejected(response) => response.status,
        ClientError::Signing(_) | ClientError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Inbound headers that must not reach the resource server: hop-by-hop,
/// connection-specific, caller credentials, and the subject selector.
fn is_stripped(name: &HeaderName, subject_header: &HeaderName) -> bool {
    is_hop_by_hop(name.as_str())
        || name == HOST
        || name == CONTENT_LENGTH
        || name == AUTHORIZATION
        || name.as_str() == DPOP_HEADER
        || name == subject_header
}
