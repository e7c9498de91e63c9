//! Resource server response classification
//!
//! Decides whether a response is final or one of the two recoverable DPoP
//! failures. Only `400` and `401` responses are ever recoverable.

use dpop_auth::{OAuthErrorBody, dpop_nonce};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

/// Classification of one resource server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// 2xx
    Success,
    /// `invalid_token` citing token expiry: refresh and retry once
    TokenExpired,
    /// `use_dpop_nonce` with the nonce to retry with
    NonceRequired(String),
    /// Anything else, returned to the caller as-is
    OtherFailure,
}

impl RequestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::TokenExpired => "token_expired",
            RequestOutcome::NonceRequired(_) => "nonce_required",
            RequestOutcome::OtherFailure => "other_failure",
        }
    }
}

/// Classify a response by status, error body, and DPoP headers.
///
/// A nonce challenge without a usable `DPoP-Nonce` header cannot be retried
/// and is `OtherFailure`.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> RequestOutcome {
    if status.is_success() {
        return RequestOutcome::Success;
    }
    if status != StatusCode::BAD_REQUEST && status != StatusCode::UNAUTHORIZED {
        return RequestOutcome::OtherFailure;
    }

    let Some(error) = OAuthErrorBody::from_response(headers, body) else {
        return RequestOutcome::OtherFailure;
    };

    if error.is_token_expired() {
        return RequestOutcome::TokenExpired;
    }
    if error.is_nonce_required() {
        return match dpop_nonce(headers) {
            Some(nonce) => RequestOutcome::NonceRequired(nonce),
            None => RequestOutcome::OtherFailure,
        };
    }
    RequestOutcome::OtherFailure
}
