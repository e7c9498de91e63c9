//! OAuth error parsing shared by the token endpoint and resource server paths
//!
//! Servers report DPoP failures either as a JSON body
//! (`{"error": "...", "error_description": "..."}`, or `message` instead of
//! `error_description` on atproto servers) or as parameters of a
//! `WWW-Authenticate: DPoP ...` challenge. The body wins when both are present.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use serde::Deserialize;

use crate::constants::{
    DPOP_AUTH_SCHEME, DPOP_NONCE_HEADER, ERROR_INVALID_TOKEN, ERROR_USE_DPOP_NONCE,
};

/// OAuth-style error payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OAuthErrorBody {
    /// Parse a JSON error body. Returns `None` unless it carries an `error` code.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body)
            .ok()
            .filter(|parsed| parsed.error.is_some())
    }

    /// Extract `error` / `error_description` from a `WWW-Authenticate: DPoP` challenge.
    pub fn from_www_authenticate(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_dpop_challenge)
    }

    /// Body first, then the challenge header.
    pub fn from_response(headers: &HeaderMap, body: &[u8]) -> Option<Self> {
        Self::parse(body).or_else(|| Self::from_www_authenticate(headers))
    }

    pub fn code(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// `error_description`, falling back to `message`.
    pub fn description(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.message.as_deref())
    }

    pub fn is_nonce_required(&self) -> bool {
        self.code() == Some(ERROR_USE_DPOP_NONCE)
    }

    /// `invalid_token` whose description cites expiry.
    ///
    /// Servers do not report expiry with a dedicated code, so this matches
    /// words in the free-text description: the `exp` claim name, or a word
    /// starting with `expir` ("expired", "expiration"). Words that merely
    /// contain the letters, such as "unexpected" or "expected", do not count.
    pub fn is_token_expired(&self) -> bool {
        self.code() == Some(ERROR_INVALID_TOKEN)
            && self.description().is_some_and(mentions_expiry)
    }
}

fn mentions_expiry(description: &str) -> bool {
    description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(str::to_ascii_lowercase)
        .any(|word| word == "exp" || word.starts_with("expir"))
}

/// Non-empty `DPoP-Nonce` response header.
pub fn dpop_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DPOP_NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// New nonce demanded by a `400`/`401` `use_dpop_nonce` rejection.
///
/// `None` when the response is not a nonce challenge or carries no usable
/// nonce header.
pub fn nonce_challenge(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if status != StatusCode::BAD_REQUEST && status != StatusCode::UNAUTHORIZED {
        return None;
    }
    let error = OAuthErrorBody::from_response(headers, body)?;
    if !error.is_nonce_required() {
        return None;
    }
    dpop_nonce(headers)
}

fn parse_dpop_challenge(value: &str) -> Option<OAuthErrorBody> {
    let value = value.trim_start();
    let (scheme, params) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case(DPOP_AUTH_SCHEME) {
        return None;
    }

    let mut parsed = OAuthErrorBody::default();
    for (name, value) in auth_params(params) {
        match name.to_ascii_lowercase().as_str() {
            "error" => parsed.error = Some(value),
            "error_description" => parsed.error_description = Some(value),
            _ => {}
        }
    }
    parsed.error.is_some().then_some(parsed)
}

/// Split `a=b, c="d, e"` into name/value pairs, unquoting quoted values.
fn auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}

        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            name.push(c);
        }
        if name.trim().is_empty() {
            break;
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }
        params.push((name.trim().to_string(), value.trim_end().to_string()));
    }
    params
}
