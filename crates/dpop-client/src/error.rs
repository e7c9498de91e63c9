//! Error types for authenticated resource requests

use crate::request::ResourceResponse;

/// Terminal outcomes of [`crate::DpopClient::perform`].
///
/// Recoverable protocol failures (expired token, stale nonce) never surface
/// here; they are handled inside the executor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no session for subject {0}")]
    SessionNotFound(String),

    /// The session key could not be parsed or used.
    #[error("signing error: {0}")]
    Signing(String),

    /// The store failed or timed out. The request is not retried.
    #[error("session persistence failed: {0}")]
    Persistence(String),

    /// Connection failure or timeout talking to the resource server.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Final non-2xx response from the resource server, returned verbatim.
    #[error("resource server rejected request with {}", .0.status)]
    Rejected(Box<ResourceResponse>),
}

impl Error {
    /// Map a store failure for `subject`.
    pub(crate) fn from_store(subject: &str, err: dpop_auth::Error) -> Self {
        match err {
            dpop_auth::Error::NotFound(_) => Self::SessionNotFound(subject.to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }

    /// Map a proof construction failure.
    pub(crate) fn from_proof(err: dpop_auth::Error) -> Self {
        match err {
            dpop_auth::Error::InvalidUrl(msg) => Self::InvalidRequest(msg),
            other => Self::Signing(other.to_string()),
        }
    }

    /// Label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::Signing(_) => "signing",
            Self::Persistence(_) => "persistence",
            Self::Transport(_) => "transport",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
