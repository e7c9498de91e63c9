//! Error types for DPoP proof, session storage, and token refresh operations

/// Errors from DPoP authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint error: {0}")]
    TokenEndpoint(String),

    /// The authorization server rejected the refresh token (revoked, reused,
    /// or expired). The stored session is left untouched.
    #[error("refresh denied: {0}")]
    RefreshDenied(String),

    /// Key material could not be parsed or used for signing.
    #[error("signing error: {0}")]
    Signing(String),

    #[error("authorization server metadata error: {0}")]
    Metadata(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsafe URL rejected: {0}")]
    UnsafeUrl(String),

    #[error("session parse error: {0}")]
    SessionParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
