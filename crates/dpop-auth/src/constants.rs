//! DPoP and OAuth wire constants
//!
//! Header names are lowercase so they can be used with
//! `HeaderName::from_static`.

use std::time::Duration;

/// Request header carrying the DPoP proof JWT
pub const DPOP_HEADER: &str = "dpop";

/// Response header carrying a server-issued DPoP nonce
pub const DPOP_NONCE_HEADER: &str = "dpop-nonce";

/// Authorization scheme for DPoP-bound access tokens
pub const DPOP_AUTH_SCHEME: &str = "DPoP";

/// JOSE `typ` for DPoP proofs (RFC 9449 section 4.2)
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Only ES256 (P-256 + SHA-256) is supported for proofs and client assertions
pub const SIGNING_ALG: &str = "ES256";

/// Proofs sent to the authorization server stay valid for 30 seconds
pub const AUTHSERVER_PROOF_LIFETIME: Duration = Duration::from_secs(30);

/// Proofs sent to the resource server stay valid for 10 seconds
pub const RESOURCE_PROOF_LIFETIME: Duration = Duration::from_secs(10);

/// Client assertion lifetime for `private_key_jwt` authentication
pub const CLIENT_ASSERTION_LIFETIME: Duration = Duration::from_secs(60);

/// `client_assertion_type` for `private_key_jwt` (RFC 7523)
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Well-known path for authorization server metadata (RFC 8414)
pub const AUTHSERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// OAuth error code: the server demands a (fresh) nonce in the DPoP proof
pub const ERROR_USE_DPOP_NONCE: &str = "use_dpop_nonce";

/// OAuth error code: the access token was rejected
pub const ERROR_INVALID_TOKEN: &str = "invalid_token";

/// OAuth error code: the refresh token (grant) was rejected
pub const ERROR_INVALID_GRANT: &str = "invalid_grant";
