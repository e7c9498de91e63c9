//! DPoP-authenticated resource server client
//!
//! Performs HTTP calls on behalf of subjects holding DPoP-bound OAuth
//! sessions, recovering from expired access tokens and stale nonces with at
//! most one retry per failure class. Sessions are read from and written back
//! to a `dpop_auth::SessionStore`.
//!
//! Request lifecycle:
//! 1. Caller builds an `AuthedRequest` and calls `DpopClient::perform()`
//! 2. The session is loaded and a fresh proof signed for the attempt
//! 3. The response is classified (`classify::classify`)
//! 4. Expired token → refresh under the subject lock, persist, retry
//! 5. Nonce challenge → persist the resource server nonce, retry
//! 6. Anything else is returned: `Ok` for 2xx, `Error::Rejected` otherwise

pub mod classify;
pub mod error;
pub mod executor;
pub mod locks;
mod metrics;
pub mod request;

pub use classify::{RequestOutcome, classify};
pub use error::{Error, Result};
pub use executor::DpopClient;
pub use locks::SubjectLocks;
pub use request::{AuthedRequest, ResourceResponse};
