//! DPoP-bound OAuth session library
//!
//! Provides DPoP proof generation, the OAuth session model and its
//! persistence boundary, authorization server discovery, and the refresh
//! grant. This crate has no dependency on the request executor or the proxy
//! binary and can be tested on its own.
//!
//! Refresh flow:
//! 1. Executor loads a session via `store::SessionStore::load()`
//! 2. `token::RefreshClient::refresh()` resolves the issuer's token endpoint
//!    through `metadata::MetadataCache` and posts the refresh grant with a
//!    `proof::ProofAssertion`
//! 3. The result is persisted with `store::SessionStore::update()` using
//!    `token::RefreshedTokens::into_update()`

pub mod constants;
pub mod error;
pub mod metadata;
pub mod proof;
pub mod session;
pub mod store;
pub mod token;
pub mod wire;

pub use constants::*;
pub use error::{Error, Result};
pub use metadata::{AuthServerMetadata, MetadataCache, is_safe_url};
pub use proof::{DpopKey, ProofAssertion, PublicJwk, access_token_hash, target_uri};
pub use session::{OAuthSession, SessionUpdate, TokenPair, now_millis};
pub use store::{FileSessionStore, SessionStore, StoreFuture};
pub use token::{ClientAuth, RefreshClient, RefreshedTokens, TokenResponse};
pub use wire::{OAuthErrorBody, dpop_nonce, nonce_challenge};
