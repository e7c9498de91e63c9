//! Authorization server metadata discovery (RFC 8414)
//!
//! The token endpoint is never configured directly: it is resolved from the
//! session's issuer through `/.well-known/oauth-authorization-server` and
//! cached per issuer. Issuer and endpoint URLs are untrusted input, so both
//! pass a server-side request filter before any request is made.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::constants::{AUTHSERVER_METADATA_PATH, SIGNING_ALG};
use crate::error::{Error, Result};

/// Subset of the metadata document the refresh grant depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// Check the document against the URL it was fetched from.
    pub fn validate(&self, fetched_from: &Url, allow_insecure_urls: bool) -> Result<()> {
        let issuer = Url::parse(&self.issuer)
            .map_err(|e| Error::Metadata(format!("issuer {:?} is not a URL: {e}", self.issuer)))?;

        if issuer.host_str() != fetched_from.host_str()
            || issuer.port_or_known_default() != fetched_from.port_or_known_default()
        {
            return Err(Error::Metadata(format!(
                "issuer {} does not match metadata host {}",
                self.issuer,
                fetched_from.host_str().unwrap_or_default()
            )));
        }
        if !allow_insecure_urls && issuer.scheme() != "https" {
            return Err(Error::Metadata(format!("issuer {} is not https", self.issuer)));
        }
        if !matches!(issuer.path(), "" | "/") || issuer.fragment().is_some() {
            return Err(Error::Metadata(format!(
                "issuer {} must be a bare origin",
                self.issuer
            )));
        }
        if !self.grant_types_supported.iter().any(|g| g == "refresh_token") {
            return Err(Error::Metadata(
                "authorization server does not support the refresh_token grant".into(),
            ));
        }
        if !self
            .dpop_signing_alg_values_supported
            .iter()
            .any(|alg| alg == SIGNING_ALG)
        {
            return Err(Error::Metadata(format!(
                "authorization server does not accept {SIGNING_ALG} DPoP proofs"
            )));
        }
        check_url(&self.token_endpoint, allow_insecure_urls)?;
        Ok(())
    }
}

/// Parse `url` and, unless disabled, apply the [`is_safe_url`] filter.
pub fn check_url(url: &str, allow_insecure_urls: bool) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    if !allow_insecure_urls && !is_safe_url(&parsed) {
        return Err(Error::UnsafeUrl(url.to_string()));
    }
    Ok(parsed)
}

/// Crude filter for server-side requests to untrusted URLs.
///
/// Accepts only `https` URLs with a dotted DNS hostname, no credentials, no
/// explicit port, and a final label that is neither numeric nor a
/// local-only suffix. IP literals are rejected.
pub fn is_safe_url(url: &Url) -> bool {
    if url.scheme() != "https"
        || !url.username().is_empty()
        || url.password().is_some()
        || url.port().is_some()
    {
        return false;
    }

    let Some(host) = url.domain() else {
        return false;
    };

    let segments: Vec<&str> = host.split('.').collect();
    let Some(last) = segments.last() else {
        return false;
    };
    segments.len() >= 2
        && !matches!(*last, "local" | "arpa" | "internal" | "localhost")
        && !last.chars().all(|c| c.is_ascii_digit())
}

/// Fetch and validate the metadata document for `issuer`.
pub async fn fetch_metadata(
    http: &reqwest::Client,
    issuer: &str,
    timeout: Duration,
    allow_insecure_urls: bool,
) -> Result<AuthServerMetadata> {
    check_url(issuer, allow_insecure_urls)?;
    let url = format!("{}{AUTHSERVER_METADATA_PATH}", issuer.trim_end_matches('/'));
    let fetch_url = Url::parse(&url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;

    let response = http
        .get(fetch_url.clone())
        .header(ACCEPT, "application/json")
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Http(format!("metadata request to {url} failed: {e}")))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::Metadata(format!("{url} returned {status}")));
    }

    let metadata = response
        .json::<AuthServerMetadata>()
        .await
        .map_err(|e| Error::Metadata(format!("invalid metadata document from {url}: {e}")))?;
    metadata.validate(&fetch_url, allow_insecure_urls)?;

    debug!(issuer, token_endpoint = %metadata.token_endpoint, "fetched authorization server metadata");
    Ok(metadata)
}

/// Per-issuer metadata cache.
#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<String, AuthServerMetadata>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached metadata for `issuer`, fetching it on a miss.
    pub async fn resolve(
        &self,
        http: &reqwest::Client,
        issuer: &str,
        timeout: Duration,
        allow_insecure_urls: bool,
    ) -> Result<AuthServerMetadata> {
        if let Some(cached) = self.entries.read().await.get(issuer) {
            return Ok(cached.clone());
        }

        let metadata = fetch_metadata(http, issuer, timeout, allow_insecure_urls).await?;
        self.entries
            .write()
            .await
            .insert(issuer.to_string(), metadata.clone());
        info!(issuer, "cached authorization server metadata");
        Ok(metadata)
    }

    /// Drop the cached entry so the next call re-fetches it.
    pub async fn invalidate(&self, issuer: &str) {
        if self.entries.write().await.remove(issuer).is_some() {
            debug!(issuer, "invalidated authorization server metadata");
        }
    }
}
