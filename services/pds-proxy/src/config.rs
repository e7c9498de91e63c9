//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client signing key is loaded from CLIENT_SECRET_JWK or
//! client_key_file, never stored in the TOML directly.

use axum::http::HeaderName;
use common::Secret;
use dpop_auth::{ClientAuth, DpopKey};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
}

/// HTTP front settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Inbound header naming the subject whose session is used
    #[serde(default = "default_subject_header")]
    pub subject_header: String,
}

/// OAuth client and session settings
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_key: Option<Secret<String>>,
    /// Path to a private JWK for `private_key_jwt` (alternative to CLIENT_SECRET_JWK)
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,
    pub sessions_path: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Permit plain-http and non-public hosts for metadata and token endpoints
    #[serde(default)]
    pub allow_insecure_urls: bool,
}

fn default_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_subject_header() -> String {
    "x-subject".into()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client key resolution order:
    /// 1. CLIENT_SECRET_JWK env var
    /// 2. client_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        if config.oauth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        HeaderName::from_bytes(config.server.subject_header.as_bytes()).map_err(|e| {
            common::Error::Config(format!(
                "subject_header is not a valid header name ({}): {e}",
                config.server.subject_header
            ))
        })?;
        config.server.subject_header = config.server.subject_header.to_ascii_lowercase();

        if let Ok(jwk) = std::env::var("CLIENT_SECRET_JWK") {
            config.oauth.client_key = Some(Secret::new(jwk));
        } else if let Some(ref key_file) = config.oauth.client_key_file {
            let jwk = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let jwk = jwk.trim().to_owned();
            if !jwk.is_empty() {
                config.oauth.client_key = Some(Secret::new(jwk));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pds-proxy.toml")
    }
}

impl OAuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Token endpoint authentication: `private_key_jwt` when a key is
    /// configured, otherwise a public client.
    pub fn client_auth(&self) -> common::Result<ClientAuth> {
        let client_id = self.client_id.clone();
        match &self.client_key {
            Some(jwk) => {
                let key = DpopKey::from_jwk(jwk.expose())
                    .map_err(|e| common::Error::Config(format!("invalid client key: {e}")))?;
                Ok(ClientAuth::PrivateKeyJwt { client_id, key })
            }
            None => Ok(ClientAuth::Public { client_id }),
        }
    }
}
