//! DPoP proof generation per RFC 9449
//!
//! Every outbound request carries a fresh proof: a compact ES256 JWS whose
//! header embeds the session's public key and whose claims bind the proof to
//! the HTTP method, the target URI, the issue time, and (when present) the
//! server nonce and the access token hash. Proofs are never reused; each call
//! to [`ProofAssertion::new`] draws a new `jti`.
//!
//! The same key type signs `private_key_jwt` client assertions for the token
//! endpoint, so [`DpopKey::sign_compact`] is generic over the claim set.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use p256::SecretKey;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::constants::{DPOP_JWT_TYPE, SIGNING_ALG};
use crate::error::{Error, Result};

/// Private JWK as stored in the session record.
#[derive(Deserialize)]
struct PrivateJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    d: Secret<String>,
    #[serde(default)]
    kid: Option<String>,
}

/// Public half of a P-256 key in JWK form. Never carries `d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

/// A P-256 signing key loaded from (or exported to) a private JWK.
///
/// Used both as a session's DPoP key and as the client's assertion key.
#[derive(Clone)]
pub struct DpopKey {
    signing_key: SigningKey,
    public: PublicJwk,
    kid: Option<String>,
}

impl fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopKey")
            .field("thumbprint", &self.thumbprint())
            .field("kid", &self.kid)
            .finish()
    }
}

impl DpopKey {
    /// Parse a private P-256 JWK (`kty=EC`, `crv=P-256`, with `d`, `x`, `y`).
    ///
    /// The public coordinates must match the ones derived from `d`; a
    /// mismatch means the record was corrupted or hand-edited.
    pub fn from_jwk(jwk: &str) -> Result<Self> {
        let parsed: PrivateJwk = serde_json::from_str(jwk)
            .map_err(|e| Error::Signing(format!("invalid private JWK: {e}")))?;

        if parsed.kty != "EC" || parsed.crv != "P-256" {
            return Err(Error::Signing(format!(
                "unsupported key type {}/{}, expected EC/P-256",
                parsed.kty, parsed.crv
            )));
        }

        let d = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(parsed.d.expose().as_bytes())
                .map_err(|e| Error::Signing(format!("invalid JWK 'd' encoding: {e}")))?,
        );
        let secret = SecretKey::from_slice(&d)
            .map_err(|e| Error::Signing(format!("invalid P-256 private scalar: {e}")))?;

        let key = Self::from_secret(secret, parsed.kid);
        if key.public.x != parsed.x || key.public.y != parsed.y {
            return Err(Error::Signing(
                "JWK public coordinates do not match the private key".into(),
            ));
        }
        Ok(key)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng), None)
    }

    fn from_secret(secret: SecretKey, kid: Option<String>) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        // Uncompressed points always carry both coordinates.
        let x = point.x().map(|c| URL_SAFE_NO_PAD.encode(c)).unwrap_or_default();
        let y = point.y().map(|c| URL_SAFE_NO_PAD.encode(c)).unwrap_or_default();
        Self {
            signing_key: SigningKey::from(secret),
            public: PublicJwk {
                kty: "EC".into(),
                crv: "P-256".into(),
                x,
                y,
            },
            kid,
        }
    }

    /// Attach a key id, used in the JOSE header of client assertions.
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Key id from the JWK, if any.
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Public JWK embedded in proof headers.
    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public
    }

    /// Export the private key as a JWK string for storage.
    pub fn to_private_jwk(&self) -> Secret<String> {
        let d = Zeroizing::new(URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()));
        let mut jwk = serde_json::json!({
            "kty": self.public.kty,
            "crv": self.public.crv,
            "x": self.public.x,
            "y": self.public.y,
            "d": d.as_str(),
        });
        if let Some(kid) = &self.kid {
            jwk["kid"] = serde_json::Value::String(kid.clone());
        }
        Secret::new(jwk.to_string())
    }

    /// RFC 7638 JWK thumbprint (base64url SHA-256 over the canonical members).
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.public.crv, self.public.kty, self.public.x, self.public.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Sign `claims` as a compact JWS with the given JOSE header.
    pub fn sign_compact<C: Serialize>(
        &self,
        header: &serde_json::Value,
        claims: &C,
    ) -> Result<String> {
        let header = serde_json::to_vec(header)
            .map_err(|e| Error::Signing(format!("encoding JOSE header: {e}")))?;
        let claims = serde_json::to_vec(claims)
            .map_err(|e| Error::Signing(format!("encoding JWT claims: {e}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let signature: Signature = self
            .signing_key
            .try_sign(signing_input.as_bytes())
            .map_err(|e| Error::Signing(format!("ES256 signing failed: {e}")))?;

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Claims of a single DPoP proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofAssertion {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

impl ProofAssertion {
    /// Build fresh claims for one outbound attempt.
    ///
    /// An empty nonce is treated as absent. `access_token` is hashed into
    /// `ath` when the request also presents the token.
    pub fn new(
        method: &str,
        url: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
        lifetime: Duration,
    ) -> Result<Self> {
        let iat = unix_now();
        Ok(Self {
            jti: uuid::Uuid::new_v4().to_string(),
            htm: method.to_ascii_uppercase(),
            htu: target_uri(url)?,
            iat,
            exp: iat + lifetime.as_secs(),
            nonce: nonce.filter(|n| !n.is_empty()).map(str::to_owned),
            ath: access_token.map(access_token_hash),
        })
    }

    /// Sign the claims with the session key, embedding its public JWK.
    pub fn sign(&self, key: &DpopKey) -> Result<String> {
        let header = serde_json::json!({
            "typ": DPOP_JWT_TYPE,
            "alg": SIGNING_ALG,
            "jwk": key.public_jwk(),
        });
        key.sign_compact(&header, self)
    }
}

/// `htu` value: the request URI without query and fragment.
pub fn target_uri(url: &str) -> Result<String> {
    let mut parsed =
        reqwest::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// `ath` value: `BASE64URL(SHA256(access_token))`.
pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
