//! JWKS documents and their conversion into verification keys.
//!
//! Fetching is behind the [`JwksSource`] trait so the refresh loop can be
//! driven by the HTTP implementation in production and by stubs in tests.

use crate::providers::OAuthProvider;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// JSON Web Key as published by a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type: `RSA`, `EC` or `OKP`.
    #[serde(default)]
    pub kty: String,

    /// Key ID used to select the key for a token.
    #[serde(default)]
    pub kid: Option<String>,

    /// Key use; only `sig` keys are accepted.
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// Algorithm the key is restricted to, if any.
    #[serde(default)]
    pub alg: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    /// Curve name for EC and OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    /// EC x coordinate or OKP public key (base64url).
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default)]
    pub y: Option<String>,
}

/// JWKS response body.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    pub keys: Vec<Jwk>,
}

/// Key family, which bounds the algorithms a key may verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
    Okp,
}

impl KeyFamily {
    fn accepts(self, alg: Algorithm) -> bool {
        match self {
            Self::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            Self::Ec => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            Self::Okp => alg == Algorithm::EdDSA,
        }
    }
}

/// A public key ready for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: String,
    pub family: KeyFamily,
    /// Pinned algorithm from the JWK `alg` or EC curve.
    pub alg: Option<Algorithm>,
    pub key: DecodingKey,
}

impl VerificationKey {
    /// Whether a token signed with `alg` may be checked with this key.
    pub fn accepts(&self, alg: Algorithm) -> bool {
        match self.alg {
            Some(pinned) => pinned == alg,
            None => self.family.accepts(alg),
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

/// Reasons a JWK entry is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyConversionError {
    #[error("key has no kid")]
    MissingKid,

    #[error("key use '{0}' is not 'sig'")]
    NotForSigning(String),

    #[error("algorithm '{0}' is not accepted")]
    UnsupportedAlgorithm(String),

    #[error("key type '{0}' is not supported")]
    UnsupportedKeyType(String),

    #[error("curve '{0}' is not supported")]
    UnsupportedCurve(String),

    #[error("missing key parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

impl Jwk {
    /// Convert into a [`VerificationKey`].
    ///
    /// # Errors
    ///
    /// Returns a [`KeyConversionError`] for keys that cannot verify tokens
    /// here (no kid, encryption keys, symmetric or unknown algorithms,
    /// unsupported curves, malformed parameters).
    pub fn to_verification_key(&self) -> Result<VerificationKey, KeyConversionError> {
        let kid = self
            .kid
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(KeyConversionError::MissingKid)?
            .to_string();

        if let Some(key_use) = self.key_use.as_deref() {
            if key_use != "sig" {
                return Err(KeyConversionError::NotForSigning(key_use.to_string()));
            }
        }

        let declared = self
            .alg
            .as_deref()
            .map(parse_asymmetric_algorithm)
            .transpose()?;

        let invalid = |e: jsonwebtoken::errors::Error| {
            KeyConversionError::InvalidKeyMaterial(e.to_string())
        };

        let (family, curve_alg, key) = match self.kty.as_str() {
            "RSA" => {
                let key = DecodingKey::from_rsa_components(param(&self.n, "n")?, param(&self.e, "e")?)
                    .map_err(invalid)?;
                (KeyFamily::Rsa, None, key)
            }
            "EC" => {
                let curve_alg = match self.crv.as_deref() {
                    Some("P-256") => Algorithm::ES256,
                    Some("P-384") => Algorithm::ES384,
                    other => {
                        return Err(KeyConversionError::UnsupportedCurve(
                            other.unwrap_or_default().to_string(),
                        ))
                    }
                };
                let key = DecodingKey::from_ec_components(param(&self.x, "x")?, param(&self.y, "y")?)
                    .map_err(invalid)?;
                (KeyFamily::Ec, Some(curve_alg), key)
            }
            "OKP" => {
                match self.crv.as_deref() {
                    Some("Ed25519") => {}
                    other => {
                        return Err(KeyConversionError::UnsupportedCurve(
                            other.unwrap_or_default().to_string(),
                        ))
                    }
                }
                let key = DecodingKey::from_ed_components(param(&self.x, "x")?).map_err(invalid)?;
                (KeyFamily::Okp, Some(Algorithm::EdDSA), key)
            }
            other => return Err(KeyConversionError::UnsupportedKeyType(other.to_string())),
        };

        if let Some(alg) = declared {
            if !family.accepts(alg) || curve_alg.is_some_and(|c| c != alg) {
                return Err(KeyConversionError::UnsupportedAlgorithm(format!("{alg:?}")));
            }
        }

        Ok(VerificationKey {
            kid,
            family,
            alg: declared.or(curve_alg),
            key,
        })
    }
}

fn param<'a>(
    value: &'a Option<String>,
    name: &'static str,
) -> Result<&'a str, KeyConversionError> {
    value
        .as_deref()
        .ok_or(KeyConversionError::MissingParameter(name))
}

/// Parse an algorithm name, rejecting `none` and the HMAC family.
///
/// # Errors
///
/// Returns `UnsupportedAlgorithm` for unknown and symmetric algorithms.
pub fn parse_asymmetric_algorithm(name: &str) -> Result<Algorithm, KeyConversionError> {
    let alg = Algorithm::from_str(name)
        .map_err(|_| KeyConversionError::UnsupportedAlgorithm(name.to_string()))?;
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Err(KeyConversionError::UnsupportedAlgorithm(name.to_string()))
        }
        _ => Ok(alg),
    }
}

// =============================================================================
// Fetching
// =============================================================================

/// Transient failures fetching a provider's JWKS.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyFetchError {
    #[error("JWKS request failed: {0}")]
    Request(String),

    #[error("JWKS endpoint returned status {0}")]
    Status(u16),

    #[error("JWKS response could not be parsed: {0}")]
    Parse(String),

    #[error("JWKS response contained no usable keys")]
    NoUsableKeys,
}

/// Where key sets come from.
#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self, provider: &OAuthProvider) -> Result<JwksResponse, KeyFetchError>;
}

/// Fetches JWKS documents over HTTP.
#[derive(Debug, Clone)]
pub struct HttpJwksSource {
    http_client: reqwest::Client,
}

impl HttpJwksSource {
    pub fn new(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "authz.keys", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self { http_client }
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    #[instrument(skip_all, fields(provider = %provider.name))]
    async fn fetch(&self, provider: &OAuthProvider) -> Result<JwksResponse, KeyFetchError> {
        tracing::debug!(target: "authz.keys", url = %provider.jwks_uri, "Fetching JWKS");

        let response = self
            .http_client
            .get(&provider.jwks_uri)
            .send()
            .await
            .map_err(|e| KeyFetchError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeyFetchError::Status(response.status().as_u16()));
        }

        response
            .json::<JwksResponse>()
            .await
            .map_err(|e| KeyFetchError::Parse(e.to_string()))
    }
}
