//! Offline JWT verification.
//!
//! Verification is synchronous and never touches the network: it reads the
//! provider's current [`KeySet`](crate::keys::KeySet) from the cache. The
//! provider configured on the endpoint is authoritative; the token's own
//! `iss` is only compared against it, never used to pick keys.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - `none` and HMAC algorithms are never accepted
//! - The key's family (or pinned `alg`) must match the token's `alg`
//! - Every failure displays the same generic message

use crate::auth::claims::ClaimSet;
use crate::keys::jwks::parse_asymmetric_algorithm;
use crate::keys::KeyMaterialCache;
use crate::observability::metrics;
use crate::providers::OAuthProvider;
use chrono::{DateTime, Utc};
use common::jwt::{
    numeric_date, parse_header, validate_time_claims_at, JwtValidationError, DEFAULT_CLOCK_SKEW,
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a token was rejected.
///
/// Variants are kept apart for logs, metrics and audit; all of them display
/// the same message to clients.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    #[error("The access token is invalid or expired")]
    MalformedToken,

    #[error("The access token is invalid or expired")]
    UnknownKey,

    #[error("The access token is invalid or expired")]
    UnsupportedAlgorithm,

    #[error("The access token is invalid or expired")]
    InvalidSignature,

    #[error("The access token is invalid or expired")]
    IssuerMismatch,

    #[error("The access token is invalid or expired")]
    Expired,

    #[error("The access token is invalid or expired")]
    NotYetValid,

    /// The provider has no key set, or only one older than the staleness bound.
    #[error("The access token is invalid or expired")]
    ProviderUnavailable,
}

impl TokenError {
    /// Stable identifier for logs and metric labels.
    pub fn code(self) -> &'static str {
        match self {
            Self::TokenTooLarge => "token_too_large",
            Self::MalformedToken => "malformed_token",
            Self::UnknownKey => "unknown_key",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::InvalidSignature => "invalid_signature",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::ProviderUnavailable => "provider_unavailable",
        }
    }
}

impl From<JwtValidationError> for TokenError {
    fn from(e: JwtValidationError) -> Self {
        match e {
            JwtValidationError::TokenTooLarge => Self::TokenTooLarge,
            JwtValidationError::MalformedToken => Self::MalformedToken,
            JwtValidationError::MissingKid => Self::UnknownKey,
            JwtValidationError::Expired => Self::Expired,
            JwtValidationError::NotYetValid => Self::NotYetValid,
        }
    }
}

/// Verifies bearer tokens against a provider's cached keys.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: Arc<KeyMaterialCache>,
    clock_skew: Duration,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyMaterialCache>, clock_skew: Duration) -> Self {
        Self { keys, clock_skew }
    }

    pub fn with_default_skew(keys: Arc<KeyMaterialCache>) -> Self {
        Self::new(keys, DEFAULT_CLOCK_SKEW)
    }

    pub fn keys(&self) -> &Arc<KeyMaterialCache> {
        &self.keys
    }

    /// Verify `token` for `provider` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns the [`TokenError`] for the first failed check.
    pub fn verify(&self, token: &str, provider: &OAuthProvider) -> Result<ClaimSet, TokenError> {
        self.verify_at(token, provider, Utc::now())
    }

    /// Deterministic variant of [`verify`](Self::verify) against an explicit `now`.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify).
    pub fn verify_at(
        &self,
        token: &str,
        provider: &OAuthProvider,
        now: DateTime<Utc>,
    ) -> Result<ClaimSet, TokenError> {
        let result = self.check(token, provider, now);
        match &result {
            Ok(_) => {
                tracing::debug!(target: "authz.token", provider = %provider.name, "Token verified");
                metrics::record_token_verification(&provider.name, "ok");
            }
            Err(e) => {
                tracing::debug!(
                    target: "authz.token",
                    provider = %provider.name,
                    reason = e.code(),
                    "Token rejected"
                );
                metrics::record_token_verification(&provider.name, e.code());
            }
        }
        result
    }

    fn check(
        &self,
        token: &str,
        provider: &OAuthProvider,
        now: DateTime<Utc>,
    ) -> Result<ClaimSet, TokenError> {
        // 1. Header (includes the size check)
        let header = parse_header(token)?;
        let alg = parse_asymmetric_algorithm(&header.alg)
            .map_err(|_| TokenError::UnsupportedAlgorithm)?;

        // 2. Key set for the endpoint's provider
        let key_set = self
            .keys
            .usable_at(&provider.name, now)
            .ok_or(TokenError::ProviderUnavailable)?;

        // 3. Key by kid; an unknown kid may mean the provider rotated
        let Some(key) = key_set.key(&header.kid) else {
            self.keys.request_refresh(&provider.name);
            return Err(TokenError::UnknownKey);
        };
        if !key.accepts(alg) {
            return Err(TokenError::UnsupportedAlgorithm);
        }

        // 4. Signature; time claims are checked below with our own clock
        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data =
            decode::<Map<String, Value>>(token, &key.key, &validation).map_err(|e| {
                match e.kind() {
                    ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                    ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                        TokenError::UnsupportedAlgorithm
                    }
                    _ => TokenError::MalformedToken,
                }
            })?;
        let claims = ClaimSet::new(data.claims);

        // 5. Issuer
        if claims.issuer() != Some(provider.issuer.as_str()) {
            return Err(TokenError::IssuerMismatch);
        }

        // 6. exp / nbf with clock skew
        let exp = numeric_date(claims.as_map(), "exp")?;
        let nbf = numeric_date(claims.as_map(), "nbf")?;
        validate_time_claims_at(exp, nbf, self.clock_skew, now.timestamp())?;

        Ok(claims)
    }
}
