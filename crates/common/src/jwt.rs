//! JWT utilities shared by the token verifier and its test fixtures.
//!
//! This module provides:
//! - Size limits for DoS prevention
//! - Clock skew constants for `exp`/`nbf` validation
//! - Compact header parsing (`kid` and `alg`) without signature verification
//! - Time-claim validation with clock skew tolerance
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Header parsing never trusts the token for key selection beyond `kid`
//! - Error messages are generic; the variant is kept for diagnostics only
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{parse_header, validate_time_claims_at, DEFAULT_CLOCK_SKEW};
//!
//! let header = parse_header(token)?;
//! let key = key_set.get(&header.kid)?;
//! // ... verify signature, then:
//! validate_time_claims_at(exp, nbf, DEFAULT_CLOCK_SKEW, now.timestamp())?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before any base64 decoding or
/// signature work. Typical bearer tokens are well under 2KB.
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default JWT clock skew tolerance (5 minutes).
///
/// Applied to both `exp` and `nbf` checks.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while parsing or time-checking a JWT.
///
/// All variants display the same message so that callers can surface them
/// to clients without leaking which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid compact JWT).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token header has no usable `kid`.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token `exp` is in the past (beyond clock skew).
    #[error("The access token is invalid or expired")]
    Expired,

    /// Token `nbf` is in the future (beyond clock skew).
    #[error("The access token is invalid or expired")]
    NotYetValid,
}

// =============================================================================
// Header
// =============================================================================

/// The parts of a JOSE header needed to select a verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    /// Key identifier, used to look the key up in a provider's key set.
    pub kid: String,

    /// Signing algorithm name as written in the token (e.g. `RS256`).
    pub alg: String,
}

/// Parse the compact JWT header without verifying the signature.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
/// - `MalformedToken` - Not three dot-separated parts, bad base64, bad JSON,
///   or no string `alg`
/// - `MissingKid` - Header has no non-empty string `kid`
pub fn parse_header(token: &str) -> Result<TokenHeader, JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let (Some(header_part), Some(_payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let header: Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MalformedToken)?;

    let kid = header
        .get("kid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)?;

    Ok(TokenHeader { kid, alg })
}

// =============================================================================
// Time claims
// =============================================================================

/// Read an optional NumericDate claim (`exp`, `nbf`, `iat`).
///
/// Fractional values are truncated toward negative infinity.
///
/// # Errors
///
/// Returns `MalformedToken` if the claim is present but not a number.
#[allow(clippy::cast_possible_truncation)]
pub fn numeric_date(claims: &Map<String, Value>, name: &str) -> Result<Option<i64>, JwtValidationError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            // Safe cast: NumericDate values fit comfortably in i64 seconds
            .or_else(|| n.as_f64().map(|f| f.floor() as i64))
            .map(Some)
            .ok_or(JwtValidationError::MalformedToken),
        Some(_) => Err(JwtValidationError::MalformedToken),
    }
}

/// Validate `exp` and `nbf` against `now` (seconds since the epoch).
///
/// A missing `exp` means the token does not expire; a missing `nbf` means it
/// is valid immediately.
///
/// # Errors
///
/// - `Expired` - `now > exp + clock_skew`
/// - `NotYetValid` - `now + clock_skew < nbf`
pub fn validate_time_claims_at(
    exp: Option<i64>,
    nbf: Option<i64>,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // Safe cast: clock_skew is bounded to MAX_CLOCK_SKEW by configuration
    #[allow(clippy::cast_possible_wrap)]
    let skew = clock_skew.as_secs() as i64;

    if let Some(exp) = exp {
        if now > exp.saturating_add(skew) {
            tracing::debug!(
                target: "common.jwt",
                exp = exp,
                now = now,
                clock_skew_secs = skew,
                "Token rejected: expired"
            );
            return Err(JwtValidationError::Expired);
        }
    }

    if let Some(nbf) = nbf {
        if now.saturating_add(skew) < nbf {
            tracing::debug!(
                target: "common.jwt",
                nbf = nbf,
                now = now,
                clock_skew_secs = skew,
                "Token rejected: not yet valid"
            );
            return Err(JwtValidationError::NotYetValid);
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
