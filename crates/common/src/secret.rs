//! Secret types for protecting bearer tokens from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate and adds
//! [`BearerToken`], the form in which a request's `Authorization` header
//! travels through the authorization path.
//!
//! # Compile-Time Safety
//!
//! `SecretString` implements `Debug` with redaction, so any struct deriving
//! `Debug` that holds one gets safe logging behaviour for free.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{BearerToken, ExposeSecret};
//!
//! let token = BearerToken::from_authorization("Bearer abc.def.ghi").unwrap();
//! assert_eq!(token.expose_secret(), "abc.def.ghi");
//! assert!(!format!("{token:?}").contains("abc.def.ghi"));
//! ```

pub use secrecy::{ExposeSecret, SecretString};

/// A bearer token taken from an `Authorization` header.
///
/// The raw value is never printed; use [`ExposeSecret::expose_secret`] to
/// hand it to the verifier.
#[derive(Clone)]
pub struct BearerToken(SecretString);

impl BearerToken {
    /// Parse an `Authorization` header value of the form `Bearer <token>`.
    ///
    /// The scheme is matched case-insensitively. Returns `None` when the
    /// scheme is not `Bearer` or the token part is empty.
    #[must_use]
    pub fn from_authorization(header_value: &str) -> Option<Self> {
        let (scheme, token) = header_value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        Some(Self(SecretString::from(token)))
    }
}

impl ExposeSecret<str> for BearerToken {
    fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

impl From<SecretString> for BearerToken {
    fn from(value: SecretString) -> Self {
        Self(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_bearer_from_authorization() {
        let token = BearerToken::from_authorization("Bearer a.b.c").unwrap();
        assert_eq!(token.expose_secret(), "a.b.c");
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let token = BearerToken::from_authorization("bearer   a.b.c  ").unwrap();
        assert_eq!(token.expose_secret(), "a.b.c");
    }

    #[test]
    fn test_bearer_rejects_other_schemes_and_empty_values() {
        assert!(BearerToken::from_authorization("Basic dXNlcjpwYXNz").is_none());
        assert!(BearerToken::from_authorization("Bearer").is_none());
        assert!(BearerToken::from_authorization("Bearer    ").is_none());
        assert!(BearerToken::from_authorization("").is_none());
    }

    #[test]
    fn test_bearer_debug_is_redacted() {
        let token = BearerToken::from_authorization("Bearer very-secret-token").unwrap();
        let debug_str = format!("{token:?}");
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("very-secret-token"));
    }

    #[test]
    fn test_struct_with_secret_deserializes_and_redacts() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Forwarded {
            path: String,
            authorization: SecretString,
        }

        let json = r#"{"path": "/status", "authorization": "Bearer my-secret-value"}"#;
        let forwarded: Forwarded = serde_json::from_str(json).expect("deserialize");

        let token = BearerToken::from_authorization(forwarded.authorization.expose_secret())
            .expect("bearer");
        assert_eq!(token.expose_secret(), "my-secret-value");

        let debug = format!("{forwarded:?}");
        assert!(debug.contains("/status"));
        assert!(!debug.contains("my-secret-value"));
    }
}
