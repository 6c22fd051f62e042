//! Builder patterns for test data construction
//!
//! Provides a fluent API for signing test bearer tokens.

use crate::crypto_fixtures::TestKeypair;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use serde_json::{Map, Value};

/// Builder for signed test JWTs
///
/// Defaults: no `iss`, `sub` "test-subject", `iat` now, `exp` one hour out.
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .issuer("https://oauth1.example.com")
///     .claim("authorities", json!(["team1"]))
///     .expires_in(60)
///     .sign(&keypair);
/// ```
#[derive(Debug, Clone)]
pub struct TestTokenBuilder {
    iss: Option<String>,
    sub: String,
    iat: i64,
    exp: Option<i64>,
    nbf: Option<i64>,
    extra: Map<String, Value>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            iss: None,
            sub: "test-subject".to_string(),
            iat: now.timestamp(),
            exp: Some((now + Duration::seconds(3600)).timestamp()),
            nbf: None,
            extra: Map::new(),
        }
    }

    /// Set the `iss` claim
    pub fn issuer(mut self, issuer: &str) -> Self {
        self.iss = Some(issuer.to_string());
        self
    }

    /// Drop the `iss` claim
    pub fn without_issuer(mut self) -> Self {
        self.iss = None;
        self
    }

    /// Set the `sub` claim
    pub fn subject(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    /// Add an arbitrary claim
    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }

    /// Set expiration in seconds from now (negative for already expired)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Drop the `exp` claim
    pub fn without_expiry(mut self) -> Self {
        self.exp = None;
        self
    }

    /// Set not-before in seconds from now
    pub fn not_before_in(mut self, seconds: i64) -> Self {
        self.nbf = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = self.extra;
        claims.insert("sub".to_string(), Value::from(self.sub));
        claims.insert("iat".to_string(), Value::from(self.iat));
        if let Some(iss) = self.iss {
            claims.insert("iss".to_string(), Value::from(iss));
        }
        if let Some(exp) = self.exp {
            claims.insert("exp".to_string(), Value::from(exp));
        }
        if let Some(nbf) = self.nbf {
            claims.insert("nbf".to_string(), Value::from(nbf));
        }
        Value::Object(claims)
    }

    /// Sign with `keypair` (EdDSA), putting its kid in the header
    pub fn sign(self, keypair: &TestKeypair) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(keypair.kid().to_string());
        encode(&header, &self.build(), &keypair.encoding_key())
            .expect("signing a test token should succeed")
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let claims = TestTokenBuilder::default().build();
        assert_eq!(claims["sub"], "test-subject");
        assert!(claims.get("iss").is_none());
        assert!(claims["exp"].as_i64().unwrap() > claims["iat"].as_i64().unwrap());
    }

    #[test]
    fn test_builder_optional_claims() {
        let claims = TestTokenBuilder::new()
            .issuer("https://issuer")
            .claim("authorities", json!(["team1"]))
            .without_expiry()
            .not_before_in(60)
            .build();

        assert_eq!(claims["iss"], "https://issuer");
        assert_eq!(claims["authorities"], json!(["team1"]));
        assert!(claims.get("exp").is_none());
        assert!(claims["nbf"].as_i64().is_some());
    }

    #[test]
    fn test_signed_token_carries_kid() {
        let keypair = TestKeypair::new(1, "kid-1");
        let token = TestTokenBuilder::new().sign(&keypair);
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::EdDSA);
        assert_eq!(header.kid.as_deref(), Some("kid-1"));
    }
}
