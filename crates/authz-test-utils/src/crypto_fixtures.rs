//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 keypairs published as OKP JWKs.
//! All fixtures are deterministic based on seed values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::EncodingKey;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};
use thiserror::Error;

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// An Ed25519 signing key with a key id, as a provider would publish it.
///
/// # Example
/// ```rust,ignore
/// let keypair = TestKeypair::new(1, "oauth1-key");
/// let jwks = jwks_json(&[&keypair]);
/// let token = TestTokenBuilder::new().issuer("https://oauth1").sign(&keypair);
/// ```
#[derive(Clone)]
pub struct TestKeypair {
    kid: String,
    public_key: Vec<u8>,
    pkcs8: Vec<u8>,
}

impl TestKeypair {
    /// Deterministic keypair for `seed`, published under `kid`.
    ///
    /// Two keypairs with different seeds but the same kid model a provider
    /// impersonation attempt.
    pub fn new(seed: u8, kid: &str) -> Self {
        Self::try_new(seed, kid).expect("test keypair generation should succeed")
    }

    /// Fallible form of [`TestKeypair::new`].
    pub fn try_new(seed: u8, kid: &str) -> Result<Self, FixtureError> {
        let seed_bytes = seed_bytes(seed);
        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .map_err(|e| FixtureError::Crypto(format!("Failed to generate test keypair: {e:?}")))?;

        Ok(Self {
            kid: kid.to_string(),
            public_key: key_pair.public_key().as_ref().to_vec(),
            pkcs8: build_pkcs8_from_seed(&seed_bytes),
        })
    }

    /// Key id placed in token headers and in the JWK.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Raw 32-byte public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Signing key for `jsonwebtoken::encode`.
    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_ed_der(&self.pkcs8)
    }

    /// The public half as an OKP JWK.
    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "kid": self.kid,
            "alg": "EdDSA",
            "use": "sig",
            "x": URL_SAFE_NO_PAD.encode(&self.public_key),
        })
    }
}

impl std::fmt::Debug for TestKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestKeypair")
            .field("kid", &self.kid)
            .field("pkcs8", &"[REDACTED]")
            .finish()
    }
}

/// A JWKS document publishing `keypairs`.
pub fn jwks_json(keypairs: &[&TestKeypair]) -> Value {
    json!({ "keys": keypairs.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

fn seed_bytes(seed: u8) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8).wrapping_add(seed);
    }
    bytes
}

/// Build a PKCS#8 v1 document from an Ed25519 seed
///
/// This is a test-only utility. Production code never holds signing keys.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_deterministic() {
        let a = TestKeypair::new(1, "k");
        let b = TestKeypair::new(1, "k");
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.jwk(), b.jwk());
    }

    #[test]
    fn test_different_seeds_produce_different_keys() {
        let a = TestKeypair::new(1, "k");
        let b = TestKeypair::new(2, "k");
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_pkcs8_matches_public_key() {
        let keypair = TestKeypair::new(7, "k");
        let parsed = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&keypair.pkcs8).unwrap();
        assert_eq!(parsed.public_key().as_ref(), keypair.public_key());
    }

    #[test]
    fn test_jwk_shape() {
        let jwk = TestKeypair::new(3, "kid-3").jwk();
        assert_eq!(jwk["kty"], "OKP");
        assert_eq!(jwk["crv"], "Ed25519");
        assert_eq!(jwk["kid"], "kid-3");
        assert_eq!(
            URL_SAFE_NO_PAD
                .decode(jwk["x"].as_str().unwrap())
                .unwrap()
                .len(),
            32
        );
    }

    #[test]
    fn test_jwks_json_lists_all_keys() {
        let a = TestKeypair::new(1, "a");
        let b = TestKeypair::new(2, "b");
        let jwks = jwks_json(&[&a, &b]);
        assert_eq!(jwks["keys"].as_array().unwrap().len(), 2);
    }
}
