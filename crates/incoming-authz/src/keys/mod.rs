//! Key Material Cache: provider JWKS fetching, conversion and caching.

pub mod cache;
pub mod jwks;

pub use cache::{CacheSettings, KeyMaterialCache, KeySet, ProviderHealth};
pub use jwks::{HttpJwksSource, Jwk, JwksResponse, JwksSource, KeyFetchError, VerificationKey};
