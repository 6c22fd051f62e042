//! # Authz Test Utilities
//!
//! Shared test utilities for the incoming authorization service.
//!
//! This crate provides:
//! - Deterministic Ed25519 keypairs and JWKS documents (`crypto_fixtures`)
//! - Signed test token builder (`token_builders`)
//! - Provider/policy file fixtures (`fixtures`)
//! - Mock JWKS endpoint and server harness (`server_harness`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use authz_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let keypair = TestKeypair::new(1, "k1");
//!     let jwks = MockJwksServer::start(&[&keypair]).await;
//!     let config = ConfigDir::new(
//!         &providers_yaml(&[ProviderDef::new("oauth1", &jwks.jwks_uri())]),
//!         STANDARD_POLICY,
//!     );
//!     let server = TestAuthzServer::spawn(&config).await?;
//!     let response = reqwest::get(format!("{}/ready", server.url())).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod crypto_fixtures;
pub mod fixtures;
pub mod server_harness;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::{jwks_json, TestKeypair};
pub use fixtures::{issuer_for, providers_yaml, ConfigDir, ProviderDef, STANDARD_POLICY};
pub use server_harness::{test_metrics_handle, MockJwksServer, TestAuthzServer};
pub use token_builders::TestTokenBuilder;
