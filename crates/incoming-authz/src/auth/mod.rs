//! Request identity: token verification, claims and selector matching.

pub mod claims;
pub mod selector;
pub mod verifier;

pub use claims::ClaimSet;
pub use verifier::{TokenError, TokenVerifier};
