//! Common utilities shared across the incoming authorization crates.

#![warn(clippy::pedantic)]

/// Module for shared observability configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, header parsing, time claims)
pub mod jwt;
