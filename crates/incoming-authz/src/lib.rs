//! Incoming Authorization Service Library
//!
//! Compiles per-node incoming-permission declarations into enforceable
//! per-request decisions. Two trust signals are combined: the mTLS peer
//! identity of the caller and the claims of an OAuth2/JWT bearer token
//! issued by one of several independent providers.
//!
//! # Architecture
//!
//! ```text
//! providers -> keys -> policy -> auth -> decision -> snapshot
//!                                    \-> routes/handlers (HTTP surface)
//! tasks: config_reload (files -> snapshot), key_refresh (JWKS -> keys)
//! ```
//!
//! Shared state (provider registry, key sets, compiled snapshot) is
//! copy-on-write and published with an atomic pointer swap. The request path
//! never locks and never performs I/O.
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `providers` - Provider Registry
//! - `keys` - Key Material Cache and JWKS fetching
//! - `policy` - Policy Model and its loader
//! - `auth` - Token Verifier, claims and the Claim Selector Resolver
//! - `decision` - Authorization Decision Engine
//! - `snapshot` - Enforcement Config Generator and snapshot publication
//! - `tasks` - Background config reload and key refresh
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers`, `middleware`, `models`, `routes` - HTTP surface
//! - `observability` - Metrics

pub mod auth;
pub mod config;
pub mod decision;
pub mod errors;
pub mod handlers;
pub mod keys;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod policy;
pub mod providers;
pub mod routes;
pub mod snapshot;
pub mod tasks;
