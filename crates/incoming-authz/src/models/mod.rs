//! Request and response bodies of the HTTP surface.

use crate::keys::ProviderHealth;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /v1/check`.
///
/// The caller's `Authorization` header travels as a header, not in the body.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub peer_identity: Option<String>,
}

/// Successful `POST /v1/check` response.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResponse {
    /// Always `allow`; denials are returned as errors.
    pub decision: &'static str,
    pub reason: &'static str,
    pub auditable: bool,
    pub snapshot_version: u64,
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<u64>,
    /// Key material health of every provider the snapshot references.
    pub providers: BTreeMap<String, ProviderHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
