//! Enforcement Config Generator.
//!
//! Compiles a node document and a provider registry into a complete
//! [`CompiledSnapshot`]. Nothing is exposed until the whole snapshot is
//! built; a failed compile returns the error and leaves the caller's current
//! snapshot untouched.

use super::artifact::{
    AuthenticationFilterConfig, AuthorizationFilterConfig, CompiledEndpoint, JwtProviderConfig,
    ProxyArtifact,
};
use crate::keys::KeyMaterialCache;
use crate::policy::loader::RawNodeConfig;
use crate::policy::model::{IncomingPermissions, ShadowedRule};
use crate::policy::{self, ConfigValidationError};
use crate::providers::ProviderRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),

    #[error("Failed to fingerprint artifact: {0}")]
    Fingerprint(String),
}

/// An immutable, fully compiled unit of enforcement configuration.
///
/// `version` is assigned by the [`SnapshotStore`](super::SnapshotStore) on
/// publication and is `0` before that.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledSnapshot {
    pub version: u64,
    pub fingerprint: String,
    pub compiled_at: DateTime<Utc>,
    #[serde(flatten)]
    pub artifact: ProxyArtifact,
    pub shadowed: Vec<ShadowedRule>,
    #[serde(skip)]
    pub registry: Arc<ProviderRegistry>,
    #[serde(skip)]
    pub permissions: Arc<IncomingPermissions>,
}

/// Compile `node` for `node_id`.
///
/// # Errors
///
/// Returns `Invalid` with every violation when the document does not
/// validate against `registry`.
pub fn compile(
    node_id: &str,
    node: &RawNodeConfig,
    registry: Arc<ProviderRegistry>,
    keys: &KeyMaterialCache,
) -> Result<CompiledSnapshot, SnapshotError> {
    let permissions = policy::compile(&node.incoming, &registry)?;
    let artifact = build_artifact(node_id, &permissions, &registry, keys.settings().ttl);
    let fingerprint = artifact
        .fingerprint()
        .map_err(|e| SnapshotError::Fingerprint(e.to_string()))?;

    tracing::debug!(
        target: "authz.snapshot",
        node_id = %node_id,
        fingerprint = %fingerprint,
        endpoints = permissions.endpoints.len(),
        providers = artifact.authentication.providers.len(),
        "Compiled snapshot"
    );

    Ok(CompiledSnapshot {
        version: 0,
        fingerprint,
        compiled_at: Utc::now(),
        artifact,
        shadowed: permissions.shadowed.clone(),
        registry,
        permissions: Arc::new(permissions),
    })
}

/// Build the proxy artifact for already-validated permissions.
///
/// One authentication entry per distinct provider the rules reference,
/// sorted by name, and one compiled endpoint per rule in precedence order.
pub fn build_artifact(
    node_id: &str,
    permissions: &IncomingPermissions,
    registry: &ProviderRegistry,
    cache_ttl: Duration,
) -> ProxyArtifact {
    let providers = permissions
        .referenced_providers()
        .into_iter()
        .filter_map(|name| registry.lookup(name).ok())
        .map(|provider| JwtProviderConfig::from_provider(provider, cache_ttl))
        .collect();

    let endpoints = permissions
        .endpoints
        .iter()
        .map(|rule| CompiledEndpoint::from_rule(rule, registry))
        .collect();

    ProxyArtifact {
        node_id: node_id.to_string(),
        authentication: AuthenticationFilterConfig { providers },
        authorization: AuthorizationFilterConfig {
            unlisted_endpoints: permissions.unlisted_endpoints_policy,
            endpoints,
        },
    }
}
