//! OAuth provider registry.
//!
//! Holds validated provider definitions keyed by name. A registry is built
//! once per configuration cycle, wrapped in an `Arc`, and never mutated
//! afterwards; a configuration change builds a new registry.
//!
//! # File format
//!
//! ```yaml
//! providers:
//!   corp-sso:
//!     issuer: https://sso.example.com
//!     jwksUri: https://sso.example.com/.well-known/jwks.json
//!     clusterName: corp-sso
//!     clusterPort: 443
//!     selectorToClaimField:
//!       team: authorities
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// An OAuth/JWT token issuer that endpoints can require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProvider {
    /// Unique provider name referenced by `oauth.provider` in policies.
    pub name: String,

    /// Expected `iss` claim of tokens issued by this provider.
    pub issuer: String,

    /// Where the provider publishes its signing keys.
    pub jwks_uri: String,

    /// Upstream cluster the proxy uses to reach the JWKS endpoint.
    pub cluster_name: String,

    /// Port of the JWKS upstream cluster.
    pub cluster_port: u16,

    /// Selector name → claim field holding client names for that selector.
    pub selector_to_claim_field: BTreeMap<String, String>,
}

impl OAuthProvider {
    /// Claim field backing `selector`, if the provider defines it.
    pub fn claim_field(&self, selector: &str) -> Option<&str> {
        self.selector_to_claim_field.get(selector).map(String::as_str)
    }
}

/// Provider registry integrity errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate OAuth provider: {0}")]
    DuplicateProvider(String),

    #[error("Unknown OAuth provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid OAuth provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },
}

/// Immutable set of providers for one compilation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider.
    ///
    /// # Errors
    ///
    /// - `DuplicateProvider` if the name is already registered
    /// - `InvalidProvider` if a required field is empty or malformed
    pub fn register(&mut self, provider: OAuthProvider) -> Result<(), RegistryError> {
        validate_provider(&provider)?;

        if self.providers.contains_key(&provider.name) {
            return Err(RegistryError::DuplicateProvider(provider.name));
        }

        tracing::debug!(
            target: "authz.registry",
            provider = %provider.name,
            issuer = %provider.issuer,
            selectors = provider.selector_to_claim_field.len(),
            "Registered OAuth provider"
        );
        self.providers
            .insert(provider.name.clone(), Arc::new(provider));
        Ok(())
    }

    /// Look a provider up by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if no provider has this name.
    pub fn lookup(&self, name: &str) -> Result<&Arc<OAuthProvider>, RegistryError> {
        self.providers
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn validate_provider(provider: &OAuthProvider) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidProvider {
        name: provider.name.clone(),
        reason: reason.to_string(),
    };

    if provider.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if provider.issuer.trim().is_empty() {
        return Err(invalid("issuer must not be empty"));
    }
    match reqwest::Url::parse(&provider.jwks_uri) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(_) => return Err(invalid("jwksUri must use http or https")),
        Err(_) => return Err(invalid("jwksUri is not a valid URL")),
    }
    if provider.cluster_name.trim().is_empty() {
        return Err(invalid("clusterName must not be empty"));
    }
    if provider.cluster_port == 0 {
        return Err(invalid("clusterPort must be greater than 0"));
    }
    for (selector, field) in &provider.selector_to_claim_field {
        if selector.trim().is_empty() || field.trim().is_empty() {
            return Err(invalid("selectorToClaimField entries must not be empty"));
        }
    }
    Ok(())
}

// =============================================================================
// Loading
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProviderSpec {
    issuer: String,
    jwks_uri: String,
    cluster_name: String,
    cluster_port: u16,
    #[serde(default)]
    selector_to_claim_field: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderSpec>,
}

/// Errors reading declarative files from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Parse one provider document and register its providers into `registry`.
///
/// # Errors
///
/// Returns `LoadError::Yaml` for unparseable input and `LoadError::Registry`
/// for duplicate or invalid providers.
pub fn register_from_yaml(
    registry: &mut ProviderRegistry,
    yaml: &str,
    origin: &Path,
) -> Result<(), LoadError> {
    let file: ProvidersFile = serde_yaml::from_str(yaml).map_err(|source| LoadError::Yaml {
        path: origin.to_path_buf(),
        source,
    })?;

    for (name, spec) in file.providers {
        registry.register(OAuthProvider {
            name,
            issuer: spec.issuer,
            jwks_uri: spec.jwks_uri,
            cluster_name: spec.cluster_name,
            cluster_port: spec.cluster_port,
            selector_to_claim_field: spec.selector_to_claim_field,
        })?;
    }
    Ok(())
}

/// Build a registry from the contents of one or more provider files.
///
/// Each document is paired with the path it was read from, for error
/// messages. A provider name defined in two documents is a
/// `DuplicateProvider` error.
///
/// # Errors
///
/// Returns the first parse or registration error.
pub fn registry_from_documents<'a>(
    documents: impl IntoIterator<Item = (&'a Path, &'a str)>,
) -> Result<ProviderRegistry, LoadError> {
    let mut registry = ProviderRegistry::new();
    let mut files = 0usize;
    for (path, yaml) in documents {
        register_from_yaml(&mut registry, yaml, path)?;
        files += 1;
    }
    tracing::debug!(
        target: "authz.registry",
        providers = registry.len(),
        files,
        "Provider registry built"
    );
    Ok(registry)
}
