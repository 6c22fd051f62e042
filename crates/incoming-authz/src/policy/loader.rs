//! Policy Model Loader.
//!
//! Parses the node's `incoming:` document and resolves every provider and
//! selector reference against a [`ProviderRegistry`]. Validation collects
//! all violations before failing; there is no partial result.
//!
//! ```yaml
//! incoming:
//!   unlistedEndpointsPolicy: block
//!   endpoints:
//!     - pathPrefix: /api/
//!       methods: [GET]
//!       clients: [frontend, "team1:oauth-selector"]
//!       unlistedClientsPolicy: block
//!       oauth:
//!         provider: corp-sso
//!         verification: offline
//!         policy: strict
//! ```
//!
//! Absent `unlistedEndpointsPolicy` / `unlistedClientsPolicy` default to
//! `block`; absent `oauth.verification` defaults to `offline` and absent
//! `oauth.policy` to `strict`.

use super::model::{
    find_shadowed, ClientRef, EndpointRule, IncomingPermissions, OAuthPolicy, OAuthRequirement,
    PathMatcher, UnlistedPolicy, VerificationMode,
};
use crate::providers::ProviderRegistry;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

// =============================================================================
// Raw document
// =============================================================================

/// Node-scoped declarative configuration as written by the operator.
///
/// Enum-valued fields are kept as strings so that every malformed value can
/// be reported, not just the first one serde trips over.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNodeConfig {
    pub incoming: RawIncoming,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawIncoming {
    pub unlisted_endpoints_policy: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawEndpoint {
    pub path: Option<String>,
    pub path_prefix: Option<String>,
    pub path_regex: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub clients: Vec<String>,
    pub unlisted_clients_policy: Option<String>,
    pub oauth: Option<RawOAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawOAuth {
    pub provider: String,
    pub verification: Option<String>,
    pub policy: Option<String>,
}

// =============================================================================
// Errors
// =============================================================================

/// One problem found while compiling a policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted location, e.g. `incoming.endpoints[2].oauth.provider`.
    pub location: String,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationKind {
    #[error("unknown OAuth provider '{0}'")]
    UnknownProvider(String),

    #[error("selector '{selector}' is not defined by provider '{provider}'")]
    UnknownSelector { provider: String, selector: String },

    #[error("selector client '{0}' requires an oauth block")]
    SelectorWithoutOAuth(String),

    #[error("invalid value '{value}' (expected one of: {expected})")]
    InvalidEnum { value: String, expected: &'static str },

    #[error("exactly one of path, pathPrefix or pathRegex is required")]
    PathMatcherCount,

    #[error("path must start with '/'")]
    RelativePath,

    #[error("invalid path regex: {0}")]
    InvalidRegex(String),

    #[error("invalid client reference '{0}'")]
    InvalidClient(String),

    #[error("duplicate client '{0}'")]
    DuplicateClient(String),

    #[error("same path matcher and methods as endpoints[{first}]")]
    DuplicateMatcher { first: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.kind)
    }
}

/// Every violation found in one policy document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid incoming permissions ({} violations): {}", .violations.len(), join(.violations))]
pub struct ConfigValidationError {
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors loading a policy file.
#[derive(Debug, Error)]
pub enum PolicyLoadError {
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
    Invalid(#[from] ConfigValidationError),
}

// =============================================================================
// Compile
// =============================================================================

#[derive(Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, location: impl Into<String>, kind: ViolationKind) {
        self.0.push(Violation {
            location: location.into(),
            kind,
        });
    }
}

/// Validate a raw document against `registry` and build the permission model.
///
/// # Errors
///
/// Returns a [`ConfigValidationError`] listing every violation.
pub fn compile(
    raw: &RawIncoming,
    registry: &ProviderRegistry,
) -> Result<IncomingPermissions, ConfigValidationError> {
    let mut violations = Violations::default();

    let unlisted_endpoints_policy = parse_policy(
        raw.unlisted_endpoints_policy.as_deref(),
        "incoming.unlistedEndpointsPolicy",
        &mut violations,
    );

    let mut endpoints: Vec<(usize, EndpointRule)> = Vec::with_capacity(raw.endpoints.len());
    for (index, endpoint) in raw.endpoints.iter().enumerate() {
        let location = format!("incoming.endpoints[{index}]");
        if let Some(rule) = compile_endpoint(endpoint, &location, registry, &mut violations) {
            let duplicate_of = endpoints
                .iter()
                .find(|(_, earlier)| {
                    earlier.matcher == rule.matcher && earlier.methods == rule.methods
                })
                .map(|(first, _)| *first);
            if let Some(first) = duplicate_of {
                violations.push(location, ViolationKind::DuplicateMatcher { first });
            }
            endpoints.push((index, rule));
        }
    }

    if !violations.0.is_empty() {
        for violation in &violations.0 {
            tracing::warn!(
                target: "authz.policy",
                location = %violation.location,
                violation = %violation.kind,
                "Policy violation"
            );
        }
        return Err(ConfigValidationError {
            violations: violations.0,
        });
    }

    let endpoints: Vec<EndpointRule> = endpoints.into_iter().map(|(_, rule)| rule).collect();
    let shadowed = find_shadowed(&endpoints);
    for shadow in &shadowed {
        tracing::warn!(
            target: "authz.policy",
            endpoint = shadow.index,
            shadowed_by = shadow.shadowed_by,
            "Endpoint rule is unreachable: an earlier rule matches all of its requests"
        );
    }

    Ok(IncomingPermissions {
        unlisted_endpoints_policy: unlisted_endpoints_policy.unwrap_or(UnlistedPolicy::Block),
        endpoints,
        shadowed,
    })
}

fn compile_endpoint(
    raw: &RawEndpoint,
    location: &str,
    registry: &ProviderRegistry,
    violations: &mut Violations,
) -> Option<EndpointRule> {
    let before = violations.0.len();

    let matcher = compile_matcher(raw, location, violations);

    let mut methods = BTreeSet::new();
    for (i, method) in raw.methods.iter().enumerate() {
        let upper = method.trim().to_ascii_uppercase();
        if HTTP_METHODS.contains(&upper.as_str()) {
            methods.insert(upper);
        } else {
            violations.push(
                format!("{location}.methods[{i}]"),
                ViolationKind::InvalidEnum {
                    value: method.clone(),
                    expected: "GET, HEAD, POST, PUT, DELETE, CONNECT, OPTIONS, TRACE, PATCH",
                },
            );
        }
    }

    let unlisted_clients_policy = parse_policy(
        raw.unlisted_clients_policy.as_deref(),
        &format!("{location}.unlistedClientsPolicy"),
        violations,
    );

    let oauth = raw
        .oauth
        .as_ref()
        .and_then(|oauth| compile_oauth(oauth, &format!("{location}.oauth"), violations));
    let provider = raw
        .oauth
        .as_ref()
        .and_then(|oauth| match registry.lookup(&oauth.provider) {
            Ok(provider) => Some(provider),
            Err(_) => {
                violations.push(
                    format!("{location}.oauth.provider"),
                    ViolationKind::UnknownProvider(oauth.provider.clone()),
                );
                None
            }
        });

    let mut clients: Vec<ClientRef> = Vec::with_capacity(raw.clients.len());
    for (i, value) in raw.clients.iter().enumerate() {
        let client_location = format!("{location}.clients[{i}]");
        let Some(client) = ClientRef::parse(value.trim()) else {
            violations.push(client_location, ViolationKind::InvalidClient(value.clone()));
            continue;
        };

        if let ClientRef::Selector { selector, .. } = &client {
            match (&raw.oauth, provider) {
                (None, _) => violations.push(
                    client_location.clone(),
                    ViolationKind::SelectorWithoutOAuth(client.to_string()),
                ),
                (Some(_), Some(provider)) if provider.claim_field(selector).is_none() => {
                    violations.push(
                        client_location.clone(),
                        ViolationKind::UnknownSelector {
                            provider: provider.name.clone(),
                            selector: selector.clone(),
                        },
                    );
                }
                _ => {}
            }
        }

        if clients.contains(&client) {
            violations.push(client_location, ViolationKind::DuplicateClient(client.to_string()));
            continue;
        }
        clients.push(client);
    }

    if violations.0.len() != before {
        return None;
    }

    Some(EndpointRule {
        matcher: matcher?,
        methods,
        clients,
        unlisted_clients_policy: unlisted_clients_policy.unwrap_or(UnlistedPolicy::Block),
        oauth,
    })
}

fn compile_matcher(
    raw: &RawEndpoint,
    location: &str,
    violations: &mut Violations,
) -> Option<PathMatcher> {
    match (&raw.path, &raw.path_prefix, &raw.path_regex) {
        (Some(path), None, None) => {
            if !path.starts_with('/') {
                violations.push(format!("{location}.path"), ViolationKind::RelativePath);
                return None;
            }
            Some(PathMatcher::Exact(path.clone()))
        }
        (None, Some(prefix), None) => {
            if !prefix.starts_with('/') {
                violations.push(format!("{location}.pathPrefix"), ViolationKind::RelativePath);
                return None;
            }
            Some(PathMatcher::Prefix(prefix.clone()))
        }
        (None, None, Some(pattern)) => match PathMatcher::regex(pattern) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                violations.push(
                    format!("{location}.pathRegex"),
                    ViolationKind::InvalidRegex(e.to_string()),
                );
                None
            }
        },
        _ => {
            violations.push(location, ViolationKind::PathMatcherCount);
            None
        }
    }
}

fn compile_oauth(
    raw: &RawOAuth,
    location: &str,
    violations: &mut Violations,
) -> Option<OAuthRequirement> {
    let verification = match raw.verification.as_deref() {
        None | Some("offline") => Some(VerificationMode::Offline),
        Some(other) => {
            violations.push(
                format!("{location}.verification"),
                ViolationKind::InvalidEnum {
                    value: other.to_string(),
                    expected: "offline",
                },
            );
            None
        }
    };

    let policy = match raw.policy.as_deref() {
        None | Some("strict") => Some(OAuthPolicy::Strict),
        Some("allow_missing") => Some(OAuthPolicy::AllowMissing),
        Some(other) => {
            violations.push(
                format!("{location}.policy"),
                ViolationKind::InvalidEnum {
                    value: other.to_string(),
                    expected: "strict, allow_missing",
                },
            );
            None
        }
    };

    Some(OAuthRequirement {
        provider: raw.provider.clone(),
        verification: verification?,
        policy: policy?,
    })
}

fn parse_policy(
    value: Option<&str>,
    location: &str,
    violations: &mut Violations,
) -> Option<UnlistedPolicy> {
    let value = value?;
    match value.parse() {
        Ok(policy) => Some(policy),
        Err(()) => {
            violations.push(
                location,
                ViolationKind::InvalidEnum {
                    value: value.to_string(),
                    expected: "block, log, allow",
                },
            );
            None
        }
    }
}

// =============================================================================
// Files
// =============================================================================

/// Parse a YAML node document.
///
/// # Errors
///
/// Returns `Yaml` if the document does not have the expected shape.
pub fn parse_document(yaml: &str, origin: &Path) -> Result<RawNodeConfig, PolicyLoadError> {
    serde_yaml::from_str(yaml).map_err(|source| PolicyLoadError::Yaml {
        path: origin.to_path_buf(),
        source,
    })
}

/// Read, parse and compile a policy file.
///
/// # Errors
///
/// Returns `Io`, `Yaml`, or `Invalid` with every violation.
pub fn load_policy(
    path: &Path,
    registry: &ProviderRegistry,
) -> Result<IncomingPermissions, PolicyLoadError> {
    let yaml = std::fs::read_to_string(path).map_err(|source| PolicyLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = parse_document(&yaml, path)?;
    Ok(compile(&raw.incoming, registry)?)
}
