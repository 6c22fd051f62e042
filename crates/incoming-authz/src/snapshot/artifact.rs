//! The proxy-visible enforcement artifact.
//!
//! Two descriptors make up the artifact: an authentication filter with one
//! entry per referenced provider, and an authorization filter with one
//! compiled predicate per endpoint rule. Predicates can be evaluated here as
//! well, which keeps the artifact checkable against the decision engine.

use crate::auth::ClaimSet;
use crate::policy::model::{ClientRef, EndpointRule, OAuthPolicy, PathMatcher, UnlistedPolicy};
use crate::providers::{OAuthProvider, ProviderRegistry};
use ring::digest::{digest, SHA256};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

// === Authentication filter ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterAddress {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteJwks {
    pub uri: String,
    pub cluster: ClusterAddress,
    pub cache_duration_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JwtProviderConfig {
    pub name: String,
    pub issuer: String,
    pub remote_jwks: RemoteJwks,
}

impl JwtProviderConfig {
    pub fn from_provider(provider: &OAuthProvider, cache_ttl: Duration) -> Self {
        Self {
            name: provider.name.clone(),
            issuer: provider.issuer.clone(),
            remote_jwks: RemoteJwks {
                uri: provider.jwks_uri.clone(),
                cluster: ClusterAddress {
                    name: provider.cluster_name.clone(),
                    port: provider.cluster_port,
                },
                cache_duration_seconds: cache_ttl.as_secs(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthenticationFilterConfig {
    /// Sorted by provider name.
    pub providers: Vec<JwtProviderConfig>,
}

// === Authorization filter ===

/// Identity available to a predicate for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySignals<'a> {
    /// mTLS peer identity of the caller.
    pub peer_identity: Option<&'a str>,
    /// Provider that verified the claims, and the claims.
    pub verified: Option<(&'a str, &'a ClaimSet)>,
}

/// Declarative client-matching logic for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Any,
    PeerIdentity {
        name: String,
    },
    ClaimContains {
        provider: String,
        claim: String,
        value: String,
    },
    AnyOf {
        predicates: Vec<Predicate>,
    },
}

impl Predicate {
    pub fn evaluate(&self, signals: &IdentitySignals<'_>) -> bool {
        match self {
            Self::Any => true,
            Self::PeerIdentity { name } => signals.peer_identity == Some(name.as_str()),
            Self::ClaimContains {
                provider,
                claim,
                value,
            } => signals
                .verified
                .is_some_and(|(by, claims)| by == provider && claims.contains(claim, value)),
            Self::AnyOf { predicates } => predicates.iter().any(|p| p.evaluate(signals)),
        }
    }

    /// Compile an endpoint's client list.
    ///
    /// Selector clients resolve to the claim field of the endpoint's provider.
    /// A selector that does not resolve compiles to nothing, so it can never
    /// allow a request.
    pub fn for_clients(rule: &EndpointRule, registry: &ProviderRegistry) -> Self {
        if rule.clients.is_empty() {
            return Self::Any;
        }

        let provider = rule
            .oauth
            .as_ref()
            .and_then(|oauth| registry.lookup(&oauth.provider).ok());

        let mut predicates: Vec<Self> = rule
            .clients
            .iter()
            .filter_map(|client| match client {
                ClientRef::Service { name } => Some(Self::PeerIdentity { name: name.clone() }),
                ClientRef::Selector { name, selector } => {
                    let provider = provider?;
                    Some(Self::ClaimContains {
                        provider: provider.name.clone(),
                        claim: provider.claim_field(selector)?.to_string(),
                        value: name.clone(),
                    })
                }
            })
            .collect();

        match predicates.len() {
            1 => predicates.pop().unwrap_or(Self::AnyOf { predicates: vec![] }),
            _ => Self::AnyOf { predicates },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthnRequirement {
    pub provider: String,
    pub policy: OAuthPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledEndpoint {
    pub matcher: PathMatcher,
    pub methods: BTreeSet<String>,
    pub authentication: Option<AuthnRequirement>,
    pub allow: Predicate,
    pub unlisted_clients: UnlistedPolicy,
}

impl CompiledEndpoint {
    pub fn from_rule(rule: &EndpointRule, registry: &ProviderRegistry) -> Self {
        Self {
            matcher: rule.matcher.clone(),
            methods: rule.methods.clone(),
            authentication: rule.oauth.as_ref().map(|oauth| AuthnRequirement {
                provider: oauth.provider.clone(),
                policy: oauth.policy,
            }),
            allow: Predicate::for_clients(rule, registry),
            unlisted_clients: rule.unlisted_clients_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationFilterConfig {
    pub unlisted_endpoints: UnlistedPolicy,
    /// Precedence order: first match wins.
    pub endpoints: Vec<CompiledEndpoint>,
}

// === Artifact ===

/// Everything the proxy sees for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyArtifact {
    pub node_id: String,
    pub authentication: AuthenticationFilterConfig,
    pub authorization: AuthorizationFilterConfig,
}

impl ProxyArtifact {
    /// Hex SHA-256 of the artifact's canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns the serialization error, which the artifact types never produce
    /// in practice.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(digest(&SHA256, &bytes)))
    }
}
