//! Authorization Decision Engine.
//!
//! Evaluates one request against the first matching rule of the current
//! snapshot. Every path through [`evaluate`] ends in an explicit allow or
//! deny with a reason; nothing here performs I/O or can fail.
//!
//! Order of evaluation:
//!
//! 1. No rule matches: apply `unlistedEndpointsPolicy`.
//! 2. The rule has an `oauth` block: verify the bearer token. A missing token
//!    is only acceptable under `allow_missing`; a presented token must
//!    always verify.
//! 3. No clients listed: allow.
//! 4. Any client matches (peer identity or selector claim): allow.
//! 5. Otherwise apply `unlistedClientsPolicy`.

use crate::auth::{selector, ClaimSet, TokenError, TokenVerifier};
use crate::observability::metrics;
use crate::policy::model::{
    ClientRef, EndpointRule, IncomingPermissions, OAuthPolicy, UnlistedPolicy,
};
use crate::providers::{OAuthProvider, ProviderRegistry};
use crate::snapshot::SnapshotStore;
use chrono::{DateTime, Utc};
use common::secret::{BearerToken, ExposeSecret};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Identity signals of one request, already extracted by the caller.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub path: &'a str,
    pub method: &'a str,
    /// mTLS peer identity from the terminated connection.
    pub peer_identity: Option<&'a str>,
    /// Raw `Authorization` header value.
    pub authorization: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyKind {
    /// No acceptable identity: missing or invalid token.
    Unauthenticated,
    /// Identity accepted, access denied.
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    Deny(DenyKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    UnlistedEndpointBlocked,
    UnlistedEndpointLogged,
    UnlistedEndpointAllowed,
    MissingToken,
    InvalidToken(TokenError),
    NoClientsRequired,
    ClientMatched,
    UnlistedClientBlocked,
    UnlistedClientLogged,
    UnlistedClientAllowed,
}

impl DecisionReason {
    /// Stable identifier used in responses, metrics and audit records.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnlistedEndpointBlocked => "unlisted_endpoint_blocked",
            Self::UnlistedEndpointLogged => "unlisted_endpoint_logged",
            Self::UnlistedEndpointAllowed => "unlisted_endpoint_allowed",
            Self::MissingToken => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::NoClientsRequired => "no_clients_required",
            Self::ClientMatched => "client_matched",
            Self::UnlistedClientBlocked => "unlisted_client_blocked",
            Self::UnlistedClientLogged => "unlisted_client_logged",
            Self::UnlistedClientAllowed => "unlisted_client_allowed",
        }
    }

    /// The specific token failure, for diagnostics only.
    pub fn token_error(self) -> Option<TokenError> {
        match self {
            Self::InvalidToken(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    pub reason: DecisionReason,
    /// Whether an audit record is due for this decision.
    pub auditable: bool,
    /// Index of the rule that matched, if any.
    pub endpoint: Option<usize>,
}

impl Decision {
    fn allow(reason: DecisionReason, auditable: bool, endpoint: Option<usize>) -> Self {
        Self {
            outcome: Outcome::Allow,
            reason,
            auditable,
            endpoint,
        }
    }

    fn deny(kind: DenyKind, reason: DecisionReason, endpoint: Option<usize>) -> Self {
        Self {
            outcome: Outcome::Deny(kind),
            reason,
            auditable: true,
            endpoint,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// `allow`, `unauthenticated` or `forbidden`.
    pub fn outcome_label(&self) -> &'static str {
        match self.outcome {
            Outcome::Allow => "allow",
            Outcome::Deny(DenyKind::Unauthenticated) => "unauthenticated",
            Outcome::Deny(DenyKind::Forbidden) => "forbidden",
        }
    }
}

/// Evaluate `request` against `permissions` at `now`.
pub fn evaluate(
    permissions: &IncomingPermissions,
    registry: &ProviderRegistry,
    verifier: &TokenVerifier,
    request: &RequestContext<'_>,
    now: DateTime<Utc>,
) -> Decision {
    let Some((index, rule)) = permissions.match_endpoint(request.path, request.method) else {
        return match permissions.unlisted_endpoints_policy {
            UnlistedPolicy::Block => Decision::deny(
                DenyKind::Forbidden,
                DecisionReason::UnlistedEndpointBlocked,
                None,
            ),
            UnlistedPolicy::Log => {
                Decision::allow(DecisionReason::UnlistedEndpointLogged, true, None)
            }
            UnlistedPolicy::Allow => {
                Decision::allow(DecisionReason::UnlistedEndpointAllowed, false, None)
            }
        };
    };
    let endpoint = Some(index);

    // Authentication
    let mut verified: Option<(&OAuthProvider, ClaimSet)> = None;
    if let Some(oauth) = &rule.oauth {
        let Ok(provider) = registry.lookup(&oauth.provider) else {
            return Decision::deny(
                DenyKind::Unauthenticated,
                DecisionReason::InvalidToken(TokenError::ProviderUnavailable),
                endpoint,
            );
        };

        match request.authorization {
            None if oauth.policy == OAuthPolicy::AllowMissing => {}
            None => {
                return Decision::deny(
                    DenyKind::Unauthenticated,
                    DecisionReason::MissingToken,
                    endpoint,
                );
            }
            Some(header) => {
                let result = BearerToken::from_authorization(header)
                    .ok_or(TokenError::MalformedToken)
                    .and_then(|token| verifier.verify_at(token.expose_secret(), provider, now));
                match result {
                    Ok(claims) => verified = Some((provider.as_ref(), claims)),
                    Err(e) => {
                        return Decision::deny(
                            DenyKind::Unauthenticated,
                            DecisionReason::InvalidToken(e),
                            endpoint,
                        );
                    }
                }
            }
        }
    }

    // Authorization
    if rule.clients.is_empty() {
        return Decision::allow(DecisionReason::NoClientsRequired, false, endpoint);
    }

    let verified = verified.as_ref().map(|(provider, claims)| (*provider, claims));
    if clients_match(rule, request.peer_identity, verified) {
        return Decision::allow(DecisionReason::ClientMatched, false, endpoint);
    }

    match rule.unlisted_clients_policy {
        UnlistedPolicy::Block => Decision::deny(
            DenyKind::Forbidden,
            DecisionReason::UnlistedClientBlocked,
            endpoint,
        ),
        UnlistedPolicy::Log => Decision::allow(DecisionReason::UnlistedClientLogged, true, endpoint),
        UnlistedPolicy::Allow => {
            Decision::allow(DecisionReason::UnlistedClientAllowed, false, endpoint)
        }
    }
}

/// Whether any of `rule`'s clients names the caller.
pub fn clients_match(
    rule: &EndpointRule,
    peer_identity: Option<&str>,
    verified: Option<(&OAuthProvider, &ClaimSet)>,
) -> bool {
    rule.clients
        .iter()
        .any(|client| client_matches(client, peer_identity, verified))
}

fn client_matches(
    client: &ClientRef,
    peer_identity: Option<&str>,
    verified: Option<(&OAuthProvider, &ClaimSet)>,
) -> bool {
    match client {
        ClientRef::Service { name } => peer_identity == Some(name.as_str()),
        ClientRef::Selector { name, selector } => verified.is_some_and(|(provider, claims)| {
            selector::matches_provider(provider, selector, claims, name)
        }),
    }
}

/// Request-time entry point over the published snapshot.
#[derive(Debug, Clone)]
pub struct Authorizer {
    store: Arc<SnapshotStore>,
    verifier: Arc<TokenVerifier>,
}

impl Authorizer {
    pub fn new(store: Arc<SnapshotStore>, verifier: Arc<TokenVerifier>) -> Self {
        Self { store, verifier }
    }

    /// Decide `request` against the current snapshot.
    ///
    /// Returns `None` when no snapshot has been published yet.
    pub fn authorize(&self, request: &RequestContext<'_>) -> Option<Decision> {
        let start = Instant::now();
        let snapshot = self.store.current()?;

        let decision = evaluate(
            &snapshot.permissions,
            &snapshot.registry,
            &self.verifier,
            request,
            Utc::now(),
        );

        metrics::record_decision(
            decision.outcome_label(),
            decision.reason.code(),
            start.elapsed(),
        );

        if decision.auditable {
            tracing::info!(
                target: "authz.audit",
                outcome = decision.outcome_label(),
                reason = decision.reason.code(),
                token_error = decision.reason.token_error().map(TokenError::code),
                endpoint = ?decision.endpoint,
                path = %request.path,
                method = %request.method,
                peer_identity = request.peer_identity,
                snapshot_version = snapshot.version,
                "Authorization decision"
            );
        }

        Some(decision)
    }
}
