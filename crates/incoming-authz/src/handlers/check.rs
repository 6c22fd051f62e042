//! Decision endpoint.

use crate::decision::{DecisionReason, DenyKind, Outcome, RequestContext};
use crate::errors::AuthzError;
use crate::models::{CheckRequest, CheckResponse};
use crate::routes::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use std::sync::Arc;

/// Evaluate one request against the current snapshot.
///
/// Returns 200 when allowed, 401 when unauthenticated, 403 when forbidden and
/// 503 while no snapshot is published. 401 bodies never say which token
/// check failed.
#[tracing::instrument(skip_all, name = "authz.http.check")]
pub async fn check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, AuthzError> {
    // A header that is not valid UTF-8 still counts as a presented token
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or_default());

    let context = RequestContext {
        path: &request.path,
        method: &request.method,
        peer_identity: request.peer_identity.as_deref(),
        authorization,
    };

    let decision = state
        .authorizer
        .authorize(&context)
        .ok_or_else(|| AuthzError::ServiceUnavailable("No snapshot published".to_string()))?;

    match decision.outcome {
        Outcome::Allow => Ok(Json(CheckResponse {
            decision: "allow",
            reason: decision.reason.code(),
            auditable: decision.auditable,
            snapshot_version: state.store.version(),
        })),
        Outcome::Deny(DenyKind::Unauthenticated) => Err(match decision.reason {
            DecisionReason::InvalidToken(e) => AuthzError::from(e),
            _ => AuthzError::Unauthenticated("Authentication required".to_string()),
        }),
        Outcome::Deny(DenyKind::Forbidden) => {
            Err(AuthzError::Forbidden("Access denied".to_string()))
        }
    }
}
