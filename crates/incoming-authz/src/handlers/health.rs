//! Health check handlers.
//!
//! - `/health`: Liveness probe - returns OK if the process is running
//! - `/ready`: Readiness probe - a snapshot has been published

use crate::models::ReadinessResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Liveness probe handler.
///
/// Does not check any dependencies.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe handler.
///
/// Returns 200 once a snapshot has been published, 503 before that. The
/// key material health of each referenced provider is reported but does not
/// affect readiness: stale providers already fail closed.
#[tracing::instrument(skip_all, name = "authz.health.readiness")]
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(snapshot) = state.store.current() else {
        tracing::warn!(target: "authz.http", "Readiness check failed: no snapshot published");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                snapshot_version: None,
                providers: BTreeMap::new(),
                error: Some("No snapshot published".to_string()),
            }),
        );
    };

    let now = Utc::now();
    let providers = snapshot
        .permissions
        .referenced_providers()
        .into_iter()
        .map(|name| (name.to_string(), state.keys.health_at(name, now)))
        .collect();

    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status: "ready",
            snapshot_version: Some(snapshot.version),
            providers,
            error: None,
        }),
    )
}
