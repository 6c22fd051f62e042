//! Compiled snapshot inspection.

use crate::errors::AuthzError;
use crate::routes::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

/// Current compiled artifact: both filters, version, fingerprint and the
/// shadowed-rule report.
pub async fn get_snapshot(State(state): State<Arc<AppState>>) -> Result<Response, AuthzError> {
    let snapshot = state
        .store
        .current()
        .ok_or_else(|| AuthzError::ServiceUnavailable("No snapshot published".to_string()))?;

    Ok(Json(snapshot.as_ref()).into_response())
}
