//! HTTP routes.
//!
//! Defines the Axum router and application state.

use crate::decision::Authorizer;
use crate::handlers;
use crate::keys::KeyMaterialCache;
use crate::middleware::http_metrics_middleware;
use crate::snapshot::SnapshotStore;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Published snapshots.
    pub store: Arc<SnapshotStore>,

    /// Request-time decision entry point.
    pub authorizer: Authorizer,

    /// Provider key material, for readiness reporting.
    pub keys: Arc<KeyMaterialCache>,
}

/// Build the application routes.
///
/// - `/health` - Liveness probe
/// - `/ready` - Readiness probe (snapshot published)
/// - `/metrics` - Prometheus metrics
/// - `/v1/snapshot` - Current compiled artifact
/// - `/v1/check` - Evaluate one request
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/v1/snapshot", get(handlers::get_snapshot))
        .route("/v1/check", post(handlers::check))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    api_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
