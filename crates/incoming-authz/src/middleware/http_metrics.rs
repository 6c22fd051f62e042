//! HTTP metrics middleware.
//!
//! Applied as the outermost layer so that framework-level rejections
//! (400 on bad JSON, 404, 405, 415) are recorded along with handler
//! responses.

use crate::observability::metrics::record_http_request;
use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Records method, normalized path, status code and duration of every request.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tower::ServiceExt;

    fn test_app() -> Router {
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn status_of(uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");
        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_passes_responses_through() {
        assert_eq!(status_of("/health").await, StatusCode::OK);
        assert_eq!(status_of("/nonexistent").await, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_middleware_records_not_found() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        // A current-thread runtime keeps the request on this thread, where the
        // local recorder is installed
        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                assert_eq!(status_of("/missing").await, StatusCode::NOT_FOUND);
            });
        });

        let recorded = snapshotter.snapshot().into_vec();
        let not_found = recorded.iter().find(|(key, _, _, _)| {
            key.key().name() == "authz_http_requests_total"
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == "status_code" && l.value() == "404")
        });
        assert!(matches!(not_found, Some((_, _, _, DebugValue::Counter(1)))));
    }
}
