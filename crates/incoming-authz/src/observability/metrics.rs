//! Metrics definitions for the incoming authorization service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `authz_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: allow, unauthenticated, forbidden
//! - `reason`: bounded by `DecisionReason::code`
//! - `provider`: bounded by the provider registry
//! - `result`: `ok` or a `TokenError::code`
//! - `status`: success/error, published/unchanged
//! - `endpoint`: the fixed route table, everything else is `/other`

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Decisions are CPU-only; sub-millisecond buckets
        .set_buckets_for_metric(
            Matcher::Full("authz_decision_duration_seconds".to_string()),
            &[
                0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.005, 0.010, 0.025,
            ],
        )
        .map_err(|e| format!("Failed to set decision buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("authz_http_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("authz_jwks_fetch_duration_seconds".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set JWKS fetch buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Decisions
// ============================================================================

/// Record one authorization decision.
///
/// Metric: `authz_decisions_total`, `authz_decision_duration_seconds`
pub fn record_decision(outcome: &'static str, reason: &'static str, duration: Duration) {
    counter!("authz_decisions_total",
        "outcome" => outcome,
        "reason" => reason
    )
    .increment(1);

    histogram!("authz_decision_duration_seconds").record(duration.as_secs_f64());
}

/// Record a token verification attempt.
///
/// Metric: `authz_token_verifications_total`
pub fn record_token_verification(provider: &str, result: &'static str) {
    counter!("authz_token_verifications_total",
        "provider" => provider.to_string(),
        "result" => result
    )
    .increment(1);
}

// ============================================================================
// Key material
// ============================================================================

/// Record a JWKS refresh attempt.
///
/// Metric: `authz_jwks_refresh_total`, `authz_jwks_fetch_duration_seconds`
pub fn record_jwks_refresh(provider: &str, status: &'static str, duration: Duration) {
    counter!("authz_jwks_refresh_total",
        "provider" => provider.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!("authz_jwks_fetch_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

// ============================================================================
// Configuration
// ============================================================================

/// Record a snapshot publication attempt.
///
/// Metric: `authz_snapshot_publications_total`
pub fn record_snapshot_publication(status: &'static str) {
    counter!("authz_snapshot_publications_total", "status" => status).increment(1);
}

/// Record a failed configuration reload.
///
/// Metric: `authz_config_reload_failures_total`
pub fn record_config_reload_failure(stage: &'static str) {
    counter!("authz_config_reload_failures_total", "stage" => stage).increment(1);
}

// ============================================================================
// HTTP
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `authz_http_requests_total`, `authz_http_request_duration_seconds`
pub fn record_http_request(method: &str, path: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(path);
    let status = categorize_status_code(status_code);

    histogram!("authz_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("authz_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        "/v1/check" => "/v1/check",
        "/v1/snapshot" => "/v1/snapshot",
        _ => "/other",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(401), "error");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_normalize_endpoint_bounds_cardinality() {
        assert_eq!(normalize_endpoint("/v1/check"), "/v1/check");
        assert_eq!(normalize_endpoint("/v1/check/extra"), "/other");
        assert_eq!(normalize_endpoint("/anything"), "/other");
    }

    #[test]
    fn test_metrics_are_recorded_with_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_decision("forbidden", "unlisted_client_blocked", Duration::from_micros(40));
            record_token_verification("oauth1", "expired");
            record_jwks_refresh("oauth1", "success", Duration::from_millis(12));
            record_snapshot_publication("published");
            record_config_reload_failure("policy");
            record_http_request("POST", "/v1/check", 403, Duration::from_millis(1));
        });

        let metrics = snapshotter.snapshot().into_vec();
        let counter_value = |name: &str| {
            metrics.iter().find_map(|(key, _, _, value)| {
                (key.key().name() == name).then(|| match value {
                    DebugValue::Counter(v) => *v,
                    _ => 0,
                })
            })
        };

        assert_eq!(counter_value("authz_decisions_total"), Some(1));
        assert_eq!(counter_value("authz_token_verifications_total"), Some(1));
        assert_eq!(counter_value("authz_jwks_refresh_total"), Some(1));
        assert_eq!(counter_value("authz_snapshot_publications_total"), Some(1));
        assert_eq!(counter_value("authz_config_reload_failures_total"), Some(1));
        assert_eq!(counter_value("authz_http_requests_total"), Some(1));

        let decision_labels: Vec<(String, String)> = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "authz_decisions_total")
            .map(|(key, _, _, _)| {
                key.key()
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect()
            })
            .unwrap();
        assert!(decision_labels.contains(&("outcome".to_string(), "forbidden".to_string())));
        assert!(decision_labels.contains(&(
            "reason".to_string(),
            "unlisted_client_blocked".to_string()
        )));
    }
}
