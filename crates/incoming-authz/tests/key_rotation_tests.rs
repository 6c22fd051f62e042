//! Key material integration tests.
//!
//! Exercises JWKS fetching, rotation and unknown-kid refresh against a
//! mocked provider key endpoint.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use anyhow::Result;
use authz_test_utils::{
    issuer_for, providers_yaml, ConfigDir, MockJwksServer, ProviderDef, TestAuthzServer,
    TestKeypair, TestTokenBuilder,
};
use incoming_authz::keys::ProviderHealth;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

const POLICY: &str = r#"
incoming:
  unlistedEndpointsPolicy: block
  endpoints:
    - path: /api
      clients: ["team1:oauth1-selector"]
      oauth:
        provider: oauth1
"#;

fn config_for(jwks: &MockJwksServer) -> ConfigDir {
    ConfigDir::new(
        &providers_yaml(&[ProviderDef::new("oauth1", &jwks.jwks_uri())
            .with_selector("oauth1-selector", "authorities")]),
        POLICY,
    )
}

fn token(keypair: &TestKeypair) -> String {
    format!(
        "Bearer {}",
        TestTokenBuilder::new()
            .issuer(&issuer_for("oauth1"))
            .claim("authorities", json!(["team1"]))
            .sign(keypair)
    )
}

async fn check(server: &TestAuthzServer, authorization: &str) -> Result<StatusCode> {
    let response = reqwest::Client::new()
        .post(format!("{}/v1/check", server.url()))
        .header("Authorization", authorization)
        .json(&json!({"path": "/api", "method": "GET"}))
        .send()
        .await?;
    Ok(response.status())
}

/// Poll `/v1/check` until it returns `expected` or the deadline passes.
///
/// `nudge` is sent first on each attempt; an unknown kid requests a refresh.
async fn eventually(
    server: &TestAuthzServer,
    authorization: &str,
    expected: StatusCode,
    nudge: Option<&str>,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(unknown_kid) = nudge {
            check(server, unknown_kid).await?;
        }
        let status = check(server, authorization).await?;
        if status == expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("expected {expected}, last status {status}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_keys_fetched_on_startup() -> Result<()> {
    let keypair = TestKeypair::new(1, "k1");
    let jwks = MockJwksServer::start(&[&keypair]).await;
    let config = config_for(&jwks);

    let server = TestAuthzServer::spawn(&config).await?;
    server.wait_for_keys("oauth1").await?;

    assert!(jwks.request_count().await >= 1);
    assert_eq!(check(&server, &token(&keypair)).await?, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_rotated_key_is_picked_up_after_unknown_kid() -> Result<()> {
    let old = TestKeypair::new(1, "k1");
    let new = TestKeypair::new(2, "k2");
    let jwks = MockJwksServer::start(&[&old]).await;
    let config = config_for(&jwks);

    let server = TestAuthzServer::spawn(&config).await?;
    server.wait_for_keys("oauth1").await?;

    // Provider starts signing with k2 and publishes it
    jwks.publish(&[&old, &new]).await;

    // The first k2 token triggers a refresh; later ones verify
    eventually(&server, &token(&new), StatusCode::OK, None).await?;
    assert_eq!(check(&server, &token(&old)).await?, StatusCode::OK);

    // k1 retired; its tokens stop verifying once the next refresh lands
    jwks.publish(&[&new]).await;
    let stranger = token(&TestKeypair::new(9, "k9"));
    eventually(&server, &token(&old), StatusCode::UNAUTHORIZED, Some(&stranger)).await?;
    assert_eq!(check(&server, &token(&new)).await?, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_failing_endpoint_keeps_last_good_keys() -> Result<()> {
    let keypair = TestKeypair::new(1, "k1");
    let jwks = MockJwksServer::start(&[&keypair]).await;
    let config = config_for(&jwks);

    let server = TestAuthzServer::spawn(&config).await?;
    server.wait_for_keys("oauth1").await?;

    jwks.fail().await;

    // Unknown kid nudges a refresh that fails; known keys stay usable
    let stranger = TestKeypair::new(9, "k9");
    assert_eq!(check(&server, &token(&stranger)).await?, StatusCode::UNAUTHORIZED);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(check(&server, &token(&keypair)).await?, StatusCode::OK);
    assert_eq!(
        server.keys().health_at("oauth1", chrono::Utc::now()),
        ProviderHealth::Healthy
    );
    Ok(())
}

#[tokio::test]
async fn test_unreachable_provider_fails_closed() -> Result<()> {
    let keypair = TestKeypair::new(1, "k1");
    let jwks = MockJwksServer::start(&[&keypair]).await;
    jwks.fail().await;
    let config = config_for(&jwks);

    let server = TestAuthzServer::spawn(&config).await?;
    server.wait_for_version(1).await?;

    // Pending keys never verify anything
    assert_eq!(
        server.keys().health_at("oauth1", chrono::Utc::now()),
        ProviderHealth::Pending
    );
    assert_eq!(check(&server, &token(&keypair)).await?, StatusCode::UNAUTHORIZED);

    // Still ready: the snapshot is published
    let ready = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(ready.status(), StatusCode::OK);
    let body: serde_json::Value = ready.json().await?;
    assert_eq!(body["providers"]["oauth1"], "pending");

    // Provider recovers; backoff retries pick it up
    jwks.publish(&[&keypair]).await;
    server.wait_for_keys("oauth1").await?;
    assert_eq!(check(&server, &token(&keypair)).await?, StatusCode::OK);
    Ok(())
}
