//! Incoming Authorization Service
//!
//! # Startup Flow
//!
//! 1. Initialize tracing and load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the key cache, verifier and snapshot store
//! 4. Load and publish the initial snapshot (a failure leaves the service
//!    not ready until the files are fixed)
//! 5. Spawn the config reload task, which owns the key refresh loops
//! 6. Serve HTTP until SIGINT/SIGTERM, then cancel background tasks

use anyhow::Context;
use common::config::ObservabilityConfig;
use incoming_authz::auth::TokenVerifier;
use incoming_authz::config::Config;
use incoming_authz::decision::Authorizer;
use incoming_authz::keys::{CacheSettings, HttpJwksSource, JwksSource, KeyMaterialCache};
use incoming_authz::observability::metrics::init_metrics_recorder;
use incoming_authz::routes::{self, AppState};
use incoming_authz::snapshot::SnapshotStore;
use incoming_authz::tasks::{ConfigReloader, KeyRefreshSupervisor};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_LOG_FILTER: &str = "incoming_authz=info,common=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let vars: HashMap<String, String> = std::env::vars().collect();

    ObservabilityConfig::from_vars(&vars, DEFAULT_LOG_FILTER)?.init_tracing()?;

    info!(target: "authz.startup", "Starting incoming authorization service");

    let config = Config::from_vars(&vars).map_err(|e| {
        error!(target: "authz.startup", error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        target: "authz.startup",
        node_id = %config.node_id,
        bind_address = %config.bind_address,
        providers_paths = ?config.providers_paths,
        policy_path = %config.policy_path.display(),
        config_poll_interval_seconds = config.config_poll_interval.as_secs(),
        jwks_cache_ttl_seconds = config.jwks_cache_ttl.as_secs(),
        jwks_max_staleness_seconds = config.jwks_max_staleness.as_secs(),
        jwt_clock_skew_seconds = config.jwt_clock_skew.as_secs(),
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(anyhow::Error::msg)?;
    info!(target: "authz.startup", "Prometheus metrics recorder initialized");

    let cache = Arc::new(KeyMaterialCache::new(CacheSettings::new(
        config.jwks_cache_ttl,
        config.jwks_max_staleness,
    )));
    let verifier = Arc::new(TokenVerifier::new(Arc::clone(&cache), config.jwt_clock_skew));
    let store = Arc::new(SnapshotStore::new());

    let shutdown_token = CancellationToken::new();
    let source: Arc<dyn JwksSource> = Arc::new(HttpJwksSource::new(config.jwks_http_timeout));
    let supervisor =
        KeyRefreshSupervisor::new(source, Arc::clone(&cache), shutdown_token.child_token());

    let mut reloader = ConfigReloader::new(
        config.node_id.clone(),
        config.providers_paths.clone(),
        config.policy_path.clone(),
        Arc::clone(&cache),
        Arc::clone(&store),
        supervisor,
    );
    if !reloader.reload_and_log().await {
        warn!(
            target: "authz.startup",
            "Initial configuration could not be applied; not ready until it is fixed"
        );
    }
    let reload_task =
        tokio::spawn(reloader.run(config.config_poll_interval, shutdown_token.clone()));

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        authorizer: Authorizer::new(store, verifier),
        keys: cache,
    });
    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;

    info!(target: "authz.startup", addr = %addr, "Incoming authorization service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_token.cancel();
    if let Err(e) = reload_task.await {
        error!(target: "authz.startup", error = %e, "Config reload task ended abnormally");
    }

    info!(target: "authz.startup", "Incoming authorization service shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!(target: "authz.startup", "Received SIGINT, starting graceful shutdown"),
            Err(e) => error!(target: "authz.startup", error = %e, "Failed to listen for SIGINT"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(target: "authz.startup", "Received SIGTERM, starting graceful shutdown");
            }
            Err(e) => {
                error!(target: "authz.startup", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
