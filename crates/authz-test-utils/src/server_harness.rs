//! Test server harness for E2E testing
//!
//! Provides `MockJwksServer` (a wiremock-backed provider key endpoint) and
//! `TestAuthzServer` (a real service instance on a random port, driven by
//! files in a [`ConfigDir`]).

use crate::crypto_fixtures::{jwks_json, TestKeypair};
use crate::fixtures::ConfigDir;
use incoming_authz::auth::TokenVerifier;
use incoming_authz::decision::Authorizer;
use incoming_authz::keys::{
    CacheSettings, HttpJwksSource, JwksSource, KeyMaterialCache, ProviderHealth,
};
use incoming_authz::observability::metrics::init_metrics_recorder;
use incoming_authz::routes::{self, AppState};
use incoming_authz::snapshot::SnapshotStore;
use incoming_authz::tasks::{ConfigReloader, KeyRefreshSupervisor};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// How often the harness reloader polls its files.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(50);

static TEST_METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide metrics handle for test servers.
///
/// Installs the real recorder once; later callers (or a process where
/// another recorder won) get a standalone handle.
pub fn test_metrics_handle() -> PrometheusHandle {
    TEST_METRICS_HANDLE
        .get_or_init(|| {
            init_metrics_recorder()
                .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
        })
        .clone()
}

/// A provider's JWKS endpoint at `{uri}/jwks`.
pub struct MockJwksServer {
    server: MockServer,
}

impl MockJwksServer {
    /// Start a server publishing `keypairs`.
    pub async fn start(keypairs: &[&TestKeypair]) -> Self {
        let jwks = Self {
            server: MockServer::start().await,
        };
        jwks.publish(keypairs).await;
        jwks
    }

    /// Replace the published keys (key rotation).
    pub async fn publish(&self, keypairs: &[&TestKeypair]) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(keypairs)))
            .mount(&self.server)
            .await;
    }

    /// Make the endpoint return 500 from now on.
    pub async fn fail(&self) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/jwks", self.server.uri())
    }

    /// Number of JWKS requests received so far.
    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }
}

/// Test harness for spawning the authorization service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// let keypair = TestKeypair::new(1, "k1");
/// let jwks = MockJwksServer::start(&[&keypair]).await;
/// let config = ConfigDir::new(&providers_yaml(&[...]), STANDARD_POLICY);
/// let server = TestAuthzServer::spawn(&config).await?;
/// server.wait_for_keys("oauth1").await?;
///
/// let response = reqwest::Client::new()
///     .post(format!("{}/v1/check", server.url()))
///     .json(&json!({"path": "/public/x", "method": "GET"}))
///     .send()
///     .await?;
/// ```
pub struct TestAuthzServer {
    addr: SocketAddr,
    store: Arc<SnapshotStore>,
    keys: Arc<KeyMaterialCache>,
    cancel: CancellationToken,
    reload_handle: JoinHandle<()>,
    server_handle: JoinHandle<()>,
}

impl TestAuthzServer {
    /// Spawn a server for node `test-node` reading the files in `config`.
    ///
    /// The initial load runs before this returns; a broken configuration
    /// leaves the server running but not ready.
    pub async fn spawn(config: &ConfigDir) -> Result<Self, anyhow::Error> {
        let mut settings = CacheSettings::new(Duration::from_secs(300), Duration::from_secs(3600));
        settings.min_refresh_interval = Duration::from_millis(10);
        settings.initial_backoff = Duration::from_millis(20);
        settings.max_backoff = Duration::from_millis(100);

        let keys = Arc::new(KeyMaterialCache::new(settings));
        let verifier = Arc::new(TokenVerifier::with_default_skew(Arc::clone(&keys)));
        let store = Arc::new(SnapshotStore::new());

        let cancel = CancellationToken::new();
        let source: Arc<dyn JwksSource> = Arc::new(HttpJwksSource::new(Duration::from_secs(2)));
        let supervisor =
            KeyRefreshSupervisor::new(source, Arc::clone(&keys), cancel.child_token());

        let mut reloader = ConfigReloader::new(
            "test-node",
            vec![config.providers_path()],
            config.policy_path(),
            Arc::clone(&keys),
            Arc::clone(&store),
            supervisor,
        );
        reloader.reload_and_log().await;
        let reload_handle = tokio::spawn(reloader.run(TEST_POLL_INTERVAL, cancel.clone()));

        let state = Arc::new(AppState {
            store: Arc::clone(&store),
            authorizer: Authorizer::new(Arc::clone(&store), verifier),
            keys: Arc::clone(&keys),
        });
        let app = routes::build_routes(state, test_metrics_handle());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            store,
            keys,
            cancel,
            reload_handle,
            server_handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyMaterialCache> {
        &self.keys
    }

    /// Wait until a snapshot with at least `version` is published.
    pub async fn wait_for_version(&self, version: u64) -> Result<(), anyhow::Error> {
        let mut versions = self.store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), versions.wait_for(|v| *v >= version))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for snapshot version {version}"))?
            .map_err(|e| anyhow::anyhow!("Snapshot store closed: {e}"))?;
        Ok(())
    }

    /// Wait until `provider` has fresh keys.
    pub async fn wait_for_keys(&self, provider: &str) -> Result<(), anyhow::Error> {
        self.wait_for_health(provider, ProviderHealth::Healthy).await
    }

    /// Wait until `provider` reports `expected` health.
    pub async fn wait_for_health(
        &self,
        provider: &str,
        expected: ProviderHealth,
    ) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.keys.health_at(provider, chrono::Utc::now()) != expected {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Timed out waiting for {provider} to become {expected:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl Drop for TestAuthzServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reload_handle.abort();
        self.server_handle.abort();
    }
}
