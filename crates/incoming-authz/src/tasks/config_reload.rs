//! Declarative configuration reload task.
//!
//! Polls the provider and policy files. When their contents change, the
//! whole pipeline runs again: build a fresh registry, compile the node
//! document, converge key refresh loops on the providers it references, then
//! publish the snapshot. Any failure keeps the previous snapshot in effect.

use super::key_refresh::KeyRefreshSupervisor;
use crate::keys::KeyMaterialCache;
use crate::observability::metrics;
use crate::policy::loader::parse_document;
use crate::policy::PolicyLoadError;
use crate::providers::{registry_from_documents, LoadError, OAuthProvider};
use crate::snapshot::{self, PublishOutcome, SnapshotError, SnapshotStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Providers(#[from] LoadError),

    #[error(transparent)]
    Policy(#[from] PolicyLoadError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ReloadError {
    /// Metric label for the failing stage.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Providers(_) => "providers",
            Self::Policy(_) => "policy",
            Self::Snapshot(_) => "compile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// File contents are the same as last time; nothing was compiled.
    Skipped,
    Applied(PublishOutcome),
}

/// Recompiles and republishes when the declarative files change.
pub struct ConfigReloader {
    node_id: String,
    providers_paths: Vec<PathBuf>,
    policy_path: PathBuf,
    cache: Arc<KeyMaterialCache>,
    store: Arc<SnapshotStore>,
    supervisor: KeyRefreshSupervisor,
    last_inputs: Option<Vec<String>>,
}

impl ConfigReloader {
    pub fn new(
        node_id: impl Into<String>,
        providers_paths: Vec<PathBuf>,
        policy_path: PathBuf,
        cache: Arc<KeyMaterialCache>,
        store: Arc<SnapshotStore>,
        supervisor: KeyRefreshSupervisor,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            providers_paths,
            policy_path,
            cache,
            store,
            supervisor,
            last_inputs: None,
        }
    }

    /// Re-read the files and apply them if they changed.
    ///
    /// Contents that failed to compile are remembered, so the same broken
    /// input is reported once rather than on every poll.
    ///
    /// # Errors
    ///
    /// Returns the first read or parse error, or every policy violation.
    pub async fn reload(&mut self) -> Result<ReloadOutcome, ReloadError> {
        let inputs = self.read_inputs().await?;
        if self.last_inputs.as_ref() == Some(&inputs) {
            return Ok(ReloadOutcome::Skipped);
        }
        let result = self.apply(&inputs);
        self.last_inputs = Some(inputs);
        result
    }

    async fn read_inputs(&self) -> Result<Vec<String>, ReloadError> {
        let mut inputs = Vec::with_capacity(self.providers_paths.len() + 1);
        for path in &self.providers_paths {
            let contents = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| LoadError::Io {
                    path: path.clone(),
                    source,
                })?;
            inputs.push(contents);
        }
        let policy = tokio::fs::read_to_string(&self.policy_path)
            .await
            .map_err(|source| PolicyLoadError::Io {
                path: self.policy_path.clone(),
                source,
            })?;
        inputs.push(policy);
        Ok(inputs)
    }

    fn apply(&mut self, inputs: &[String]) -> Result<ReloadOutcome, ReloadError> {
        let registry = registry_from_documents(
            self.providers_paths
                .iter()
                .map(PathBuf::as_path)
                .zip(inputs.iter().map(String::as_str)),
        )?;

        let policy = inputs.last().map(String::as_str).unwrap_or_default();
        let node = parse_document(policy, &self.policy_path)?;

        let compiled = snapshot::compile(&self.node_id, &node, Arc::new(registry), &self.cache)?;

        // Keys of redefined providers are dropped before the snapshot naming
        // the new definitions becomes visible
        let providers: Vec<Arc<OAuthProvider>> = compiled
            .permissions
            .referenced_providers()
            .into_iter()
            .filter_map(|name| compiled.registry.lookup(name).ok())
            .cloned()
            .collect();
        self.supervisor.reconcile(&providers);

        let outcome = self.store.publish(compiled);
        metrics::record_snapshot_publication(outcome.status());

        Ok(ReloadOutcome::Applied(outcome))
    }

    /// Reload once, logging the result. Returns `true` on success.
    pub async fn reload_and_log(&mut self) -> bool {
        match self.reload().await {
            Ok(ReloadOutcome::Skipped) => true,
            Ok(ReloadOutcome::Applied(outcome)) => {
                tracing::info!(
                    target: "authz.tasks.config_reload",
                    version = outcome.version(),
                    status = outcome.status(),
                    providers = ?self.supervisor.running(),
                    "Configuration applied"
                );
                true
            }
            Err(e) => {
                metrics::record_config_reload_failure(e.stage());
                tracing::error!(
                    target: "authz.tasks.config_reload",
                    stage = e.stage(),
                    error = %e,
                    version = self.store.version(),
                    "Configuration reload failed, keeping previous snapshot"
                );
                false
            }
        }
    }

    /// Poll every `interval` until `cancel` fires, then stop all key refresh
    /// loops.
    #[instrument(skip_all, name = "authz.tasks.config_reload")]
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            target: "authz.tasks.config_reload",
            interval_seconds = interval.as_secs(),
            "Starting config reload task"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reload_and_log().await;
                }
                () = cancel.cancelled() => {
                    tracing::info!(
                        target: "authz.tasks.config_reload",
                        "Config reload task received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }

        self.supervisor.shutdown().await;
        tracing::info!(target: "authz.tasks.config_reload", "Config reload task stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::keys::{
        CacheSettings, Jwk, JwksResponse, JwksSource, KeyFetchError, ProviderHealth,
    };
    use crate::policy::model::UnlistedPolicy;
    use async_trait::async_trait;
    use authz_test_utils::crypto_fixtures::TestKeypair;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    struct EmptySource;

    #[async_trait]
    impl JwksSource for EmptySource {
        async fn fetch(&self, _provider: &OAuthProvider) -> Result<JwksResponse, KeyFetchError> {
            Ok(JwksResponse { keys: vec![] })
        }
    }

    /// Answers for one URI only; every other fetch hangs.
    struct SingleEndpointSource {
        jwks_uri: &'static str,
        jwk: serde_json::Value,
    }

    #[async_trait]
    impl JwksSource for SingleEndpointSource {
        async fn fetch(&self, provider: &OAuthProvider) -> Result<JwksResponse, KeyFetchError> {
            if provider.jwks_uri != self.jwks_uri {
                std::future::pending::<()>().await;
            }
            Ok(JwksResponse {
                keys: vec![serde_json::from_value::<Jwk>(self.jwk.clone()).unwrap()],
            })
        }
    }

    const PROVIDERS: &str = r"
providers:
  oauth1:
    issuer: https://oauth1.example.com
    jwksUri: http://oauth1:8080/keys
    clusterName: oauth1
    clusterPort: 8080
    selectorToClaimField:
      s1: authorities
";

    const POLICY: &str = r#"
incoming:
  unlistedEndpointsPolicy: block
  endpoints:
    - path: /api
      clients: ["team1:s1"]
      oauth:
        provider: oauth1
"#;

    struct Setup {
        _dir: TempDir,
        providers: PathBuf,
        policy: PathBuf,
        cache: Arc<KeyMaterialCache>,
        store: Arc<SnapshotStore>,
        reloader: ConfigReloader,
    }

    fn write(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }

    fn setup() -> Setup {
        setup_with(Arc::new(EmptySource))
    }

    fn setup_with(source: Arc<dyn JwksSource>) -> Setup {
        let dir = TempDir::new().unwrap();
        let providers = dir.path().join("providers.yaml");
        let policy = dir.path().join("policy.yaml");
        write(&providers, PROVIDERS);
        write(&policy, POLICY);

        let cache = Arc::new(KeyMaterialCache::new(CacheSettings::new(
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )));
        let store = Arc::new(SnapshotStore::new());
        let supervisor = KeyRefreshSupervisor::new(
            source,
            Arc::clone(&cache),
            CancellationToken::new(),
        );
        let reloader = ConfigReloader::new(
            "node-1",
            vec![providers.clone()],
            policy.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
            supervisor,
        );

        Setup {
            _dir: dir,
            providers,
            policy,
            cache,
            store,
            reloader,
        }
    }

    #[tokio::test]
    async fn test_initial_reload_publishes_and_tracks_providers() {
        let mut s = setup();

        let outcome = s.reloader.reload().await.unwrap();
        assert_eq!(
            outcome,
            ReloadOutcome::Applied(PublishOutcome::Published { version: 1 })
        );
        assert_eq!(s.store.current().unwrap().artifact.node_id, "node-1");
        assert!(s.cache.is_tracked("oauth1"));
        assert_eq!(s.reloader.supervisor.running(), vec!["oauth1"]);

        s.reloader.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unchanged_files_are_skipped() {
        let mut s = setup();
        s.reloader.reload().await.unwrap();

        assert_eq!(s.reloader.reload().await.unwrap(), ReloadOutcome::Skipped);
        assert_eq!(s.store.version(), 1);

        s.reloader.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reformatted_file_does_not_bump_version() {
        let mut s = setup();
        s.reloader.reload().await.unwrap();

        // Same meaning, different bytes
        write(&s.policy, &format!("# comment\n{POLICY}"));
        assert_eq!(
            s.reloader.reload().await.unwrap(),
            ReloadOutcome::Applied(PublishOutcome::Unchanged { version: 1 })
        );

        s.reloader.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_policy_keeps_previous_snapshot() {
        let mut s = setup();
        s.reloader.reload().await.unwrap();

        write(
            &s.policy,
            "incoming:\n  unlistedEndpointsPolicy: sometimes\n  endpoints:\n    - path: /x\n      oauth:\n        provider: nobody\n",
        );
        let err = s.reloader.reload().await.unwrap_err();
        assert_eq!(err.stage(), "compile");
        match err {
            ReloadError::Snapshot(SnapshotError::Invalid(e)) => assert_eq!(e.violations.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let current = s.store.current().unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(
            current.permissions.unlisted_endpoints_policy,
            UnlistedPolicy::Block
        );

        // The same broken input is not recompiled
        assert_eq!(s.reloader.reload().await.unwrap(), ReloadOutcome::Skipped);

        s.reloader.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_file_is_a_providers_error() {
        let mut s = setup();
        std::fs::remove_file(&s.providers).unwrap();

        let err = s.reloader.reload().await.unwrap_err();
        assert_eq!(err.stage(), "providers");
        assert!(s.store.current().is_none());
    }

    #[tokio::test]
    async fn test_dropped_provider_is_untracked() {
        let mut s = setup();
        s.reloader.reload().await.unwrap();

        write(&s.policy, "incoming:\n  unlistedEndpointsPolicy: allow\n");
        assert_eq!(
            s.reloader.reload().await.unwrap(),
            ReloadOutcome::Applied(PublishOutcome::Published { version: 2 })
        );
        assert!(!s.cache.is_tracked("oauth1"));
        assert!(s.reloader.supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn test_redefined_provider_keys_are_dropped_before_publication() {
        let keypair = TestKeypair::new(1, "k1");
        let mut s = setup_with(Arc::new(SingleEndpointSource {
            jwks_uri: "http://oauth1:8080/keys",
            jwk: keypair.jwk(),
        }));
        s.reloader.reload().await.unwrap();

        let cache = Arc::clone(&s.cache);
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.health_at("oauth1", Utc::now()) != ProviderHealth::Healthy {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Reports key health the moment version 2 becomes visible
        let store = Arc::clone(&s.store);
        let watcher = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while store.version() < 2 {
                if std::time::Instant::now() > deadline {
                    return None;
                }
                std::hint::spin_loop();
            }
            Some(cache.health_at("oauth1", Utc::now()))
        });

        write(
            &s.providers,
            &PROVIDERS.replace("http://oauth1:8080/keys", "http://oauth1-v2:8080/keys"),
        );
        assert_eq!(
            s.reloader.reload().await.unwrap(),
            ReloadOutcome::Applied(PublishOutcome::Published { version: 2 })
        );

        assert_eq!(watcher.join().unwrap(), Some(ProviderHealth::Pending));
        assert_eq!(
            s.cache.health_at("oauth1", Utc::now()),
            ProviderHealth::Pending
        );
        assert!(s.cache.get("oauth1").is_none());

        s.reloader.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let s = setup();
        let store = Arc::clone(&s.store);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.reloader.run(Duration::from_millis(10), cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.current().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
