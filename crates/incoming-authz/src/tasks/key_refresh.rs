//! Per-provider JWKS refresh loops and their supervisor.
//!
//! Each referenced provider gets one loop. A loop fetches immediately, then
//! again every `ttl`. Failed fetches retry with exponential backoff
//! (`initial_backoff` doubling up to `max_backoff`) and leave the previous
//! key set in place. Nudges from the verifier (unknown `kid`) or from an
//! expired set trigger an early fetch, at most once per
//! `min_refresh_interval`.
//!
//! Loops are independent: one provider failing never delays another.
//!
//! A loop writes only into the cache generation it started with. Once the
//! supervisor restarts a provider, a fetch still in flight from the old
//! definition lands in a superseded generation and is discarded.

use crate::keys::{JwksSource, KeyFetchError, KeyMaterialCache, KeySet};
use crate::observability::metrics;
use crate::providers::OAuthProvider;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Run the refresh loop for `provider` until `cancel` fires.
///
/// The provider must already be tracked by `cache`.
#[instrument(skip_all, name = "authz.tasks.key_refresh", fields(provider = %provider.name))]
pub async fn run_key_refresh(
    provider: Arc<OAuthProvider>,
    source: Arc<dyn JwksSource>,
    cache: Arc<KeyMaterialCache>,
    cancel: CancellationToken,
) {
    let settings = *cache.settings();
    let (Some(nudge), Some(generation)) = (
        cache.refresh_signal(&provider.name),
        cache.generation(&provider.name),
    ) else {
        tracing::warn!(
            target: "authz.tasks.key_refresh",
            provider = %provider.name,
            "Provider is not tracked, refresh loop not started"
        );
        return;
    };
    // Replaced before it ran; the generation read above may be its successor's
    if cancel.is_cancelled() {
        return;
    }

    tracing::info!(
        target: "authz.tasks.key_refresh",
        provider = %provider.name,
        jwks_uri = %provider.jwks_uri,
        generation,
        ttl_seconds = settings.ttl.as_secs(),
        "Starting key refresh loop"
    );

    let mut backoff = settings.initial_backoff;

    loop {
        let started = Instant::now();

        let refresh = refresh_once(&provider, source.as_ref(), &cache, generation, settings.ttl);
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = refresh => outcome,
        };
        let wait = match outcome {
            Ok(_) => {
                backoff = settings.initial_backoff;
                settings.ttl
            }
            Err(e) => {
                tracing::warn!(
                    target: "authz.tasks.key_refresh",
                    provider = %provider.name,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "JWKS refresh failed, keeping previous keys"
                );
                let wait = backoff;
                backoff = backoff.saturating_mul(2).min(settings.max_backoff);
                wait
            }
        };

        let scheduled = started + wait;
        let earliest_nudge = (started + settings.min_refresh_interval).min(scheduled);

        let cancelled = tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep_until(scheduled) => false,
            () = nudge.notified() => {
                tracing::debug!(
                    target: "authz.tasks.key_refresh",
                    provider = %provider.name,
                    "Refresh requested"
                );
                tokio::select! {
                    () = cancel.cancelled() => true,
                    () = tokio::time::sleep_until(earliest_nudge) => false,
                }
            }
        };
        if cancelled {
            break;
        }
    }

    tracing::info!(
        target: "authz.tasks.key_refresh",
        provider = %provider.name,
        "Key refresh loop stopped"
    );
}

/// Fetch, convert and store one key set. Returns the number of keys fetched.
async fn refresh_once(
    provider: &OAuthProvider,
    source: &dyn JwksSource,
    cache: &KeyMaterialCache,
    generation: u64,
    ttl: Duration,
) -> Result<usize, KeyFetchError> {
    let start = std::time::Instant::now();
    let result = source
        .fetch(provider)
        .await
        .and_then(|jwks| KeySet::from_jwks(&provider.name, jwks, Utc::now(), ttl));
    let duration = start.elapsed();

    match result {
        Ok(keys) => {
            let count = keys.len();
            if !cache.store_generation(&provider.name, generation, keys) {
                tracing::debug!(
                    target: "authz.tasks.key_refresh",
                    provider = %provider.name,
                    "Provider replaced or no longer tracked, discarding keys"
                );
            }
            metrics::record_jwks_refresh(&provider.name, "success", duration);
            tracing::debug!(
                target: "authz.tasks.key_refresh",
                provider = %provider.name,
                keys = count,
                "JWKS refreshed"
            );
            Ok(count)
        }
        Err(e) => {
            metrics::record_jwks_refresh(&provider.name, "error", duration);
            Err(e)
        }
    }
}

struct RefreshLoop {
    provider: Arc<OAuthProvider>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps exactly one refresh loop per referenced provider.
pub struct KeyRefreshSupervisor {
    source: Arc<dyn JwksSource>,
    cache: Arc<KeyMaterialCache>,
    cancel: CancellationToken,
    loops: HashMap<String, RefreshLoop>,
}

impl KeyRefreshSupervisor {
    /// Loops are children of `cancel`; cancelling it stops all of them.
    pub fn new(
        source: Arc<dyn JwksSource>,
        cache: Arc<KeyMaterialCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            cache,
            cancel,
            loops: HashMap::new(),
        }
    }

    /// Converge the running loops on `providers`.
    ///
    /// New providers are tracked and get a loop. A provider whose definition
    /// changed has its cached keys dropped and its loop restarted. Providers
    /// no longer listed are stopped and untracked. Must be called from
    /// within a Tokio runtime.
    pub fn reconcile(&mut self, providers: &[Arc<OAuthProvider>]) {
        let wanted: HashMap<&str, &Arc<OAuthProvider>> = providers
            .iter()
            .map(|provider| (provider.name.as_str(), provider))
            .collect();

        let removed: Vec<String> = self
            .loops
            .keys()
            .filter(|name| !wanted.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(running) = self.loops.remove(&name) {
                running.cancel.cancel();
            }
            self.cache.untrack(&name);
            tracing::info!(
                target: "authz.tasks.key_refresh",
                provider = %name,
                "Provider no longer referenced, stopped key refresh"
            );
        }

        for (name, provider) in wanted {
            if let Some(running) = self.loops.get(name) {
                if running.provider == *provider && !running.handle.is_finished() {
                    continue;
                }
                running.cancel.cancel();
                self.cache.clear(name);
                tracing::info!(
                    target: "authz.tasks.key_refresh",
                    provider = %name,
                    "Provider definition changed, restarting key refresh"
                );
            }

            self.cache.track(name);
            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(run_key_refresh(
                Arc::clone(provider),
                Arc::clone(&self.source),
                Arc::clone(&self.cache),
                cancel.clone(),
            ));
            self.loops.insert(
                name.to_string(),
                RefreshLoop {
                    provider: Arc::clone(provider),
                    cancel,
                    handle,
                },
            );
        }
    }

    /// Names of providers with a loop, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loops.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(&mut self) {
        for (_, running) in self.loops.drain() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::warn!(
                    target: "authz.tasks.key_refresh",
                    error = %e,
                    "Key refresh loop ended abnormally"
                );
            }
        }
    }
}
