//! Per-provider key material cache.
//!
//! Each tracked provider owns a slot holding its latest [`KeySet`]. Refresh
//! loops replace the whole set with a single pointer swap; readers load the
//! current `Arc` without locking. A failed refresh leaves the previous set in
//! place, so `get` always returns the most recent successful fetch.
//!
//! Slots carry a generation number. Tracking a provider or clearing its keys
//! starts a new generation, and a write tagged with an older generation is
//! discarded. A loop still fetching from a replaced definition can therefore
//! never overwrite keys that belong to its successor.
//!
//! Health is derived from the age of that set:
//!
//! | State     | Meaning                                      |
//! |-----------|----------------------------------------------|
//! | `Pending` | no successful fetch yet                      |
//! | `Healthy` | fetched within `max_staleness`               |
//! | `Stale`   | older than `max_staleness`; fails closed     |

use super::jwks::{JwksResponse, KeyFetchError, VerificationKey};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound on how often a refresh nudge is honoured.
pub const MIN_REFRESH_INTERVAL_CAP: Duration = Duration::from_secs(30);

/// Initial retry delay after a failed fetch.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Maximum retry delay after repeated failed fetches.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Signing keys for one provider at one point in time.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: HashMap<String, VerificationKey>,
    fetched_at: DateTime<Utc>,
    ttl: Duration,
}

impl KeySet {
    pub fn new(keys: Vec<VerificationKey>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.kid.clone(), k)).collect(),
            fetched_at,
            ttl,
        }
    }

    /// Build a key set from a JWKS document, skipping unusable entries.
    ///
    /// # Errors
    ///
    /// Returns `NoUsableKeys` when the document lists keys but none of them
    /// converts. An empty document yields an empty set.
    pub fn from_jwks(
        provider: &str,
        jwks: JwksResponse,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, KeyFetchError> {
        let listed = jwks.keys.len();
        let mut keys = Vec::with_capacity(listed);

        for jwk in jwks.keys {
            match jwk.to_verification_key() {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(
                        target: "authz.keys",
                        provider = %provider,
                        kid = jwk.kid.as_deref().unwrap_or("<none>"),
                        reason = %e,
                        "Skipping JWKS entry"
                    );
                }
            }
        }

        if listed > 0 && keys.is_empty() {
            return Err(KeyFetchError::NoUsableKeys);
        }

        Ok(Self::new(keys, fetched_at, ttl))
    }

    pub fn key(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time elapsed since the fetch; zero if `now` precedes it.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.ttl
    }
}

/// Provider key health as seen by readiness probes and the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Stale,
    Pending,
}

/// Refresh and staleness settings shared by all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_staleness: Duration,
    pub min_refresh_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl CacheSettings {
    pub fn new(ttl: Duration, max_staleness: Duration) -> Self {
        Self {
            ttl,
            max_staleness: max_staleness.max(ttl),
            min_refresh_interval: ttl.min(MIN_REFRESH_INTERVAL_CAP),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

#[derive(Debug)]
struct SlotKeys {
    generation: u64,
    keys: Option<Arc<KeySet>>,
}

#[derive(Debug)]
struct ProviderSlot {
    state: ArcSwap<SlotKeys>,
    refresh: Arc<Notify>,
}

impl ProviderSlot {
    fn new(generation: u64) -> Self {
        Self {
            state: ArcSwap::from_pointee(SlotKeys {
                generation,
                keys: None,
            }),
            refresh: Arc::new(Notify::new()),
        }
    }

    fn keys(&self) -> Option<Arc<KeySet>> {
        self.state.load().keys.clone()
    }
}

/// Lock-free cache of key sets keyed by provider name.
#[derive(Debug)]
pub struct KeyMaterialCache {
    slots: ArcSwap<HashMap<String, Arc<ProviderSlot>>>,
    generations: AtomicU64,
    settings: CacheSettings,
}

impl KeyMaterialCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            slots: ArcSwap::from_pointee(HashMap::new()),
            generations: AtomicU64::new(0),
            settings,
        }
    }

    // Unique across the cache, so a re-tracked provider never reuses one
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Start tracking a provider. Returns `true` if it was not tracked yet.
    pub fn track(&self, provider: &str) -> bool {
        let generation = self.next_generation();
        let previous = self.slots.rcu(|slots| {
            if slots.contains_key(provider) {
                Arc::clone(slots)
            } else {
                let mut next = HashMap::clone(slots);
                next.insert(provider.to_string(), Arc::new(ProviderSlot::new(generation)));
                Arc::new(next)
            }
        });
        let added = !previous.contains_key(provider);
        if added {
            tracing::debug!(target: "authz.keys", provider = %provider, "Tracking provider keys");
        }
        added
    }

    /// Stop tracking a provider and drop its keys.
    pub fn untrack(&self, provider: &str) {
        self.slots.rcu(|slots| {
            let mut next = HashMap::clone(slots);
            next.remove(provider);
            next
        });
    }

    pub fn is_tracked(&self, provider: &str) -> bool {
        self.slots.load().contains_key(provider)
    }

    /// Names of all tracked providers, sorted.
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current key set for `provider`, regardless of age.
    ///
    /// An expired set is still returned; its refresh loop is nudged.
    pub fn get(&self, provider: &str) -> Option<Arc<KeySet>> {
        self.get_at(provider, Utc::now())
    }

    pub fn get_at(&self, provider: &str, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        let slots = self.slots.load();
        let slot = slots.get(provider)?;
        let keys = slot.keys();
        if keys.as_ref().map_or(true, |k| k.is_expired(now)) {
            slot.refresh.notify_one();
        }
        keys
    }

    /// Key set for `provider` if it is healthy at `now`.
    ///
    /// Returns `None` while no fetch has succeeded or once the set is older
    /// than `max_staleness`.
    pub fn usable_at(&self, provider: &str, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        self.get_at(provider, now)
            .filter(|keys| keys.age(now) <= self.settings.max_staleness)
    }

    /// Current generation of a tracked provider's slot.
    pub fn generation(&self, provider: &str) -> Option<u64> {
        self.slots
            .load()
            .get(provider)
            .map(|slot| slot.state.load().generation)
    }

    /// Replace the key set for a tracked provider in its current generation.
    ///
    /// Returns `false` if the provider is not tracked.
    pub fn store(&self, provider: &str, keys: KeySet) -> bool {
        let Some(generation) = self.generation(provider) else {
            return false;
        };
        self.store_generation(provider, generation, keys)
    }

    /// Replace the key set only if the slot is still at `generation`.
    ///
    /// Returns `false` if the provider is not tracked or the slot has moved
    /// on to a newer generation since the caller read it.
    pub fn store_generation(&self, provider: &str, generation: u64, keys: KeySet) -> bool {
        let slots = self.slots.load();
        let Some(slot) = slots.get(provider) else {
            return false;
        };
        let keys = Arc::new(keys);
        let previous = slot.state.rcu(|current| {
            if current.generation == generation {
                Arc::new(SlotKeys {
                    generation,
                    keys: Some(Arc::clone(&keys)),
                })
            } else {
                Arc::clone(current)
            }
        });
        let stored = previous.generation == generation;
        if !stored {
            tracing::debug!(
                target: "authz.keys",
                provider = %provider,
                generation,
                current = previous.generation,
                "Discarding keys from a superseded generation"
            );
        }
        stored
    }

    /// Drop the cached keys and start a new generation, keeping the provider
    /// tracked. Returns the new generation.
    pub fn clear(&self, provider: &str) -> Option<u64> {
        let slots = self.slots.load();
        let slot = slots.get(provider)?;
        let generation = self.next_generation();
        slot.state.store(Arc::new(SlotKeys {
            generation,
            keys: None,
        }));
        Some(generation)
    }

    /// Ask the provider's refresh loop to fetch now. Never blocks.
    pub fn request_refresh(&self, provider: &str) {
        if let Some(slot) = self.slots.load().get(provider) {
            slot.refresh.notify_one();
        }
    }

    /// Handle the refresh loop waits on for nudges.
    pub fn refresh_signal(&self, provider: &str) -> Option<Arc<Notify>> {
        self.slots
            .load()
            .get(provider)
            .map(|slot| Arc::clone(&slot.refresh))
    }

    pub fn health_at(&self, provider: &str, now: DateTime<Utc>) -> ProviderHealth {
        let slots = self.slots.load();
        let Some(keys) = slots.get(provider).and_then(|slot| slot.keys()) else {
            return ProviderHealth::Pending;
        };
        if keys.age(now) > self.settings.max_staleness {
            ProviderHealth::Stale
        } else {
            ProviderHealth::Healthy
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::keys::jwks::Jwk;
    use authz_test_utils::crypto_fixtures::TestKeypair;

    fn settings() -> CacheSettings {
        CacheSettings::new(Duration::from_secs(300), Duration::from_secs(3600))
    }

    fn jwks(keypairs: &[&TestKeypair]) -> JwksResponse {
        JwksResponse {
            keys: keypairs
                .iter()
                .map(|k| serde_json::from_value::<Jwk>(k.jwk()).unwrap())
                .collect(),
        }
    }

    fn key_set(fetched_at: DateTime<Utc>) -> KeySet {
        let keypair = TestKeypair::new(1, "k1");
        KeySet::from_jwks("p", jwks(&[&keypair]), fetched_at, Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn test_settings_derive_refresh_floor() {
        let s = CacheSettings::new(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(s.min_refresh_interval, Duration::from_secs(10));
        assert_eq!(s.max_staleness, Duration::from_secs(10));

        let s = settings();
        assert_eq!(s.min_refresh_interval, MIN_REFRESH_INTERVAL_CAP);
        assert_eq!(s.initial_backoff, INITIAL_BACKOFF);
        assert_eq!(s.max_backoff, MAX_BACKOFF);
    }

    #[test]
    fn test_from_jwks_skips_unusable_entries() {
        let good = TestKeypair::new(1, "good");
        let mut doc = jwks(&[&good]);
        let mut no_kid: Jwk = serde_json::from_value(good.jwk()).unwrap();
        no_kid.kid = None;
        doc.keys.push(no_kid);

        let set = KeySet::from_jwks("p", doc, Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.key("good").is_some());
    }

    #[test]
    fn test_from_jwks_all_unusable_is_error() {
        let keypair = TestKeypair::new(1, "k");
        let mut doc = jwks(&[&keypair]);
        for key in &mut doc.keys {
            key.key_use = Some("enc".to_string());
        }

        let err = KeySet::from_jwks("p", doc, Utc::now(), Duration::from_secs(60)).unwrap_err();
        assert_eq!(err, KeyFetchError::NoUsableKeys);

        let empty = JwksResponse { keys: vec![] };
        let set = KeySet::from_jwks("p", empty, Utc::now(), Duration::from_secs(60)).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_track_is_idempotent() {
        let cache = KeyMaterialCache::new(settings());
        assert!(cache.track("a"));
        assert!(!cache.track("a"));
        assert!(cache.track("b"));
        assert_eq!(cache.tracked(), vec!["a".to_string(), "b".to_string()]);

        cache.untrack("a");
        assert!(!cache.is_tracked("a"));
        assert!(cache.is_tracked("b"));
    }

    #[test]
    fn test_store_requires_tracking() {
        let cache = KeyMaterialCache::new(settings());
        assert!(!cache.store("a", key_set(Utc::now())));
        assert!(cache.get("a").is_none());

        cache.track("a");
        assert!(cache.store("a", key_set(Utc::now())));
        assert_eq!(cache.get("a").unwrap().len(), 1);
    }

    #[test]
    fn test_store_from_superseded_generation_is_discarded() {
        let cache = KeyMaterialCache::new(settings());
        cache.track("a");
        let first = cache.generation("a").unwrap();
        assert!(cache.store_generation("a", first, key_set(Utc::now())));

        let second = cache.clear("a").unwrap();
        assert!(second > first);
        assert!(cache.get("a").is_none());

        // A loop started before the clear finishes its fetch late
        assert!(!cache.store_generation("a", first, key_set(Utc::now())));
        assert!(cache.get("a").is_none());
        assert!(cache.store_generation("a", second, key_set(Utc::now())));
        assert!(cache.get("a").is_some());

        // Re-tracking after untrack never reuses a generation
        cache.untrack("a");
        cache.track("a");
        let third = cache.generation("a").unwrap();
        assert!(third > second);
        assert!(!cache.store_generation("a", second, key_set(Utc::now())));
    }

    #[test]
    fn test_health_transitions() {
        let cache = KeyMaterialCache::new(settings());
        cache.track("a");
        let now = Utc::now();
        assert_eq!(cache.health_at("a", now), ProviderHealth::Pending);
        assert!(cache.usable_at("a", now).is_none());

        cache.store("a", key_set(now));
        assert_eq!(cache.health_at("a", now), ProviderHealth::Healthy);
        assert!(cache.usable_at("a", now).is_some());

        let later = now + chrono::Duration::seconds(3601);
        assert_eq!(cache.health_at("a", later), ProviderHealth::Stale);
        assert!(cache.usable_at("a", later).is_none());
        assert!(cache.get_at("a", later).is_some());

        cache.clear("a");
        assert_eq!(cache.health_at("a", now), ProviderHealth::Pending);
    }

    #[tokio::test]
    async fn test_expired_get_nudges_refresh() {
        let cache = KeyMaterialCache::new(settings());
        cache.track("a");
        let now = Utc::now();
        cache.store("a", key_set(now - chrono::Duration::seconds(301)));
        let signal = cache.refresh_signal("a").unwrap();

        assert!(cache.get_at("a", now).is_some());

        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .expect("expired read should nudge the refresh loop");
    }

    #[tokio::test]
    async fn test_request_refresh_stores_permit() {
        let cache = KeyMaterialCache::new(settings());
        cache.track("a");
        cache.request_refresh("a");
        cache.request_refresh("unknown");

        let signal = cache.refresh_signal("a").unwrap();
        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .expect("permit should be stored until the loop waits");
    }
}
