//! Atomic snapshot publication.
//!
//! Readers take an `Arc` to the current snapshot with a single atomic load
//! and keep it for the rest of the request. Writers are serialized through
//! the version channel, so fingerprint comparison, version assignment and
//! the pointer swap happen as one step.

use super::generator::CompiledSnapshot;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new snapshot replaced the previous one.
    Published { version: u64 },
    /// The snapshot had the current fingerprint; nothing changed.
    Unchanged { version: u64 },
}

impl PublishOutcome {
    pub fn version(self) -> u64 {
        match self {
            Self::Published { version } | Self::Unchanged { version } => version,
        }
    }

    pub fn status(self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Unchanged { .. } => "unchanged",
        }
    }
}

#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwapOption<CompiledSnapshot>,
    versions: watch::Sender<u64>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (versions, _) = watch::channel(0);
        Self {
            current: ArcSwapOption::empty(),
            versions,
        }
    }

    /// The snapshot in effect, if one has been published.
    pub fn current(&self) -> Option<Arc<CompiledSnapshot>> {
        self.current.load_full()
    }

    /// Version of the snapshot in effect; `0` before the first publication.
    pub fn version(&self) -> u64 {
        *self.versions.borrow()
    }

    /// Receiver that observes every published version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.versions.subscribe()
    }

    /// Replace the current snapshot unless it already has this fingerprint.
    pub fn publish(&self, mut snapshot: CompiledSnapshot) -> PublishOutcome {
        let fingerprint = snapshot.fingerprint.clone();
        let mut outcome = PublishOutcome::Unchanged { version: 0 };

        self.versions.send_if_modified(|version| {
            let unchanged = self
                .current
                .load()
                .as_ref()
                .is_some_and(|current| current.fingerprint == fingerprint);
            if unchanged {
                outcome = PublishOutcome::Unchanged { version: *version };
                return false;
            }

            *version += 1;
            snapshot.version = *version;
            self.current.store(Some(Arc::new(snapshot)));
            outcome = PublishOutcome::Published { version: *version };
            true
        });

        match outcome {
            PublishOutcome::Published { version } => tracing::info!(
                target: "authz.snapshot",
                version,
                fingerprint = %fingerprint,
                "Published snapshot"
            ),
            PublishOutcome::Unchanged { version } => tracing::debug!(
                target: "authz.snapshot",
                version,
                "Snapshot unchanged, keeping current version"
            ),
        }
        outcome
    }
}
