//! Compiled enforcement snapshots: the proxy artifact, its compilation and
//! atomic publication.

pub mod artifact;
pub mod generator;
pub mod store;

pub use artifact::{IdentitySignals, Predicate, ProxyArtifact};
pub use generator::{compile, CompiledSnapshot, SnapshotError};
pub use store::{PublishOutcome, SnapshotStore};
