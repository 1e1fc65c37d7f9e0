//! Storage layer
//!
//! Each domain's replica is persisted as a JSON snapshot under the data
//! directory. The snapshot is the source of truth for local state between
//! runs; loading it is what marks a replica hydrated.

pub mod error;
pub mod persistence;

pub use error::{StorageError, StorageResult};
pub use persistence::{ReplicaFile, ReplicaPersistence, SNAPSHOT_VERSION};
