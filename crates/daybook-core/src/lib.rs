//! Daybook Core Library
//!
//! This crate provides the local-first sync core for Daybook: a diary, a food
//! log and an ideas list that work offline and converge with a server.
//!
//! # Architecture
//!
//! - **Replica**: in-memory ordered key-value store, the source of truth for reads
//! - **Mutators**: named operations applied locally first, then pushed
//! - **Coordinator**: push/pull cycle, pull gate, retry and poke
//! - **Invalidation channel**: one shared event stream that tells clients to pull
//!
//! Reads and subscriptions are served from the replica and never wait on the
//! network.
//!
//! # Quick Start
//!
//! ```text
//! let session = Session::open()?;
//! session.login(&Credential::new(token))?;
//!
//! // Add a food entry; visible immediately
//! session.food().create(FoodEntry { name: "Tea".into(), price: None })?;
//!
//! // Push it
//! session.flush_all().await;
//! ```
//!
//! # Modules
//!
//! - `session`: One client per domain (main entry point)
//! - `models`: Record types and the `Domain` trait
//! - `mutation`: Mutators and the pending-mutation queue
//! - `replica`: Local replica, transactions and subscriptions
//! - `sync`: Coordinator, transport, pull gate, invalidation stream, poke
//! - `credentials`: Credential storage and debounced change notification
//! - `storage`: Snapshot persistence
//! - `config`: Application configuration

pub mod config;
pub mod credentials;
pub mod error;
pub mod listeners;
pub mod models;
pub mod mutation;
pub mod replica;
pub mod session;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use credentials::{
    Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenProvider,
};
pub use error::{Result, SyncError};
pub use listeners::Subscription;
pub use models::{
    Diary, DiaryEntry, DiaryPatch, Domain, Entity, Food, FoodEntry, FoodPatch, Idea, IdeaPatch,
    Ideas,
};
pub use mutation::{DomainMutation, Mutation, MutationQueue, MutationRecord};
pub use replica::{PatchOp, Replica, Scan, Snapshot, Transaction};
pub use session::Session;
pub use storage::{ReplicaPersistence, StorageError};
pub use sync::{
    InvalidationChannel, InvalidationEvent, PullOutcome, PushOutcome, SyncClient, SyncConfig,
    SyncCoordinator, SyncStats,
};
