//! Sync coordinator
//!
//! Owns one domain's replica and mutation queue and runs the push/pull cycle
//! against the server.
//!
//! - Mutations apply to the replica synchronously, then get queued and pushed
//!   in the background. A failed push never rolls local state back.
//! - Pulls are held back by the [`PullGate`] until the replica is hydrated, a
//!   credential is present and the warm-up interval has passed. A gated pull
//!   returns [`PullOutcome::Gated`] without touching the network.
//! - A `sync` event on an attached [`InvalidationChannel`] starts one pull
//!   once the gate is open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SyncConfig;
use super::gate::{PullGate, PullGateState, Readiness};
use super::invalidation::{InvalidationChannel, InvalidationEvent};
use super::poke::{PokeNotifier, PokeOutcome};
use super::transport::{PullRequest, PushRequest, SyncTransport};
use crate::credentials::TokenProvider;
use crate::error::{Result, SyncError};
use crate::listeners::Subscription;
use crate::models::{Domain, Entity};
use crate::mutation::{apply, wire_args, wire_name, DomainMutation, Mutation, MutationQueue};
use crate::replica::{PatchOp, Replica, Scan, Snapshot};
use crate::storage::{ReplicaFile, ReplicaPersistence, StorageError};

/// Result of [`SyncCoordinator::pull`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The gate is still closed; no request was made
    Gated,
    /// A patch was applied
    Applied {
        /// Patch operations applied to the replica
        ops: usize,
        /// Pending mutations the server confirmed
        acknowledged: usize,
    },
}

/// Result of [`SyncCoordinator::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Nothing was pending
    Idle,
    Pushed { count: usize, poke: PokeOutcome },
}

/// Counters since construction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub mutations: u64,
    pub pushes: u64,
    pub push_failures: u64,
    pub pulls: u64,
    pub gated_pulls: u64,
    pub pull_failures: u64,
    pub pokes: u64,
}

struct CoordinatorInner<D: Domain> {
    config: SyncConfig,
    client_id: String,
    replica: Replica<D::Fields>,
    queue: Mutex<MutationQueue>,
    gate: Mutex<PullGate>,
    transport: Arc<dyn SyncTransport>,
    tokens: TokenProvider,
    poke: PokeNotifier,
    persistence: Option<ReplicaPersistence>,
    persist_lock: Mutex<()>,
    pull_lock: tokio::sync::Mutex<()>,
    push_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    warmup_timer: Mutex<Option<JoinHandle<()>>>,
    invalidation: Mutex<Option<Subscription>>,
    stats: Mutex<SyncStats>,
}

impl<D: Domain> Drop for CoordinatorInner<D> {
    fn drop(&mut self) {
        if let Some(timer) = self.warmup_timer.lock().take() {
            timer.abort();
        }
    }
}

/// Push/pull driver for one domain
///
/// Cloning yields another handle to the same coordinator.
pub struct SyncCoordinator<D: Domain> {
    inner: Arc<CoordinatorInner<D>>,
}

impl<D: Domain> Clone for SyncCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Domain> SyncCoordinator<D> {
    /// Build a coordinator and hydrate its replica
    ///
    /// The replica is loaded from `config.persistence_path` when set. An
    /// unreadable snapshot is moved aside and the replica starts empty. The
    /// warm-up clock starts now; when called inside a tokio runtime a timer
    /// re-checks the gate once it expires.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        tokens: TokenProvider,
    ) -> Result<Self> {
        let persistence = config
            .persistence_path
            .as_ref()
            .map(ReplicaPersistence::new);

        let file = match persistence.as_ref().map(|p| p.load::<D::Fields>()) {
            Some(Ok(Some(file))) => file,
            Some(Ok(None)) | None => ReplicaFile::empty(uuid::Uuid::new_v4().to_string()),
            Some(Err(StorageError::CorruptSnapshot {
                path, backup_path, ..
            })) => {
                warn!(
                    "Discarding corrupt {} snapshot {:?} (kept as {:?})",
                    D::NAME,
                    path,
                    backup_path
                );
                ReplicaFile::empty(uuid::Uuid::new_v4().to_string())
            }
            Some(Err(e)) => return Err(e.into()),
        };

        let replica = Replica::new();
        replica.hydrate(file.records);
        let queue = MutationQueue::restore(file.pending, file.next_mutation_id);
        let pending = queue.len();

        let poke = PokeNotifier::new(transport.clone(), config.poke_url(), tokens.clone());
        let gate = PullGate::new(config.pull_warmup);

        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                client_id: file.client_id,
                replica,
                queue: Mutex::new(queue),
                gate: Mutex::new(gate),
                transport,
                tokens,
                poke,
                persistence,
                persist_lock: Mutex::new(()),
                pull_lock: tokio::sync::Mutex::new(()),
                push_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                warmup_timer: Mutex::new(None),
                invalidation: Mutex::new(None),
                stats: Mutex::new(SyncStats::default()),
                config,
            }),
        };

        info!(
            "Started {} coordinator ({} record(s), {} pending mutation(s))",
            D::NAME,
            coordinator.inner.replica.len(),
            pending
        );

        if !coordinator.check_gate(false) {
            coordinator.start_warmup_timer();
        }
        if pending > 0 && coordinator.inner.config.auto_push {
            coordinator.schedule_push();
        }

        Ok(coordinator)
    }

    pub fn domain(&self) -> &'static str {
        D::NAME
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn replica(&self) -> &Replica<D::Fields> {
        &self.inner.replica
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Apply a mutation locally and queue it for push
    ///
    /// The change is visible to reads and subscriptions before this returns.
    /// Returns the queued mutation's id.
    pub fn mutate(&self, mutation: DomainMutation<D>) -> Result<u64> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let name = wire_name::<D>(&mutation);
        let args = wire_args::<D>(&mutation)?;
        let now = Utc::now();
        let client_generated_id = match &mutation {
            Mutation::Create { id, .. } => Some(id.clone()),
            _ => None,
        };

        // Enqueue before the commit releases the replica, so queue order is
        // commit order even when a listener mutates during delivery.
        let id = self.inner.replica.transact(|tx| {
            apply::<D>(tx, &mutation, now)?;
            Ok::<_, SyncError>(
                self.inner
                    .queue
                    .lock()
                    .enqueue(name, args, client_generated_id, now),
            )
        })?;
        self.inner.stats.lock().mutations += 1;
        debug!("{} #{} applied locally", name, id);

        self.persist();
        if self.inner.config.auto_push {
            self.schedule_push();
        }
        Ok(id)
    }

    /// Create a record; returns its generated id
    pub fn create(&self, fields: D::Fields) -> Result<String> {
        let mutation = Mutation::create(fields);
        let id = mutation.id().to_string();
        self.mutate(mutation)?;
        Ok(id)
    }

    pub fn update(&self, id: &str, patch: D::Patch) -> Result<()> {
        self.mutate(Mutation::update(id, patch)).map(|_| ())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.mutate(Mutation::delete(id)).map(|_| ())
    }

    pub fn get(&self, id: &str) -> Option<Entity<D::Fields>> {
        self.inner.replica.get(&D::key(id))
    }

    /// Every record of this domain, in key order
    pub fn scan(&self) -> Scan<D::Fields> {
        self.inner.replica.scan(D::KEY_PREFIX)
    }

    pub fn snapshot(&self) -> Snapshot<D::Fields> {
        self.inner.replica.snapshot()
    }

    /// Watch every record of this domain
    pub fn subscribe(
        &self,
        listener: impl Fn(&[Entity<D::Fields>]) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.replica.subscribe(D::KEY_PREFIX, listener)
    }

    /// Watch the result of a custom query over this domain's records
    pub fn subscribe_query(
        &self,
        query: impl Fn(&Snapshot<D::Fields>) -> Vec<Entity<D::Fields>> + Send + Sync + 'static,
        listener: impl Fn(&[Entity<D::Fields>]) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .replica
            .subscribe_query(D::KEY_PREFIX, query, listener)
    }

    pub fn gate_state(&self) -> PullGateState {
        self.inner.gate.lock().state()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().clone()
    }

    /// Fetch and apply the server's patch
    ///
    /// Concurrent calls are serialised. On failure the replica is unchanged.
    pub async fn pull(&self) -> Result<PullOutcome> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        if !self.check_gate(true) {
            debug!("{} pull gated", D::NAME);
            self.inner.stats.lock().gated_pulls += 1;
            return Ok(PullOutcome::Gated);
        }

        let _pulling = self.inner.pull_lock.lock().await;
        let token = self.token()?;
        let request = PullRequest {
            client_id: self.inner.client_id.clone(),
        };

        let response = match self
            .inner
            .transport
            .pull(&self.inner.config.pull_url(), &token, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("{} pull failed: {}", D::NAME, e);
                self.inner.stats.lock().pull_failures += 1;
                return Err(e);
            }
        };
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let mut ops = Vec::with_capacity(response.patch.len());
        for op in response.patch {
            ops.push(match op {
                PatchOp::Clear => PatchOp::Clear,
                PatchOp::Del { key } => PatchOp::Del { key },
                PatchOp::Put { key, value } => {
                    let value = serde_json::from_value::<Entity<D::Fields>>(value).map_err(|e| {
                        self.inner.stats.lock().pull_failures += 1;
                        warn!("{} pull returned an unreadable record '{}': {}", D::NAME, key, e);
                        SyncError::Json(e)
                    })?;
                    // Records are always stored under the key derived from their id
                    let expected = D::key(&value.id);
                    if key != expected {
                        warn!(
                            "{} pull put record '{}' under '{}', storing it as '{}'",
                            D::NAME,
                            value.id,
                            key,
                            expected
                        );
                    }
                    PatchOp::Put {
                        key: expected,
                        value,
                    }
                }
            });
        }

        let applied = self.inner.replica.apply_patch(ops);
        let acknowledged = match response.last_mutation_id {
            Some(last) => self.inner.queue.lock().acknowledge(last),
            None => 0,
        };
        self.inner.stats.lock().pulls += 1;
        self.persist();

        debug!(
            "{} pull applied {} op(s), {} mutation(s) confirmed",
            D::NAME,
            applied,
            acknowledged
        );
        Ok(PullOutcome::Applied {
            ops: applied,
            acknowledged,
        })
    }

    /// Push every pending mutation now
    ///
    /// Retryable failures are retried with backoff; if every attempt fails the
    /// records stay queued and the last error is returned.
    pub async fn flush(&self) -> Result<PushOutcome> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.push_pending().await
    }

    /// Start a pull in the background
    pub fn trigger_pull(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; {} pull not started", D::NAME);
            return;
        };
        let coordinator = self.clone();
        runtime.spawn(async move {
            if let Err(e) = coordinator.pull().await {
                debug!("Background {} pull ended: {}", D::NAME, e);
            }
        });
    }

    /// Pull whenever `channel` delivers a `sync` event
    ///
    /// Replaces any earlier attachment.
    pub fn attach(&self, channel: &InvalidationChannel) {
        let weak: Weak<CoordinatorInner<D>> = Arc::downgrade(&self.inner);
        let subscription = channel.add_listener(move |event| {
            if *event != InvalidationEvent::Sync {
                return Ok(());
            }
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let coordinator = SyncCoordinator { inner };
            if coordinator.is_closed() {
                return Ok(());
            }
            if coordinator.check_gate(true) {
                coordinator.trigger_pull();
            } else {
                debug!("{} ignoring sync event before ready", D::NAME);
            }
            Ok(())
        });
        *self.inner.invalidation.lock() = Some(subscription);
    }

    /// Stop all activity
    ///
    /// Detaches from the invalidation channel and silences subscriptions.
    /// Requests already in flight finish, but their results are discarded.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.inner.warmup_timer.lock().take() {
            timer.abort();
        }
        self.inner.invalidation.lock().take();
        self.inner.replica.close_subscriptions();
        info!("Stopped {} coordinator", D::NAME);
    }

    /// Evaluate the gate; returns whether it is open
    ///
    /// `pulling` suppresses the on-ready pull when the caller is about to pull
    /// anyway.
    fn check_gate(&self, pulling: bool) -> bool {
        let readiness = Readiness {
            hydrated: self.inner.replica.is_hydrated(),
            has_credential: self.inner.tokens.current().is_some(),
        };
        let (opened, open) = {
            let mut gate = self.inner.gate.lock();
            let opened = gate.evaluate(readiness);
            (opened, gate.is_open())
        };
        if opened {
            info!("{} pull gate open", D::NAME);
            if self.inner.config.pull_on_ready && !pulling && !self.is_closed() {
                self.trigger_pull();
            }
        }
        open
    }

    fn start_warmup_timer(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let remaining = self.inner.gate.lock().warmup_remaining();
        let weak = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(inner) = weak.upgrade() {
                SyncCoordinator { inner }.check_gate(false);
            }
        });
        *self.inner.warmup_timer.lock() = Some(timer);
    }

    fn schedule_push(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; {} mutations stay queued", D::NAME);
            return;
        };
        let coordinator = self.clone();
        runtime.spawn(async move {
            if let Err(e) = coordinator.push_pending().await {
                debug!("Background {} push ended: {}", D::NAME, e);
            }
        });
    }

    async fn push_pending(&self) -> Result<PushOutcome> {
        let _pushing = self.inner.push_lock.lock().await;

        let mutations = self.inner.queue.lock().pending();
        let Some(last_id) = mutations.last().map(|record| record.id) else {
            return Ok(PushOutcome::Idle);
        };
        let count = mutations.len();
        let token = self.token()?;
        let request = PushRequest {
            client_id: self.inner.client_id.clone(),
            mutations,
        };
        let url = self.inner.config.push_url();
        let retry = &self.inner.config.retry;

        let mut attempt = 0;
        loop {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.is_closed() {
                return Err(SyncError::Closed);
            }
            match self.inner.transport.push(&url, &token, &request).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!(
                        "{} push attempt {} failed, retrying: {}",
                        D::NAME,
                        attempt + 1,
                        e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "{} push failed, {} mutation(s) stay queued: {}",
                        D::NAME,
                        count,
                        e
                    );
                    self.inner.stats.lock().push_failures += 1;
                    return Err(e);
                }
            }
        }

        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.inner.queue.lock().acknowledge(last_id);
        self.inner.stats.lock().pushes += 1;
        self.persist();
        debug!("{} pushed {} mutation(s)", D::NAME, count);

        let poke = self.inner.poke.poke().await;
        if poke == PokeOutcome::Sent {
            self.inner.stats.lock().pokes += 1;
        }
        Ok(PushOutcome::Pushed { count, poke })
    }

    fn token(&self) -> Result<String> {
        self.inner
            .tokens
            .current()
            .map(|credential| credential.token)
            .ok_or_else(|| SyncError::auth("No credential available"))
    }

    /// Write the snapshot file; failures are logged, local state stays valid
    fn persist(&self) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let _writing = self.inner.persist_lock.lock();
        let snapshot = self.inner.replica.snapshot();
        let (pending, next_mutation_id) = {
            let queue = self.inner.queue.lock();
            (queue.pending(), queue.next_id())
        };
        let mut file = ReplicaFile::empty(self.inner.client_id.clone());
        file.next_mutation_id = next_mutation_id;
        file.pending = pending;
        file.records = snapshot
            .keys()
            .filter_map(|key| snapshot.get(key).map(|e| (key.to_string(), e.clone())))
            .collect();
        if let Err(e) = persistence.save(&file) {
            warn!("Failed to save {} snapshot: {}", D::NAME, e);
            if let Some(hint) = e.recovery_suggestion() {
                warn!("{}", hint);
            }
        }
    }
}
