//! Local replica
//!
//! An ordered key-value store of [`Entity`] records for one domain. Writes go
//! through [`Transaction`]s that are staged and committed atomically; readers
//! work on copy-on-write [`Snapshot`]s. Subscriptions re-run their query after
//! every commit that touches their watched prefix and receive the new result
//! outside the replica lock, so a listener may read the replica again.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::listeners::Subscription;
use crate::models::Entity;

type Records<F> = BTreeMap<String, Entity<F>>;
type Query<F> = Box<dyn Fn(&Snapshot<F>) -> Vec<Entity<F>> + Send + Sync>;
type Listener<F> = Box<dyn Fn(&[Entity<F>]) + Send + Sync>;

/// A point-in-time view of the replica
pub struct Snapshot<F> {
    records: Arc<Records<F>>,
    version: u64,
}

impl<F> Clone for Snapshot<F> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            version: self.version,
        }
    }
}

impl<F> Snapshot<F> {
    /// Look up a record by key
    pub fn get(&self, key: &str) -> Option<&Entity<F>> {
        self.records.get(key)
    }

    /// Iterate records whose key starts with `prefix`, in key order
    pub fn scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Entity<F>> + 'a {
        self.records
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(_, entity)| entity)
    }

    /// All keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Commit counter this snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A lazy prefix scan that owns its snapshot
///
/// Cloning a scan before it is consumed, or calling [`Scan::restart`], starts
/// the iteration over from the first matching key.
pub struct Scan<F> {
    records: Arc<Records<F>>,
    prefix: String,
    cursor: Option<String>,
}

impl<F> Scan<F> {
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

impl<F> Clone for Scan<F> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            prefix: self.prefix.clone(),
            cursor: self.cursor.clone(),
        }
    }
}

impl<F: Clone> Iterator for Scan<F> {
    type Item = Entity<F>;

    fn next(&mut self) -> Option<Entity<F>> {
        let lower = match self.cursor {
            Some(ref key) => Bound::Excluded(key.as_str()),
            None => Bound::Included(self.prefix.as_str()),
        };
        let (key, entity) = self
            .records
            .range::<str, _>((lower, Bound::Unbounded))
            .next()?;
        if !key.starts_with(&self.prefix) {
            return None;
        }
        self.cursor = Some(key.clone());
        Some(entity.clone())
    }
}

/// Staged writes against a replica
///
/// Reads see the transaction's own writes first. Nothing reaches the replica
/// until the closure passed to [`Replica::transact`] returns `Ok`.
pub struct Transaction<'a, F> {
    base: &'a Records<F>,
    writes: BTreeMap<String, Option<Entity<F>>>,
}

impl<'a, F> Transaction<'a, F> {
    fn new(base: &'a Records<F>) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Entity<F>> {
        match self.writes.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(key),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, entity: Entity<F>) {
        self.writes.insert(key.into(), Some(entity));
    }

    /// Remove a key; removing an absent key is a no-op
    pub fn delete(&mut self, key: &str) {
        if self.has(key) {
            self.writes.insert(key.to_string(), None);
        }
    }

    /// Drop every record, including ones staged earlier in this transaction
    pub fn clear(&mut self) {
        self.writes.clear();
        for key in self.base.keys() {
            self.writes.insert(key.clone(), None);
        }
    }

    /// Records under `prefix` as this transaction sees them, in key order
    pub fn scan(&self, prefix: &str) -> Vec<&Entity<F>> {
        let mut merged: BTreeMap<&str, &Entity<F>> = self
            .base
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entity)| (key.as_str(), entity))
            .collect();
        for (key, staged) in &self.writes {
            if !key.starts_with(prefix) {
                continue;
            }
            match staged {
                Some(entity) => {
                    merged.insert(key.as_str(), entity);
                }
                None => {
                    merged.remove(key.as_str());
                }
            }
        }
        merged.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// One change in a pull response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp<V> {
    /// Remove every record
    Clear,
    /// Insert or overwrite a record
    Put { key: String, value: V },
    /// Remove a record
    Del { key: String },
}

struct DeliveryState<F> {
    version: u64,
    last: Option<Vec<Entity<F>>>,
}

struct SubscriptionSlot<F> {
    id: u64,
    prefix: String,
    active: Arc<AtomicBool>,
    query: Query<F>,
    listener: Listener<F>,
    delivery: Mutex<DeliveryState<F>>,
}

struct ReplicaInner<F> {
    records: Arc<Records<F>>,
    version: u64,
    hydrated: bool,
    next_subscription_id: u64,
    subscriptions: Vec<Arc<SubscriptionSlot<F>>>,
}

/// The local, per-domain copy of entity state
///
/// Cloning a `Replica` yields another handle to the same store.
pub struct Replica<F> {
    inner: Arc<Mutex<ReplicaInner<F>>>,
}

impl<F> Clone for Replica<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F> Replica<F>
where
    F: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an empty replica that has not been hydrated yet
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReplicaInner {
                records: Arc::new(BTreeMap::new()),
                version: 0,
                hydrated: false,
                next_subscription_id: 0,
                subscriptions: Vec::new(),
            })),
        }
    }

    /// Load previously persisted records and mark the replica hydrated
    ///
    /// Records written locally before hydration are kept.
    pub fn hydrate(&self, entities: Vec<(String, Entity<F>)>) {
        self.commit_with(|tx| {
            for (key, entity) in entities {
                if !tx.has(&key) {
                    tx.set(key, entity);
                }
            }
            Ok::<_, std::convert::Infallible>(())
        })
        .ok();
        self.inner.lock().hydrated = true;
        debug!("Replica hydrated with {} record(s)", self.len());
    }

    /// Whether persisted local state has been loaded
    pub fn is_hydrated(&self) -> bool {
        self.inner.lock().hydrated
    }

    pub fn snapshot(&self) -> Snapshot<F> {
        let inner = self.inner.lock();
        Snapshot {
            records: inner.records.clone(),
            version: inner.version,
        }
    }

    pub fn get(&self, key: &str) -> Option<Entity<F>> {
        self.inner.lock().records.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, entity: Entity<F>) {
        let key = key.into();
        self.commit_with(move |tx| {
            tx.set(key, entity);
            Ok::<_, std::convert::Infallible>(())
        })
        .ok();
    }

    /// Remove a key; removing an absent key is a no-op
    pub fn delete(&self, key: &str) {
        self.commit_with(|tx| {
            tx.delete(key);
            Ok::<_, std::convert::Infallible>(())
        })
        .ok();
    }

    /// Lazily scan records under `prefix` as of now
    pub fn scan(&self, prefix: &str) -> Scan<F> {
        Scan {
            records: self.inner.lock().records.clone(),
            prefix: prefix.to_string(),
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` as one atomic transaction
    ///
    /// If `f` returns an error the staged writes are discarded and the replica
    /// is left exactly as it was.
    pub fn transact<R, E>(
        &self,
        f: impl FnOnce(&mut Transaction<'_, F>) -> Result<R, E>,
    ) -> Result<R, E> {
        self.commit_with(f)
    }

    /// Replace the whole contents with `entities` in one commit
    ///
    /// Subscribers see a single delivery with the new result.
    pub fn replace_all(&self, entities: Vec<(String, Entity<F>)>) {
        self.commit_with(|tx| {
            tx.clear();
            for (key, entity) in entities {
                tx.set(key, entity);
            }
            Ok::<_, std::convert::Infallible>(())
        })
        .ok();
    }

    /// Apply a pull patch as a single transaction; returns the number of ops applied
    pub fn apply_patch(&self, ops: Vec<PatchOp<Entity<F>>>) -> usize {
        let count = ops.len();
        self.commit_with(|tx| {
            for op in ops {
                match op {
                    PatchOp::Clear => tx.clear(),
                    PatchOp::Put { key, value } => tx.set(key, value),
                    PatchOp::Del { key } => tx.delete(&key),
                }
            }
            Ok::<_, std::convert::Infallible>(())
        })
        .ok();
        count
    }

    /// Subscribe to every record under `prefix`
    ///
    /// The listener receives the current result immediately, then again after
    /// each commit that changes it.
    pub fn subscribe(
        &self,
        prefix: impl Into<String>,
        listener: impl Fn(&[Entity<F>]) + Send + Sync + 'static,
    ) -> Subscription {
        let prefix = prefix.into();
        let scan_prefix = prefix.clone();
        self.subscribe_query(
            prefix,
            move |snapshot| snapshot.scan(&scan_prefix).cloned().collect(),
            listener,
        )
    }

    /// Subscribe to an arbitrary read-only query
    ///
    /// The query is re-run after commits touching `watch_prefix`; pass `""` to
    /// re-run after every commit.
    pub fn subscribe_query(
        &self,
        watch_prefix: impl Into<String>,
        query: impl Fn(&Snapshot<F>) -> Vec<Entity<F>> + Send + Sync + 'static,
        listener: impl Fn(&[Entity<F>]) + Send + Sync + 'static,
    ) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let (slot, snapshot) = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscription_id;
            inner.next_subscription_id += 1;
            let slot = Arc::new(SubscriptionSlot {
                id,
                prefix: watch_prefix.into(),
                active: active.clone(),
                query: Box::new(query),
                listener: Box::new(listener),
                delivery: Mutex::new(DeliveryState {
                    version: 0,
                    last: None,
                }),
            });
            inner.subscriptions.push(slot.clone());
            let snapshot = Snapshot {
                records: inner.records.clone(),
                version: inner.version,
            };
            (slot, snapshot)
        };

        deliver(&slot, &snapshot);

        let weak: Weak<Mutex<ReplicaInner<F>>> = Arc::downgrade(&self.inner);
        let id = slot.id;
        Subscription::new(active, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().subscriptions.retain(|slot| slot.id != id);
            }
        })
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Silence and drop every subscription
    pub fn close_subscriptions(&self) {
        let mut inner = self.inner.lock();
        for slot in &inner.subscriptions {
            slot.active.store(false, Ordering::SeqCst);
        }
        inner.subscriptions.clear();
    }

    fn commit_with<R, E>(
        &self,
        f: impl FnOnce(&mut Transaction<'_, F>) -> Result<R, E>,
    ) -> Result<R, E> {
        let (result, snapshot, affected) = {
            let mut inner = self.inner.lock();
            let (result, writes) = {
                let mut tx = Transaction::new(&inner.records);
                let result = f(&mut tx)?;
                (result, tx.writes)
            };

            let mut changed: BTreeSet<String> = BTreeSet::new();
            if !writes.is_empty() {
                let records = Arc::make_mut(&mut inner.records);
                for (key, staged) in writes {
                    match staged {
                        Some(entity) => {
                            if records.get(&key) != Some(&entity) {
                                records.insert(key.clone(), entity);
                                changed.insert(key);
                            }
                        }
                        None => {
                            if records.remove(&key).is_some() {
                                changed.insert(key);
                            }
                        }
                    }
                }
            }

            if changed.is_empty() {
                return Ok(result);
            }

            inner.version += 1;
            let snapshot = Snapshot {
                records: inner.records.clone(),
                version: inner.version,
            };
            let affected: Vec<Arc<SubscriptionSlot<F>>> = inner
                .subscriptions
                .iter()
                .filter(|slot| changed.iter().any(|key| key.starts_with(&slot.prefix)))
                .cloned()
                .collect();
            (result, snapshot, affected)
        };

        for slot in affected {
            deliver(&slot, &snapshot);
        }
        Ok(result)
    }
}

impl<F> Default for Replica<F>
where
    F: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Re-run a subscription's query and call its listener if the result changed
///
/// Deliveries are ordered by snapshot version: a slower commit never
/// overwrites a newer result the listener already saw.
fn deliver<F: Clone + PartialEq>(slot: &SubscriptionSlot<F>, snapshot: &Snapshot<F>) {
    if !slot.active.load(Ordering::SeqCst) {
        return;
    }
    let result = {
        let mut delivery = slot.delivery.lock();
        if delivery.last.is_some() && snapshot.version <= delivery.version {
            return;
        }
        let result = (slot.query)(snapshot);
        if delivery.last.as_ref() == Some(&result) {
            delivery.version = snapshot.version;
            return;
        }
        delivery.version = snapshot.version;
        delivery.last = Some(result.clone());
        result
    };
    if slot.active.load(Ordering::SeqCst) {
        (slot.listener)(&result);
    }
}
