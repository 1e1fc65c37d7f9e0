//! Callback registration shared by the replica, the invalidation channel and
//! the token provider.
//!
//! Callbacks run in registration order. A callback that returns an error or
//! panics is logged and the remaining callbacks still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
type RemovalHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Handle to a registered callback
///
/// Dropping the handle unsubscribes; so does [`Subscription::unsubscribe`].
/// Once either returns, the callback is never invoked again.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    active: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(active: Arc<AtomicBool>, detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            active,
            detach: Some(Box::new(detach)),
        }
    }

    /// Stop receiving callbacks
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    /// Whether callbacks are still being delivered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn detach_now(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

/// An ordered set of callbacks receiving `&T`
pub struct Listeners<T> {
    set: Arc<Mutex<ListenerSet<T>>>,
    on_removed: Option<RemovalHook>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            set: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
            on_removed: None,
        }
    }

    /// Call `hook` with the remaining listener count after every removal
    pub fn with_removal_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Arc::new(hook));
        self
    }

    /// Register a callback; returns the handle and the new listener count
    pub fn add(
        &self,
        callback: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> (Subscription, usize) {
        let active = Arc::new(AtomicBool::new(true));
        let (id, count) = {
            let mut set = self.set.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push(Entry {
                id,
                active: active.clone(),
                callback: Arc::new(callback),
            });
            (id, set.entries.len())
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.set);
        let hook = self.on_removed.clone();
        let subscription = Subscription::new(active, move || {
            let Some(set) = weak.upgrade() else {
                return;
            };
            let remaining = {
                let mut set = set.lock();
                set.entries.retain(|entry| entry.id != id);
                set.entries.len()
            };
            if let Some(hook) = hook {
                hook(remaining);
            }
        });

        (subscription, count)
    }

    /// Invoke every active callback in registration order
    ///
    /// Returns the number of callbacks that completed without error.
    pub fn emit(&self, value: &T) -> usize {
        let entries: Vec<(Arc<AtomicBool>, Callback<T>)> = self
            .set
            .lock()
            .entries
            .iter()
            .map(|entry| (entry.active.clone(), entry.callback.clone()))
            .collect();

        let mut delivered = 0;
        for (active, callback) in entries {
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Listener failed: {:#}", e),
                Err(_) => warn!("Listener panicked; continuing delivery"),
            }
        }
        delivered
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.set.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deactivate and drop every callback without running removal hooks
    pub fn clear(&self) {
        let mut set = self.set.lock();
        for entry in &set.entries {
            entry.active.store(false, Ordering::SeqCst);
        }
        set.entries.clear();
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let (_a, _) = listeners.add(move |v| {
            first.lock().push(("first", *v));
            Ok(())
        });
        let second = seen.clone();
        let (_b, count) = listeners.add(move |v| {
            second.lock().push(("second", *v));
            Ok(())
        });
        assert_eq!(count, 2);

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_failing_listeners_do_not_block_others() {
        let listeners: Listeners<()> = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (_err, _) = listeners.add(|_| anyhow::bail!("boom"));
        let (_panic, _) = listeners.add(|_| panic!("listener bug"));
        let counter = calls.clone();
        let (_ok, _) = listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(listeners.emit(&()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let listeners: Listeners<()> = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let (subscription, _) = listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        listeners.emit(&());
        subscription.unsubscribe();
        listeners.emit(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes_and_runs_hook() {
        let remaining = Arc::new(Mutex::new(Vec::new()));
        let record = remaining.clone();
        let listeners: Listeners<()> =
            Listeners::new().with_removal_hook(move |left| record.lock().push(left));

        let (a, _) = listeners.add(|_| Ok(()));
        let (b, _) = listeners.add(|_| Ok(()));
        drop(a);
        drop(b);

        assert_eq!(*remaining.lock(), vec![1, 0]);
    }
}
