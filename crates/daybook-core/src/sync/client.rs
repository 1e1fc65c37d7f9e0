//! Per-domain sync client
//!
//! A [`SyncClient`] owns the lifecycle of one domain's [`SyncCoordinator`].
//! It builds a coordinator whenever a credential is available and tears it
//! down when the credential goes away, following [`TokenProvider`] change
//! notifications. Subscriptions taken on a coordinator end when it is
//! replaced.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::config::SyncConfig;
use super::coordinator::{PullOutcome, PushOutcome, SyncCoordinator};
use super::invalidation::InvalidationChannel;
use super::transport::SyncTransport;
use crate::credentials::{Credential, TokenProvider};
use crate::error::{Result, SyncError};
use crate::listeners::Subscription;
use crate::models::{Domain, Entity};
use crate::mutation::DomainMutation;
use crate::replica::Scan;

struct ClientInner<D: Domain> {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    tokens: TokenProvider,
    channel: Mutex<Option<InvalidationChannel>>,
    coordinator: Mutex<Option<SyncCoordinator<D>>>,
    credential_listener: Mutex<Option<Subscription>>,
    builds: AtomicUsize,
}

impl<D: Domain> ClientInner<D> {
    fn rebuild(&self, credential: &Option<Credential>) -> Result<()> {
        let previous = self.coordinator.lock().take();
        if let Some(previous) = previous {
            previous.shutdown();
        }
        let Some(credential) = credential else {
            info!("Credential removed, {} client released", D::NAME);
            return Ok(());
        };

        // Each account keeps its own replica and queue on disk
        let config = match credential.account_dir() {
            Some(account) => self.config.for_account(&account),
            None => self.config.clone(),
        };
        let coordinator =
            SyncCoordinator::new(config, self.transport.clone(), self.tokens.clone())?;
        if let Some(channel) = self.channel.lock().as_ref() {
            coordinator.attach(channel);
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.coordinator.lock() = Some(coordinator);
        Ok(())
    }
}

impl<D: Domain> Drop for ClientInner<D> {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.lock().take() {
            coordinator.shutdown();
        }
    }
}

/// Sync entry point for one domain
///
/// Cloning yields another handle to the same client.
pub struct SyncClient<D: Domain> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Domain> Clone for SyncClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Domain> SyncClient<D> {
    /// Create the client; a coordinator is built right away if a credential
    /// is already stored
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        tokens: TokenProvider,
    ) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            config,
            transport,
            tokens: tokens.clone(),
            channel: Mutex::new(None),
            coordinator: Mutex::new(None),
            credential_listener: Mutex::new(None),
            builds: AtomicUsize::new(0),
        });

        let current = tokens.current();
        if current.is_some() {
            inner.rebuild(&current)?;
        }

        let weak: Weak<ClientInner<D>> = Arc::downgrade(&inner);
        let listener = tokens.on_change(move |credential| {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.rebuild(credential) {
                    warn!("Failed to rebuild {} coordinator: {}", D::NAME, e);
                    return Err(e.into());
                }
            }
            Ok(())
        });
        *inner.credential_listener.lock() = Some(listener);

        Ok(Self { inner })
    }

    /// Route `sync` events from `channel` to this client's coordinators
    pub fn attach(&self, channel: &InvalidationChannel) {
        *self.inner.channel.lock() = Some(channel.clone());
        if let Some(coordinator) = self.inner.coordinator.lock().as_ref() {
            coordinator.attach(channel);
        }
    }

    pub fn domain(&self) -> &'static str {
        D::NAME
    }

    /// The live coordinator, if a credential is present
    pub fn coordinator(&self) -> Option<SyncCoordinator<D>> {
        self.inner.coordinator.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.coordinator.lock().is_some()
    }

    /// How many coordinators have been built over this client's lifetime
    pub fn coordinator_builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    fn require(&self) -> Result<SyncCoordinator<D>> {
        self.coordinator()
            .ok_or(SyncError::NotInitialized { domain: D::NAME })
    }

    pub fn mutate(&self, mutation: DomainMutation<D>) -> Result<u64> {
        self.require()?.mutate(mutation)
    }

    pub fn create(&self, fields: D::Fields) -> Result<String> {
        self.require()?.create(fields)
    }

    pub fn update(&self, id: &str, patch: D::Patch) -> Result<()> {
        self.require()?.update(id, patch)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.require()?.delete(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Entity<D::Fields>>> {
        Ok(self.require()?.get(id))
    }

    pub fn scan(&self) -> Result<Scan<D::Fields>> {
        Ok(self.require()?.scan())
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&[Entity<D::Fields>]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        Ok(self.require()?.subscribe(listener))
    }

    pub async fn pull(&self) -> Result<PullOutcome> {
        self.require()?.pull().await
    }

    pub async fn flush(&self) -> Result<PushOutcome> {
        self.require()?.flush().await
    }

    /// Release the coordinator and stop following credential changes
    pub fn shutdown(&self) {
        self.inner.credential_listener.lock().take();
        if let Some(coordinator) = self.inner.coordinator.lock().take() {
            coordinator.shutdown();
        }
    }
}
