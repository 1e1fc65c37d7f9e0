//! Credentials and change notification
//!
//! A [`CredentialStore`] holds the bearer token and the user id it belongs to.
//! [`TokenProvider`] reads the store on demand and tells listeners when the
//! credential changes. Every call to [`TokenProvider::notify_changed`]
//! restarts a debounce window; when it expires the store is re-read and
//! listeners run once, and only if the value differs from what they last saw.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::listeners::{Listeners, Subscription};
use crate::storage::persistence::atomic_write;
use crate::storage::StorageError;

/// A bearer token and the account it authenticates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// File-system safe directory name for this account's local data
    ///
    /// `None` when the credential carries no user id.
    pub fn account_dir(&self) -> Option<String> {
        let user_id = self.user_id.as_deref()?.trim();
        if user_id.is_empty() {
            return None;
        }
        let dir: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Some(dir)
    }
}

/// Where the credential lives between runs
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Credential held in memory only
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.credential.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.credential.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.credential.lock() = None;
        Ok(())
    }
}

/// Credential stored as TOML (`token`, `user_id`)
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::ReadError {
                    path: self.path.clone(),
                    source: e,
                }
                .into())
            }
        };
        let credential: Credential = toml::from_str(&content).map_err(|e| {
            SyncError::auth(format!("Malformed credentials file {:?}: {}", self.path, e))
        })?;
        if credential.token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let content = toml::to_string_pretty(credential)
            .map_err(|e| SyncError::auth(format!("Failed to encode credentials: {}", e)))?;
        atomic_write(&self.path, content.as_bytes())?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, self.path.clone()).into()),
        }
    }
}

struct ProviderInner {
    store: Arc<dyn CredentialStore>,
    debounce: Duration,
    listeners: Listeners<Option<Credential>>,
    last_delivered: Mutex<Option<Credential>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }
}

/// Source of the current credential
///
/// Cloning yields another handle to the same provider.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<ProviderInner>,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn CredentialStore>, debounce: Duration) -> Self {
        let initial = read_store(store.as_ref());
        Self {
            inner: Arc::new(ProviderInner {
                store,
                debounce,
                listeners: Listeners::new(),
                last_delivered: Mutex::new(initial),
                pending: Mutex::new(None),
            }),
        }
    }

    /// In-memory provider holding `credential`
    pub fn in_memory(credential: Option<Credential>, debounce: Duration) -> Self {
        let store = match credential {
            Some(credential) => MemoryCredentialStore::with_credential(credential),
            None => MemoryCredentialStore::new(),
        };
        Self::new(Arc::new(store), debounce)
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// Read the credential now; store failures are logged and read as absent
    pub fn current(&self) -> Option<Credential> {
        read_store(self.inner.store.as_ref())
    }

    /// Call `listener` with the new credential after each debounced change
    pub fn on_change(
        &self,
        listener: impl Fn(&Option<Credential>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.add(listener).0
    }

    /// Store a credential and announce the change
    pub fn set(&self, credential: &Credential) -> Result<()> {
        self.inner.store.save(credential)?;
        self.notify_changed();
        Ok(())
    }

    /// Remove the credential and announce the change
    pub fn clear(&self) -> Result<()> {
        self.inner.store.clear()?;
        self.notify_changed();
        Ok(())
    }

    /// Signal that the stored credential may have changed
    ///
    /// Inside a tokio runtime delivery waits for the debounce window; outside
    /// one it happens immediately.
    pub fn notify_changed(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            deliver(&self.inner);
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.pending.lock().take();
                deliver(&inner);
            }
        });

        if let Some(previous) = self.inner.pending.lock().replace(task) {
            debug!("Credential change within debounce window, restarting");
            previous.abort();
        }
    }
}

fn read_store(store: &dyn CredentialStore) -> Option<Credential> {
    match store.load() {
        Ok(credential) => credential,
        Err(e) => {
            warn!("Failed to read credential: {}", e);
            None
        }
    }
}

fn deliver(inner: &ProviderInner) {
    let current = read_store(inner.store.as_ref());
    {
        let mut last = inner.last_delivered.lock();
        if *last == current {
            debug!("Credential unchanged, not notifying");
            return;
        }
        *last = current.clone();
    }
    debug!(
        "Credential {}",
        if current.is_some() { "changed" } else { "removed" }
    );
    inner.listeners.emit(&current);
}
