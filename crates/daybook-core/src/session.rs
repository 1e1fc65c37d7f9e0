//! Session: one sync client per domain sharing a credential and event stream
//!
//! The `Session` is the main entry point for applications. It loads the
//! configuration, reads the stored credential, and builds a [`SyncClient`]
//! for each feature.
//!
//! ## Usage
//!
//! ```ignore
//! let session = Session::open()?;
//! session.food().create(FoodEntry { name: "Tea".into(), price: None })?;
//! session.flush_all().await;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::credentials::{Credential, FileCredentialStore, TokenProvider};
use crate::models::{Diary, Food, Ideas};
use crate::sync::transport::DEFAULT_TIMEOUT;
use crate::sync::{
    source_for_url, EventSource, HttpTransport, InvalidationChannel, PullOutcome, PushOutcome,
    SyncClient, SyncTransport,
};

/// Outcome of a sync step for one domain
pub type DomainResult<T> = (&'static str, crate::error::Result<T>);

pub struct Session {
    config: Config,
    tokens: TokenProvider,
    diary: SyncClient<Diary>,
    food: SyncClient<Food>,
    ideas: SyncClient<Ideas>,
    channel: Mutex<Option<InvalidationChannel>>,
}

impl Session {
    /// Open a session with the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open a session using HTTP and the credential file under the data dir
    pub fn open_with_config(config: Config) -> Result<Self> {
        let store = FileCredentialStore::new(config.credentials_path());
        let tokens = TokenProvider::new(Arc::new(store), config.credential_debounce());
        let transport =
            HttpTransport::new(DEFAULT_TIMEOUT).context("Failed to build HTTP client")?;
        Self::open_with(config, Arc::new(transport), tokens)
    }

    /// Open a session with an explicit transport and token provider
    pub fn open_with(
        config: Config,
        transport: Arc<dyn SyncTransport>,
        tokens: TokenProvider,
    ) -> Result<Self> {
        let diary = SyncClient::new(config.sync_config("diary"), transport.clone(), tokens.clone())
            .context("Failed to open diary")?;
        let food = SyncClient::new(config.sync_config("food"), transport.clone(), tokens.clone())
            .context("Failed to open food log")?;
        let ideas = SyncClient::new(config.sync_config("ideas"), transport, tokens.clone())
            .context("Failed to open ideas")?;

        Ok(Self {
            config,
            tokens,
            diary,
            food,
            ideas,
            channel: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    pub fn diary(&self) -> &SyncClient<Diary> {
        &self.diary
    }

    pub fn food(&self) -> &SyncClient<Food> {
        &self.food
    }

    pub fn ideas(&self) -> &SyncClient<Ideas> {
        &self.ideas
    }

    pub fn credential(&self) -> Option<Credential> {
        self.tokens.current()
    }

    /// Store a credential; clients rebuild after the debounce window
    pub fn login(&self, credential: &Credential) -> Result<()> {
        self.tokens.set(credential).context("Failed to save credential")
    }

    /// Remove the stored credential; clients release their coordinators
    pub fn logout(&self) -> Result<()> {
        self.tokens.clear().context("Failed to remove credential")
    }

    /// Connect every client to the event stream at the configured URL
    pub fn listen(&self) -> Result<InvalidationChannel> {
        let url = self
            .config
            .events_url()
            .context("No server_url configured")?;
        let source =
            source_for_url(&url, self.tokens.clone()).context("Failed to open event stream")?;
        Ok(self.listen_to(source))
    }

    /// Connect every client to events from `source`
    pub fn listen_to(&self, source: Arc<dyn EventSource>) -> InvalidationChannel {
        let channel = InvalidationChannel::new(source);
        self.diary.attach(&channel);
        self.food.attach(&channel);
        self.ideas.attach(&channel);
        *self.channel.lock() = Some(channel.clone());
        debug!("Session listening for invalidation events");
        channel
    }

    /// Push pending mutations of every domain
    pub async fn flush_all(&self) -> Vec<DomainResult<PushOutcome>> {
        vec![
            ("diary", self.diary.flush().await),
            ("food", self.food.flush().await),
            ("ideas", self.ideas.flush().await),
        ]
    }

    /// Pull every domain
    pub async fn pull_all(&self) -> Vec<DomainResult<PullOutcome>> {
        vec![
            ("diary", self.diary.pull().await),
            ("food", self.food.pull().await),
            ("ideas", self.ideas.pull().await),
        ]
    }

    /// Release every client and close the event stream
    pub fn shutdown(&self) {
        self.diary.shutdown();
        self.food.shutdown();
        self.ideas.shutdown();
        self.channel.lock().take();
    }
}
