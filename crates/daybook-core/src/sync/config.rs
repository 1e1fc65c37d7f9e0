//! Runtime configuration for one domain's sync coordinator.

use std::path::PathBuf;
use std::time::Duration;

use super::transport::DEFAULT_TIMEOUT;

/// Settings for a [`SyncCoordinator`](super::SyncCoordinator)
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Domain name; expands `{domain}` in endpoint paths
    pub domain: String,
    /// Server base URL
    pub server_url: String,
    pub push_path: String,
    pub pull_path: String,
    pub poke_path: String,
    /// Minimum time between construction and the first pull
    pub pull_warmup: Duration,
    /// Pull once as soon as the gate opens
    pub pull_on_ready: bool,
    /// Push in the background after every mutation; otherwise only on flush
    pub auto_push: bool,
    /// Push retry policy
    pub retry: RetryConfig,
    /// Snapshot file; `None` keeps the replica in memory only
    pub persistence_path: Option<PathBuf>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl SyncConfig {
    pub fn new(domain: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            server_url: server_url.into(),
            push_path: "api/{domain}/push".to_string(),
            pull_path: "api/{domain}/pull".to_string(),
            poke_path: "api/poke".to_string(),
            pull_warmup: Duration::ZERO,
            pull_on_ready: true,
            auto_push: true,
            retry: RetryConfig::default(),
            persistence_path: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_paths(mut self, push: &str, pull: &str, poke: &str) -> Self {
        self.push_path = push.to_string();
        self.pull_path = pull.to_string();
        self.poke_path = poke.to_string();
        self
    }

    pub fn with_pull_warmup(mut self, warmup: Duration) -> Self {
        self.pull_warmup = warmup;
        self
    }

    pub fn with_pull_on_ready(mut self, enabled: bool) -> Self {
        self.pull_on_ready = enabled;
        self
    }

    pub fn with_auto_push(mut self, enabled: bool) -> Self {
        self.auto_push = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    /// Copy of this config whose snapshot lives under `accounts/<account>/`
    /// next to the shared snapshot path
    pub fn for_account(&self, account: &str) -> Self {
        let mut config = self.clone();
        if let Some(path) = &self.persistence_path {
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            let file = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("{}.json", self.domain)));
            config.persistence_path = Some(dir.join("accounts").join(account).join(file));
        }
        config
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn push_url(&self) -> String {
        self.endpoint(&self.push_path)
    }

    pub fn pull_url(&self) -> String {
        self.endpoint(&self.pull_path)
    }

    pub fn poke_url(&self) -> String {
        self.endpoint(&self.poke_path)
    }

    fn endpoint(&self, template: &str) -> String {
        join_url(&self.server_url, &template.replace("{domain}", &self.domain))
    }
}

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Backoff policy for pushes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; at least 1
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; the first attempt never waits)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
