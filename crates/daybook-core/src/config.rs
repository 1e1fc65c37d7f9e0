//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/daybook/config.toml)
//! 3. Environment variables (DAYBOOK_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::config::{RetryConfig, SyncConfig};

/// Environment variable prefix
const ENV_PREFIX: &str = "DAYBOOK";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for replica snapshots and stored credentials
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sync server base URL (optional)
    #[serde(default)]
    pub server_url: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Push endpoint path; `{domain}` expands to the domain name
    #[serde(default = "default_push_path")]
    pub push_path: String,

    /// Pull endpoint path; `{domain}` expands to the domain name
    #[serde(default = "default_pull_path")]
    pub pull_path: String,

    /// Poke endpoint path
    #[serde(default = "default_poke_path")]
    pub poke_path: String,

    /// Invalidation event stream path
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Time after startup before the first pull may run
    #[serde(default)]
    pub pull_warmup_ms: u64,

    /// Quiet period before a credential change is acted on
    #[serde(default = "default_credential_debounce_ms")]
    pub credential_debounce_ms: u64,

    /// Attempts per push before pending mutations wait for the next push
    #[serde(default = "default_push_max_attempts")]
    pub push_max_attempts: u32,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Pull in the background once a coordinator is ready (with sync
    /// enabled). Callers that pull explicitly turn this off. Not persisted.
    #[serde(skip, default = "default_pull_on_ready")]
    pub pull_on_ready: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_url: None,
            sync_enabled: false,
            push_path: default_push_path(),
            pull_path: default_pull_path(),
            poke_path: default_poke_path(),
            events_path: default_events_path(),
            pull_warmup_ms: 0,
            credential_debounce_ms: default_credential_debounce_ms(),
            push_max_attempts: default_push_max_attempts(),
            log_file: None,
            pull_on_ready: default_pull_on_ready(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DAYBOOK_DATA_DIR, DAYBOOK_SERVER_URL,
    ///    DAYBOOK_SYNC_ENABLED, DAYBOOK_PULL_WARMUP_MS)
    /// 2. Config file (~/.config/daybook/config.toml or DAYBOOK_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            self.server_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // Unparseable values are ignored rather than failing startup
        if let Ok(val) = std::env::var(format!("{}_PULL_WARMUP_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.trim().parse() {
                self.pull_warmup_ms = ms;
            }
        }
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DAYBOOK_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("daybook")
            .join("config.toml")
    }

    /// Path of the stored credential
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.toml")
    }

    /// Path of a domain's replica snapshot
    pub fn replica_path(&self, domain: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", domain))
    }

    /// Full URL of the invalidation event stream, if a server is configured
    pub fn events_url(&self) -> Option<String> {
        self.server_url
            .as_deref()
            .map(|base| crate::sync::config::join_url(base, &self.events_path))
    }

    pub fn credential_debounce(&self) -> Duration {
        Duration::from_millis(self.credential_debounce_ms)
    }

    /// Runtime sync settings for one domain
    ///
    /// Pushes are only attempted when sync is enabled; without a server URL
    /// the returned config points nowhere and must not be used for network
    /// calls.
    pub fn sync_config(&self, domain: &str) -> SyncConfig {
        SyncConfig::new(domain, self.server_url.clone().unwrap_or_default())
            .with_paths(&self.push_path, &self.pull_path, &self.poke_path)
            .with_pull_warmup(Duration::from_millis(self.pull_warmup_ms))
            .with_retry(RetryConfig::new(self.push_max_attempts))
            .with_persistence(self.replica_path(domain))
            .with_auto_push(self.sync_enabled)
            .with_pull_on_ready(self.sync_enabled && self.pull_on_ready)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("daybook")
}

fn default_pull_on_ready() -> bool {
    true
}

fn default_push_path() -> String {
    "api/{domain}/push".to_string()
}

fn default_pull_path() -> String {
    "api/{domain}/pull".to_string()
}

fn default_poke_path() -> String {
    "api/poke".to_string()
}

fn default_events_path() -> String {
    "api/events".to_string()
}

fn default_credential_debounce_ms() -> u64 {
    300
}

fn default_push_max_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "DAYBOOK_DATA_DIR",
        "DAYBOOK_SERVER_URL",
        "DAYBOOK_SYNC_ENABLED",
        "DAYBOOK_PULL_WARMUP_MS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.server_url.is_none());
        assert!(config.data_dir.ends_with("daybook"));
        assert_eq!(config.pull_warmup_ms, 0);
        assert_eq!(config.push_max_attempts, 3);
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.credentials_path().ends_with("credentials.toml"));
        assert!(config.replica_path("food").ends_with("food.json"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DAYBOOK_DATA_DIR", "/tmp/daybook-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/daybook-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(!config.sync_enabled);

        env::set_var("DAYBOOK_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("DAYBOOK_SYNC_ENABLED", "1");
        config.sync_enabled = false;
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("DAYBOOK_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_server_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DAYBOOK_SERVER_URL", "https://sync.example.com");
        config.apply_env_overrides();
        assert_eq!(
            config.server_url,
            Some("https://sync.example.com".to_string())
        );

        // Empty string clears it
        env::set_var("DAYBOOK_SERVER_URL", "");
        config.apply_env_overrides();
        assert!(config.server_url.is_none());
    }

    #[test]
    fn test_env_override_pull_warmup() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DAYBOOK_PULL_WARMUP_MS", "2000");
        config.apply_env_overrides();
        assert_eq!(config.pull_warmup_ms, 2000);

        env::set_var("DAYBOOK_PULL_WARMUP_MS", "soon");
        config.apply_env_overrides();
        assert_eq!(config.pull_warmup_ms, 2000);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/daybook"),
            server_url: Some("https://sync.example.com".to_string()),
            sync_enabled: true,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("server_url"));
        assert!(toml_str.contains("push_path"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.server_url, config.server_url);
        assert_eq!(parsed.push_path, config.push_path);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            server_url = "https://example.com"
            sync_enabled = true
            pull_warmup_ms = 2000
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.server_url, Some("https://example.com".to_string()));
        assert!(config.sync_enabled);
        assert_eq!(config.pull_warmup_ms, 2000);
        assert_eq!(config.poke_path, "api/poke");
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let temp_dir = tempfile::TempDir::new().unwrap();
        env::set_var("DAYBOOK_DATA_DIR", temp_dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.server_url.is_none());
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_sync_config_expands_domain() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_str(
            r#"
            server_url = "https://example.com/"
            sync_enabled = true
            pull_warmup_ms = 2000
            "#,
        )
        .unwrap();

        let sync = config.sync_config("ideas");
        assert_eq!(sync.push_url(), "https://example.com/api/ideas/push");
        assert_eq!(sync.pull_url(), "https://example.com/api/ideas/pull");
        assert_eq!(sync.poke_url(), "https://example.com/api/poke");
        assert_eq!(sync.pull_warmup, Duration::from_millis(2000));
        assert!(sync.auto_push);
        assert!(sync.pull_on_ready);
        assert_eq!(
            config.events_url().as_deref(),
            Some("https://example.com/api/events")
        );
    }

    #[test]
    fn test_explicit_pullers_disable_pull_on_ready() {
        let mut config = Config {
            sync_enabled: true,
            ..Config::default()
        };
        config.pull_on_ready = false;
        assert!(!config.sync_config("food").pull_on_ready);

        // Not read from or written to the config file
        let toml = toml::to_string(&config).unwrap();
        assert!(!toml.contains("pull_on_ready"));
        let parsed: Config = toml::from_str("pull_on_ready = false").unwrap();
        assert!(parsed.pull_on_ready);
    }
}
