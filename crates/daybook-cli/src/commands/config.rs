//! Config command handlers

use anyhow::{bail, Context, Result};

use daybook_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, server_url, sync_enabled, pull_warmup_ms, \
                    credential_debounce_ms, push_max_attempts, log_file";

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!(
                "  server_url:             {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:           {}", config.sync_enabled);
            println!("  pull_warmup_ms:         {}", config.pull_warmup_ms);
            println!("  credential_debounce_ms: {}", config.credential_debounce_ms);
            println!("  push_max_attempts:      {}", config.push_max_attempts);
            println!(
                "  log_file:               {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "server_url" => config.server_url = optional(value),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "pull_warmup_ms" => {
            config.pull_warmup_ms = value
                .parse()
                .context("Invalid value for pull_warmup_ms. Use a number of milliseconds.")?;
        }
        "credential_debounce_ms" => {
            config.credential_debounce_ms = value.parse().context(
                "Invalid value for credential_debounce_ms. Use a number of milliseconds.",
            )?;
        }
        "push_max_attempts" => {
            let attempts: u32 = value
                .parse()
                .context("Invalid value for push_max_attempts. Use a positive number.")?;
            if attempts == 0 {
                bail!("push_max_attempts must be at least 1");
            }
            config.push_max_attempts = attempts;
        }
        "log_file" => config.log_file = optional(value).map(Into::into),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "server_url", "https://sync.example.com").unwrap();
        apply(&mut config, "sync_enabled", "true").unwrap();
        apply(&mut config, "pull_warmup_ms", "2000").unwrap();

        assert_eq!(config.server_url.as_deref(), Some("https://sync.example.com"));
        assert!(config.sync_enabled);
        assert_eq!(config.pull_warmup_ms, 2000);

        apply(&mut config, "server_url", "none").unwrap();
        assert!(config.server_url.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "sync_enabled", "maybe").is_err());
        assert!(apply(&mut config, "push_max_attempts", "0").is_err());
        assert!(apply(&mut config, "favorite_color", "blue").is_err());
    }
}
