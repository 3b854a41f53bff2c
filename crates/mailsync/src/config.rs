//! Sync engine configuration
//!
//! Settings are resolved in this order (later wins):
//! 1. Built-in defaults
//! 2. JSON file (~/.config/mailsync/mailsync.json)
//! 3. Environment variables (`MAILSYNC_*`)

use anyhow::{Context, Result};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Tier;
use crate::sync::{DEFAULT_HISTORY_SIZE, parse_cron};

/// Settings filename in the mailsync config directory
const SETTINGS_FILE: &str = "mailsync.json";

/// Default database filename in the mailsync config directory
const DATABASE_FILE: &str = "mailsync.db";

const ENV_INCREMENTAL_CRON: &str = "MAILSYNC_INCREMENTAL_CRON";
const ENV_FULL_CRON: &str = "MAILSYNC_FULL_CRON";
const ENV_RECEIVER_TIMEOUT: &str = "MAILSYNC_RECEIVER_TIMEOUT_SECS";
const ENV_DATABASE_PATH: &str = "MAILSYNC_DATABASE_PATH";

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {tier} cron expression '{expr}': {reason}")]
    InvalidCron {
        tier: Tier,
        expr: String,
        reason: String,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("receiver timeout must be greater than zero")]
    ZeroTimeout,
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Cron expression for the incremental tier (5 or 6 fields, UTC)
    pub incremental_cron: String,
    /// Cron expression for the daily full tier (5 or 6 fields, UTC).
    /// 5-field expressions use standard weekday numbers (0 or 7 = Sunday).
    pub full_cron: String,
    /// Upper bound on one receiver sync
    pub receiver_timeout_secs: u64,
    /// Upper bound on one mailbox HTTP request, kept below the receiver timeout
    pub request_timeout_secs: u64,
    /// Number of completed runs kept in memory
    pub history_size: usize,
    /// SQLite database; defaults to ~/.config/mailsync/mailsync.db
    pub database_path: Option<PathBuf>,
    /// Attempts per Gmail message download
    pub gmail_max_retries: u32,
    /// Cap on messages pulled by one full fetch (None = whole mailbox)
    pub full_fetch_limit: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            incremental_cron: "*/5 * * * *".to_string(),
            full_cron: "0 2 * * *".to_string(),
            receiver_timeout_secs: 300,
            request_timeout_secs: 60,
            history_size: DEFAULT_HISTORY_SIZE,
            database_path: None,
            gmail_max_retries: 3,
            full_fetch_limit: None,
        }
    }
}

impl SyncConfig {
    /// Load settings from the config file (if present) and environment
    pub fn load() -> Result<Self> {
        let base = ::config::load_json_if_exists::<Self>(SETTINGS_FILE)?.unwrap_or_default();
        let config = base.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a specific JSON file, then apply the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let base: Self = ::config::load_json_file(path)?;
        let config = base.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse settings from a JSON string (no environment overrides)
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse sync settings")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MAILSYNC_*` overrides looked up through `lookup`
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(expr) = lookup(ENV_INCREMENTAL_CRON) {
            self.incremental_cron = expr;
        }
        if let Some(expr) = lookup(ENV_FULL_CRON) {
            self.full_cron = expr;
        }
        if let Some(value) = lookup(ENV_RECEIVER_TIMEOUT) {
            self.receiver_timeout_secs =
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_RECEIVER_TIMEOUT.to_string(),
                    value,
                })?;
        }
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            self.database_path = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    /// Check that both schedules parse and the timeout is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule(Tier::Incremental)?;
        self.schedule(Tier::Full)?;
        if self.receiver_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "request_timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Parsed cron schedule of a tier
    pub fn schedule(&self, tier: Tier) -> Result<Schedule, ConfigError> {
        let expr = match tier {
            Tier::Incremental => &self.incremental_cron,
            Tier::Full => &self.full_cron,
        };
        parse_cron(expr).map_err(|e| ConfigError::InvalidCron {
            tier,
            expr: expr.clone(),
            reason: e.to_string(),
        })
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_secs(self.receiver_timeout_secs)
    }

    /// Per-request timeout for mailbox clients.
    ///
    /// Capped one second under the receiver timeout so a stalled request
    /// returns, and releases its receiver, soon after the sync gives up on it.
    pub fn request_timeout(&self) -> Duration {
        let cap = self.receiver_timeout_secs.saturating_sub(1).max(1);
        Duration::from_secs(self.request_timeout_secs.min(cap))
    }

    /// Configured database path, or the default in the config directory
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| ::config::config_path(DATABASE_FILE))
    }

    /// Write these settings as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        ::config::save_json_file(path, self)
    }

    /// Get the default settings file path (~/.config/mailsync/mailsync.json)
    pub fn default_settings_path() -> Option<PathBuf> {
        ::config::config_path(SETTINGS_FILE)
    }
}
