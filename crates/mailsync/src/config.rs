//! Runtime configuration for the sync engine and scheduler
//!
//! Loaded from `mailsync.json` in the config directory, then overridden by
//! `MAILSYNC_*` environment variables (e.g. `MAILSYNC_MAX_CONCURRENT_RUNS=8`).
//! Every field has a default, so an empty or missing file is valid.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryPolicy;

/// Config filename in the mailsync config directory
pub const CONFIG_FILE: &str = "mailsync.json";

const ENV_PREFIX: &str = "MAILSYNC_";

/// Upper bound for every second-based setting (about 100 years)
pub const MAX_SECS: u64 = 100 * 365 * 24 * 3600;

/// Upper bound for `run_history_retention_days`
pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

fn chrono_secs(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot parse {var}={value:?}")]
    BadEnv { var: String, value: String },
}

fn default_tick_interval_secs() -> u64 {
    300
}

fn default_staleness_threshold_secs() -> u64 {
    3600
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_max_pages_per_run() -> usize {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    100
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_run_history_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// An account is due once its last sync is older than this
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Pages per run; the remainder is left for the next run
    #[serde(default = "default_max_pages_per_run")]
    pub max_pages_per_run: usize,

    /// Total tries per fetch or commit, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// How long a shutdown waits for in-flight runs
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Terminal runs older than this are pruned; 0 keeps them forever
    #[serde(default = "default_run_history_retention_days")]
    pub run_history_retention_days: u32,

    /// Top-level payload keys every record must carry
    #[serde(default)]
    pub required_fields: Vec<String>,

    /// SQLite database; defaults to `mailsync.db` in the data directory
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Spool root for the file fetch client; defaults to `spool/` in the data directory
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_pages_per_run: default_max_pages_per_run(),
            retry_attempts: default_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            run_history_retention_days: default_run_history_retention_days(),
            required_fields: Vec::new(),
            database_path: None,
            spool_dir: None,
        }
    }
}

impl SyncConfig {
    /// Load from the config directory and environment, then validate
    pub fn load() -> Result<Self> {
        let mut config: SyncConfig = config::load_json_or_default(CONFIG_FILE)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, then environment, then validate
    pub fn load_file(path: &Path) -> Result<Self> {
        let mut config: SyncConfig = config::load_json_file(path)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MAILSYNC_*` overrides; unrelated variables are ignored
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (var, value) in vars {
            let Some(key) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            let bad = || ConfigError::BadEnv {
                var: var.clone(),
                value: value.clone(),
            };

            match key.as_str() {
                "tick_interval_secs" => self.tick_interval_secs = value.parse().map_err(|_| bad())?,
                "staleness_threshold_secs" => {
                    self.staleness_threshold_secs = value.parse().map_err(|_| bad())?
                }
                "max_concurrent_runs" => self.max_concurrent_runs = value.parse().map_err(|_| bad())?,
                "max_pages_per_run" => self.max_pages_per_run = value.parse().map_err(|_| bad())?,
                "retry_attempts" => self.retry_attempts = value.parse().map_err(|_| bad())?,
                "backoff_base_ms" => self.backoff_base_ms = value.parse().map_err(|_| bad())?,
                "backoff_multiplier" => self.backoff_multiplier = value.parse().map_err(|_| bad())?,
                "backoff_max_ms" => self.backoff_max_ms = value.parse().map_err(|_| bad())?,
                "backoff_jitter_ms" => self.backoff_jitter_ms = value.parse().map_err(|_| bad())?,
                "run_timeout_secs" => self.run_timeout_secs = value.parse().map_err(|_| bad())?,
                "shutdown_grace_secs" => self.shutdown_grace_secs = value.parse().map_err(|_| bad())?,
                "run_history_retention_days" => {
                    self.run_history_retention_days = value.parse().map_err(|_| bad())?
                }
                "required_fields" => {
                    self.required_fields = value
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "database_path" => self.database_path = Some(PathBuf::from(&value)),
                "spool_dir" => self.spool_dir = Some(PathBuf::from(&value)),
                // Directory overrides handled by the config crate
                "config_dir" | "data_dir" | "log" => {}
                other => log::warn!("Ignoring unknown setting {}{}", ENV_PREFIX, other.to_uppercase()),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.tick_interval_secs == 0 {
            return invalid("tick_interval_secs", "must be positive");
        }
        if self.max_concurrent_runs == 0 {
            return invalid("max_concurrent_runs", "must be at least 1");
        }
        if self.max_pages_per_run == 0 {
            return invalid("max_pages_per_run", "must be at least 1");
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts", "must be at least 1");
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier", "must be >= 1.0");
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return invalid("backoff_max_ms", "must not be below backoff_base_ms");
        }
        if self.run_timeout_secs == 0 {
            return invalid("run_timeout_secs", "must be positive");
        }

        let bounded = [
            ("tick_interval_secs", self.tick_interval_secs),
            ("staleness_threshold_secs", self.staleness_threshold_secs),
            ("run_timeout_secs", self.run_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ];
        for (field, secs) in bounded {
            if secs > MAX_SECS {
                return invalid(field, &format!("must not exceed {} seconds", MAX_SECS));
            }
        }
        if self.backoff_max_ms / 1000 > MAX_SECS {
            return invalid("backoff_max_ms", &format!("must not exceed {} seconds", MAX_SECS));
        }
        if self.backoff_jitter_ms / 1000 > MAX_SECS {
            return invalid("backoff_jitter_ms", &format!("must not exceed {} seconds", MAX_SECS));
        }
        if self.run_history_retention_days > MAX_RETENTION_DAYS {
            return invalid(
                "run_history_retention_days",
                &format!("must not exceed {} days", MAX_RETENTION_DAYS),
            );
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Saturates at `chrono::Duration::MAX` for unvalidated values
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono_secs(self.staleness_threshold_secs)
    }

    pub fn run_timeout(&self) -> chrono::Duration {
        chrono_secs(self.run_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// None when run history is kept forever
    pub fn run_history_retention(&self) -> Option<chrono::Duration> {
        (self.run_history_retention_days > 0).then(|| {
            chrono::Duration::try_days(i64::from(self.run_history_retention_days))
                .unwrap_or(chrono::Duration::MAX)
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max: Duration::from_millis(self.backoff_max_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }

    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(|| config::data_path("mailsync.db"))
            .unwrap_or_else(|| PathBuf::from("mailsync.db"))
    }

    pub fn resolved_spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .or_else(|| config::data_path("spool"))
            .unwrap_or_else(|| PathBuf::from("spool"))
    }
}
