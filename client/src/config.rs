//! Configuration management for the sync client.

use crate::scheduler::Trigger;
use std::env;
use std::time::Duration;

/// Default database location when `MUSHAF_DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://mushaf.db?mode=rwc";

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite connection URL of the local store
    pub database_url: String,
    /// Delays used by the scheduler
    pub scheduler: SchedulerConfig,
}

impl SyncConfig {
    /// Load configuration from the environment, reading a `.env` file first
    /// if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("MUSHAF_DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }

        let defaults = SchedulerConfig::default();
        let interval = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => parse_interval(name, &raw),
            }
        };

        Ok(Self {
            database_url,
            scheduler: SchedulerConfig {
                app_start_interval: interval(
                    "MUSHAF_APP_START_INTERVAL_SECS",
                    defaults.app_start_interval,
                )?,
                standard_interval: interval(
                    "MUSHAF_STANDARD_INTERVAL_SECS",
                    defaults.standard_interval,
                )?,
                local_data_modified_interval: interval(
                    "MUSHAF_LOCAL_DATA_MODIFIED_INTERVAL_SECS",
                    defaults.local_data_modified_interval,
                )?,
            },
        })
    }
}

fn parse_interval(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidInterval {
            name,
            value: raw.to_string(),
        }),
    }
}

/// Delays the scheduler applies to each trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay after the app comes to the foreground
    pub app_start_interval: Duration,
    /// Delay between regular passes after a successful one
    pub standard_interval: Duration,
    /// Delay after the user changed local data
    pub local_data_modified_interval: Duration,
}

impl SchedulerConfig {
    /// Build a config from whole seconds, all of which must be positive.
    pub fn from_secs(
        app_start: u64,
        standard: u64,
        local_data_modified: u64,
    ) -> Result<Self, ConfigError> {
        let check = |name: &'static str, secs: u64| {
            if secs == 0 {
                Err(ConfigError::InvalidInterval {
                    name,
                    value: secs.to_string(),
                })
            } else {
                Ok(Duration::from_secs(secs))
            }
        };
        Ok(Self {
            app_start_interval: check("app_start_interval", app_start)?,
            standard_interval: check("standard_interval", standard)?,
            local_data_modified_interval: check(
                "local_data_modified_interval",
                local_data_modified,
            )?,
        })
    }

    /// How long after `trigger` arrives the pass should run.
    pub fn delay(&self, trigger: Trigger) -> Duration {
        match trigger {
            Trigger::AppStart => self.app_start_interval,
            Trigger::LocalDataModified => self.local_data_modified_interval,
            Trigger::Immediate => Duration::ZERO,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            app_start_interval: Duration::from_secs(30 * 60),
            standard_interval: Duration::from_secs(60 * 60),
            local_data_modified_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("MUSHAF_DATABASE_URL must not be empty")]
    EmptyDatabaseUrl,

    #[error("{name} must be a positive number of seconds, got {value:?}")]
    InvalidInterval { name: &'static str, value: String },
}
