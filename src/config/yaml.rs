//! YAML configuration parsing.
//!
//! Parses scheduler settings and job request definitions from YAML files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::backoff::BackoffKind;
use crate::core::constraints::NetworkType;
use crate::core::merger::InputMerger;
use crate::core::request::{ExistingWorkPolicy, OutOfQuotaPolicy};

/// Scheduler configuration (deferq.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker slots.
    pub max_concurrent_workers: usize,
    /// Timer tick of the run loop in milliseconds.
    pub tick_interval_ms: u64,
    /// Retry limit for requests that do not set one.
    pub max_retries: u32,
    /// Cap on backoff delays in seconds.
    pub max_backoff_secs: u64,
    /// Time a stopped worker gets to return, in seconds.
    pub stop_grace_period_secs: u64,
    /// Execution time budget in seconds.
    pub max_execution_time_secs: u64,
    /// Graceful shutdown timeout in seconds.
    pub shutdown_timeout_secs: u64,
    /// Default timeout for remote workers in seconds.
    pub remote_timeout_secs: u64,
    /// Expedited quota.
    pub expedited: ExpeditedConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Default log filter for the CLI.
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            tick_interval_ms: 1000,
            max_retries: 10,
            max_backoff_secs: 5 * 60 * 60,
            stop_grace_period_secs: 10,
            max_execution_time_secs: 10 * 60,
            shutdown_timeout_secs: 30,
            remote_timeout_secs: 60,
            expedited: ExpeditedConfig::default(),
            storage: StorageConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// Expedited quota configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpeditedConfig {
    /// Expedited starts allowed per window.
    pub max_per_window: usize,
    /// Length of the rolling window in seconds.
    pub window_secs: u64,
}

impl Default for ExpeditedConfig {
    fn default() -> Self {
        Self {
            max_per_window: 4,
            window_secs: 10 * 60,
        }
    }
}

impl ExpeditedConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Job request configuration from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Registered worker name.
    pub job_type: String,
    /// Input payload. Values must be primitives or arrays of one primitive kind.
    #[serde(default)]
    pub input: BTreeMap<String, serde_yaml::Value>,
    /// Constraints on running.
    #[serde(default)]
    pub constraints: ConstraintConfig,
    /// Retry backoff.
    pub backoff: Option<BackoffConfig>,
    /// Delay before the first run in seconds.
    #[serde(default)]
    pub initial_delay_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Repeat schedule.
    pub periodic: Option<PeriodicConfig>,
    /// Run as expedited work with the given out-of-quota policy.
    pub expedited: Option<OutOfQuotaPolicy>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub input_merger: InputMerger,
    /// Unique work binding.
    pub unique: Option<UniqueConfig>,
}

/// Constraint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub network: NetworkType,
    pub charging: bool,
    pub battery_not_low: bool,
    pub storage_not_low: bool,
    pub device_idle: bool,
}

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub policy: BackoffKind,
    /// Base delay in seconds.
    pub delay_secs: u64,
}

/// Periodic schedule configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    pub interval_secs: u64,
    pub flex_secs: Option<u64>,
}

/// Unique work configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConfig {
    pub name: String,
    pub policy: ExistingWorkPolicy,
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load scheduler configuration from a file.
    pub fn load_scheduler_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        let config: SchedulerConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_scheduler_config(&config)?;
        Ok(config)
    }

    /// Parse scheduler configuration from a YAML string.
    pub fn parse_scheduler_config(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
        let config: SchedulerConfig = serde_yaml::from_str(yaml)?;
        Self::validate_scheduler_config(&config)?;
        Ok(config)
    }

    /// Load a request configuration from a file.
    pub fn load_request_config(path: impl AsRef<Path>) -> Result<RequestConfig, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        let config: RequestConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_request_config(&config)?;
        Ok(config)
    }

    /// Parse a request configuration from a YAML string.
    pub fn parse_request_config(yaml: &str) -> Result<RequestConfig, ConfigError> {
        let config: RequestConfig = serde_yaml::from_str(yaml)?;
        Self::validate_request_config(&config)?;
        Ok(config)
    }

    fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
        if config.max_concurrent_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_workers cannot be zero".into(),
            ));
        }
        if config.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_ms cannot be zero".into(),
            ));
        }
        if config.expedited.window_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "expedited.window_secs cannot be zero".into(),
            ));
        }
        if let StorageConfig::Sqlite { path } = &config.storage
            && path.is_empty()
        {
            return Err(ConfigError::MissingField("storage.path".into()));
        }
        Ok(())
    }

    fn validate_request_config(config: &RequestConfig) -> Result<(), ConfigError> {
        if config.job_type.trim().is_empty() {
            return Err(ConfigError::MissingField("job_type".into()));
        }

        if let Some(periodic) = &config.periodic {
            if periodic.interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "periodic.interval_secs cannot be zero".into(),
                ));
            }
            if periodic.flex_secs.is_some_and(|flex| flex > periodic.interval_secs) {
                return Err(ConfigError::InvalidConfig(
                    "periodic.flex_secs cannot exceed interval_secs".into(),
                ));
            }
        }

        if let Some(unique) = &config.unique
            && unique.name.is_empty()
        {
            return Err(ConfigError::MissingField("unique.name".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for tag in &config.tags {
            if !seen.insert(tag) {
                return Err(ConfigError::InvalidConfig(format!("duplicate tag: {}", tag)));
            }
        }

        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })
}
