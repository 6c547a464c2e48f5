//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the scheduler and for
//! job requests.

mod builder;
mod error;
mod yaml;

pub use builder::{LoadedRequest, RequestConfigBuilder, load_requests_from_directory};
pub use error::ConfigError;
pub use yaml::{
    BackoffConfig, ConstraintConfig, ExpeditedConfig, PeriodicConfig, RequestConfig,
    SchedulerConfig, StorageConfig, UniqueConfig, YamlLoader,
};
