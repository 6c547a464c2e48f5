//! Request builder from YAML configuration.
//!
//! This module converts RequestConfig into JobRequest instances.

use std::path::Path;
use std::time::Duration;

use crate::core::backoff::{BackoffKind, BackoffPolicy};
use crate::core::constraints::ConstraintSet;
use crate::core::data::{Data, Value};
use crate::core::request::{ExistingWorkPolicy, JobRequest};

use super::error::ConfigError;
use super::yaml::{RequestConfig, YamlLoader};

/// A request read from configuration, with its unique work binding.
#[derive(Debug, Clone)]
pub struct LoadedRequest {
    pub request: JobRequest,
    pub unique: Option<(String, ExistingWorkPolicy)>,
}

/// Builder for creating JobRequests from YAML configuration.
pub struct RequestConfigBuilder;

impl RequestConfigBuilder {
    /// Build a JobRequest from a RequestConfig.
    pub fn build(config: RequestConfig) -> Result<LoadedRequest, ConfigError> {
        let mut input = Data::new();
        for (key, value) in &config.input {
            input.insert(key.clone(), Self::convert_value(key, value)?);
        }

        let constraints = ConstraintSet::none()
            .with_network(config.constraints.network)
            .with_charging(config.constraints.charging)
            .with_battery_not_low(config.constraints.battery_not_low)
            .with_storage_not_low(config.constraints.storage_not_low)
            .with_device_idle(config.constraints.device_idle);

        let mut builder = JobRequest::builder(&config.job_type)
            .input(input)
            .constraints(constraints)
            .initial_delay(Duration::from_secs(config.initial_delay_secs))
            .tags(config.tags.iter())
            .input_merger(config.input_merger);

        if let Some(backoff) = &config.backoff {
            let delay = Duration::from_secs(backoff.delay_secs);
            builder = builder.backoff(match backoff.policy {
                BackoffKind::Linear => BackoffPolicy::linear(delay),
                BackoffKind::Exponential => BackoffPolicy::exponential(delay),
            });
        }

        if let Some(periodic) = &config.periodic {
            let interval = Duration::from_secs(periodic.interval_secs);
            builder = match periodic.flex_secs {
                Some(flex) => builder.periodic_with_flex(interval, Duration::from_secs(flex)),
                None => builder.periodic(interval),
            };
        }

        if let Some(policy) = config.expedited {
            builder = builder.expedited(policy);
        }

        if let Some(max) = config.max_retries {
            builder = builder.max_retries(max);
        }

        let request = builder.build()?;
        let unique = config.unique.map(|unique| (unique.name, unique.policy));

        Ok(LoadedRequest { request, unique })
    }

    /// Convert a YAML value into a payload value.
    fn convert_value(key: &str, value: &serde_yaml::Value) -> Result<Value, ConfigError> {
        match value {
            serde_yaml::Value::Sequence(items) => {
                let items = items
                    .iter()
                    .map(|item| Self::convert_scalar(key, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::array(items)
                    .map_err(|e| ConfigError::InvalidConfig(format!("input '{}': {}", key, e)))
            }
            other => Self::convert_scalar(key, other),
        }
    }

    fn convert_scalar(key: &str, value: &serde_yaml::Value) -> Result<Value, ConfigError> {
        match value {
            serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(d) = n.as_f64() {
                    Ok(Value::Double(d))
                } else {
                    Err(ConfigError::InvalidConfig(format!(
                        "input '{}': number out of range",
                        key
                    )))
                }
            }
            serde_yaml::Value::String(s) => Ok(Value::String(s.clone())),
            _ => Err(ConfigError::InvalidConfig(format!(
                "input '{}' must be a bool, number, string or list of one of those",
                key
            ))),
        }
    }
}

/// Load all request configurations from a directory, sorted by file name.
pub fn load_requests_from_directory(
    dir: impl AsRef<Path>,
) -> Result<Vec<LoadedRequest>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let dir_error = |source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(dir_error)? {
        let path = entry.map_err(dir_error)?.path();

        // Only process .yaml and .yml files
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut requests = Vec::with_capacity(paths.len());
    for path in paths {
        let config = YamlLoader::load_request_config(&path)?;
        requests.push(RequestConfigBuilder::build(config)?);
    }

    Ok(requests)
}
