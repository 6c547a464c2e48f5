//! Backoff policy applied between retries.
//!
//! Supports linear and exponential growth from a base delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest allowed base delay.
pub const MIN_BACKOFF: Duration = Duration::from_secs(10);

/// Largest delay ever applied, and the default cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// Base delay used when a request does not set one.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// How the delay grows with each retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * n`
    Linear,
    /// `base * 2^(n-1)`
    #[default]
    Exponential,
}

/// Backoff policy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,

    /// Delay before the first retry.
    #[serde(with = "serde_millis")]
    pub delay: Duration,
}

impl BackoffPolicy {
    /// Linear backoff from `delay`.
    pub fn linear(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            delay,
        }
    }

    /// Exponential backoff from `delay`.
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Clamp the base delay into `[MIN_BACKOFF, MAX_BACKOFF]`.
    pub fn clamped(self) -> Self {
        let delay = self.delay.clamp(MIN_BACKOFF, MAX_BACKOFF);
        if delay != self.delay {
            tracing::warn!(
                requested = ?self.delay,
                applied = ?delay,
                "Backoff delay out of range, clamping"
            );
        }
        Self { delay, ..self }
    }

    /// Delay before retry number `retry` (1 for the first retry), capped at `cap`.
    pub fn delay_for(&self, retry: u32, cap: Duration) -> Duration {
        let retry = retry.max(1);
        let delay = match self.kind {
            BackoffKind::Linear => self.delay.checked_mul(retry),
            BackoffKind::Exponential => 2u32
                .checked_pow(retry - 1)
                .and_then(|factor| self.delay.checked_mul(factor)),
        };
        delay.map_or(cap, |d| d.min(cap))
    }
}

impl Default for BackoffPolicy {
    /// Exponential from 30 seconds.
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF)
    }
}

/// Serde helper for Duration serialization as whole milliseconds.
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as [`serde_millis`] for optional durations.
pub(crate) mod serde_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
