//! Immutable job requests and their builder.
//!
//! A [`JobRequest`] describes what to run (a job type name and an input
//! payload) and when it may run (constraints, delays, periodicity). Requests
//! are validated once by [`JobRequestBuilder::build`]; out-of-range timing
//! values are clamped with a warning, contradictory settings are rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use super::backoff::{BackoffPolicy, serde_millis, serde_millis_opt};
use super::clock;
use super::constraints::ConstraintSet;
use super::data::{Data, DataError};
use super::merger::InputMerger;
use super::types::JobId;

/// Smallest repeat interval for periodic work.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Smallest flex window for periodic work.
pub const MIN_PERIODIC_FLEX: Duration = Duration::from_secs(5 * 60);

/// Errors produced when building a request.
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    /// The job type name is empty.
    #[error("job type must not be empty")]
    EmptyJobType,

    /// Expedited work cannot repeat.
    #[error("expedited requests cannot be periodic")]
    ExpeditedPeriodic,

    /// Expedited work cannot be delayed.
    #[error("expedited requests cannot have an initial delay")]
    ExpeditedDelayed,

    /// The input payload is invalid.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] DataError),
}

/// What happens to an expedited request once the quota is used up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfQuotaPolicy {
    /// Run as ordinary work.
    #[default]
    RunAsNonExpedited,
    /// Fail the request.
    Drop,
}

/// How a submission resolves against existing work under the same unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Keep existing unfinished work and ignore the new request.
    Keep,
    /// Cancel existing unfinished work and insert the new request.
    Replace,
    /// Run the new request after the existing work.
    Append,
    /// Append, unless existing work failed or was cancelled, then replace.
    AppendOrReplace,
    /// Update existing unfinished work in place.
    Update,
}

/// Whether a request runs once or repeatedly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Periodicity {
    #[default]
    OneShot,
    Periodic {
        #[serde(with = "serde_millis")]
        interval: Duration,
        /// Window at the end of each interval during which the job may run.
        #[serde(default, with = "serde_millis_opt")]
        flex: Option<Duration>,
    },
}

impl Periodicity {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Periodicity::Periodic { .. })
    }
}

/// Immutable specification of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    id: JobId,
    job_type: String,
    input: Data,
    constraints: ConstraintSet,
    backoff: BackoffPolicy,
    #[serde(with = "serde_millis")]
    initial_delay: Duration,
    tags: BTreeSet<String>,
    periodicity: Periodicity,
    expedited: Option<OutOfQuotaPolicy>,
    max_retries: Option<u32>,
    merger: InputMerger,
}

impl JobRequest {
    /// Start building a request for a job type.
    pub fn builder(job_type: impl Into<String>) -> JobRequestBuilder {
        JobRequestBuilder::new(job_type)
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn input(&self) -> &Data {
        &self.input
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn periodicity(&self) -> &Periodicity {
        &self.periodicity
    }

    pub fn is_periodic(&self) -> bool {
        self.periodicity.is_periodic()
    }

    /// Out-of-quota policy if the request is expedited.
    pub fn expedited(&self) -> Option<OutOfQuotaPolicy> {
        self.expedited
    }

    pub fn is_expedited(&self) -> bool {
        self.expedited.is_some()
    }

    /// Per-request retry limit, overriding the scheduler default.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn input_merger(&self) -> InputMerger {
        self.merger
    }

    /// The same request under another identity.
    pub(crate) fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// When the first run of this request may start.
    pub fn first_run_at(&self, enqueued_at: DateTime<Utc>) -> DateTime<Utc> {
        let start = clock::add(enqueued_at, self.initial_delay);
        match self.periodicity {
            Periodicity::Periodic {
                interval,
                flex: Some(flex),
            } => clock::add(start, interval.saturating_sub(flex)),
            _ => start,
        }
    }

    /// When the period after one started at `last_started_at` may start.
    ///
    /// One-shot requests have no next period and return `None`.
    pub fn next_period_at(&self, last_started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.periodicity {
            Periodicity::OneShot => None,
            Periodicity::Periodic { interval, flex } => {
                let wait = interval.saturating_sub(flex.unwrap_or(Duration::ZERO));
                Some(clock::add(last_started_at, wait))
            }
        }
    }
}

/// Builder for [`JobRequest`].
#[derive(Debug, Clone)]
pub struct JobRequestBuilder {
    id: Option<JobId>,
    job_type: String,
    input: Data,
    constraints: ConstraintSet,
    backoff: BackoffPolicy,
    initial_delay: Duration,
    tags: BTreeSet<String>,
    periodicity: Periodicity,
    expedited: Option<OutOfQuotaPolicy>,
    max_retries: Option<u32>,
    merger: InputMerger,
}

impl JobRequestBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            input: Data::new(),
            constraints: ConstraintSet::none(),
            backoff: BackoffPolicy::default(),
            initial_delay: Duration::ZERO,
            tags: BTreeSet::new(),
            periodicity: Periodicity::OneShot,
            expedited: None,
            max_retries: None,
            merger: InputMerger::default(),
        }
    }

    /// Use a fixed id instead of a random one.
    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn input(mut self, input: Data) -> Self {
        self.input = input;
        self
    }

    pub fn constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Repeat every `interval`.
    pub fn periodic(mut self, interval: Duration) -> Self {
        self.periodicity = Periodicity::Periodic {
            interval,
            flex: None,
        };
        self
    }

    /// Repeat every `interval`, running within the last `flex` of each one.
    pub fn periodic_with_flex(mut self, interval: Duration, flex: Duration) -> Self {
        self.periodicity = Periodicity::Periodic {
            interval,
            flex: Some(flex),
        };
        self
    }

    /// Request priority dispatch.
    pub fn expedited(mut self, policy: OutOfQuotaPolicy) -> Self {
        self.expedited = Some(policy);
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn input_merger(mut self, merger: InputMerger) -> Self {
        self.merger = merger;
        self
    }

    /// Validate and build the request.
    pub fn build(self) -> Result<JobRequest, RequestError> {
        if self.job_type.trim().is_empty() {
            return Err(RequestError::EmptyJobType);
        }
        if self.expedited.is_some() {
            if self.periodicity.is_periodic() {
                return Err(RequestError::ExpeditedPeriodic);
            }
            if !self.initial_delay.is_zero() {
                return Err(RequestError::ExpeditedDelayed);
            }
        }
        self.input.ensure_within_limit()?;

        Ok(JobRequest {
            id: self.id.unwrap_or_default(),
            periodicity: clamp_periodicity(self.periodicity),
            backoff: self.backoff.clamped(),
            job_type: self.job_type,
            input: self.input,
            constraints: self.constraints,
            initial_delay: self.initial_delay,
            tags: self.tags,
            expedited: self.expedited,
            max_retries: self.max_retries,
            merger: self.merger,
        })
    }
}

fn clamp_periodicity(periodicity: Periodicity) -> Periodicity {
    let Periodicity::Periodic { interval, flex } = periodicity else {
        return periodicity;
    };

    let clamped_interval = interval.max(MIN_PERIODIC_INTERVAL);
    if clamped_interval != interval {
        tracing::warn!(
            requested = ?interval,
            applied = ?clamped_interval,
            "Repeat interval below minimum, clamping"
        );
    }

    let clamped_flex = flex.map(|f| {
        let clamped = f.clamp(MIN_PERIODIC_FLEX, clamped_interval);
        if clamped != f {
            tracing::warn!(requested = ?f, applied = ?clamped, "Flex window out of range, clamping");
        }
        clamped
    });

    Periodicity::Periodic {
        interval: clamped_interval,
        flex: clamped_flex,
    }
}
