//! Worker contract.
//!
//! A worker turns a [`WorkContext`] into a [`WorkResult`]. Workers are
//! registered by job type in a [`WorkerRegistry`] in one of three flavors:
//!
//! - [`Worker`]: async, stopped by dropping the future at its next await
//! - [`BlockingWorker`]: runs on the blocking pool and polls
//!   [`WorkContext::is_stopped`]
//! - [`RemoteWorker`]: runs in a child process spoken to over JSON lines
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use deferq::{Data, WorkContext, WorkResult, Worker};
//!
//! struct Upload;
//!
//! #[async_trait]
//! impl Worker for Upload {
//!     async fn do_work(&self, ctx: WorkContext) -> WorkResult {
//!         match ctx.input().get_str("key") {
//!             Some(key) => WorkResult::Success(Data::new().with("uploaded", key)),
//!             None => WorkResult::Failure("missing key".into()),
//!         }
//!     }
//! }
//! ```

mod registry;
pub(crate) mod remote;
pub(crate) mod runner;

pub use registry::{WorkerKind, WorkerRegistry};
pub use remote::{MAX_REMOTE_MESSAGE_BYTES, RemoteError, RemoteWorker, RemoteWorkerBuilder, serve, serve_stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::core::data::Data;
use crate::core::state::StopReason;
use crate::core::types::JobId;

/// Outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum WorkResult {
    /// The work completed, with its output.
    Success(Data),
    /// The work failed permanently.
    Failure(String),
    /// The work should be retried after the backoff delay.
    Retry,
}

impl WorkResult {
    /// A success with empty output.
    pub fn success() -> Self {
        WorkResult::Success(Data::new())
    }
}

/// Async worker.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult;
}

/// Synchronous worker, run on the blocking thread pool.
///
/// Long-running implementations should check
/// [`WorkContext::is_stopped`] and return early once it is set.
pub trait BlockingWorker: Send + Sync {
    fn do_work(&self, ctx: WorkContext) -> WorkResult;
}

/// Receives progress updates from a running worker.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<dyn Fn(Data) + Send + Sync>,
}

impl ProgressSink {
    /// A sink that drops every update.
    pub fn noop() -> Self {
        Self::from_fn(|_| {})
    }

    pub fn from_fn(f: impl Fn(Data) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Publish progress. The last update wins.
    pub fn set(&self, progress: Data) {
        (self.inner)(progress);
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

/// Cooperative stop request delivered to a running worker.
///
/// The first reason given wins; later calls to [`stop`](Self::stop) only
/// re-signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the worker was stopped, or `NotStopped`.
    pub fn reason(&self) -> StopReason {
        self.reason.get().copied().unwrap_or_default()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// Everything a worker receives for one execution.
#[derive(Debug, Clone)]
pub struct WorkContext {
    job_id: JobId,
    job_type: String,
    input: Data,
    tags: BTreeSet<String>,
    run_attempt_count: u32,
    generation: u32,
    progress: ProgressSink,
    stop: StopSignal,
}

impl WorkContext {
    pub fn new(job_id: JobId, job_type: impl Into<String>, input: Data) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            input,
            tags: BTreeSet::new(),
            run_attempt_count: 1,
            generation: 0,
            progress: ProgressSink::noop(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_run_attempt_count(mut self, count: u32) -> Self {
        self.run_attempt_count = count;
        self
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Input payload, with prerequisite outputs merged in.
    pub fn input(&self) -> &Data {
        &self.input
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Executions started in the current period, this one included.
    pub fn run_attempt_count(&self) -> u32 {
        self.run_attempt_count
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn set_progress(&self, progress: Data) {
        self.progress.set(progress);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop.reason()
    }

    /// Resolves once the scheduler asks the worker to stop.
    pub async fn stopped(&self) {
        self.stop.stopped().await;
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }
}
