//! Storage abstraction for persisting job records.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::data::Data;
use crate::core::request::JobRequest;
use crate::core::state::{FailureCause, JobState, StopReason};
use crate::core::types::{ExecutionId, JobId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Mutable execution record of a job, owned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier, shared with the request.
    pub id: JobId,
    /// Current request. Replaced in place by updates.
    pub request: JobRequest,
    /// Lifecycle state.
    pub state: JobState,
    /// Last progress reported by the running worker. Cleared on leaving `Running`.
    pub progress: Data,
    /// Output of the last successful run.
    pub output: Data,
    /// Why the last execution was halted.
    pub stop_reason: StopReason,
    /// Why the job failed, if it did.
    pub failure: Option<FailureCause>,
    /// Executions started in the current period.
    pub run_attempt_count: u32,
    /// Incremented each time the request is replaced or updated.
    pub generation: u32,
    /// Completed periods of a periodic job.
    pub period_count: u64,
    /// Jobs that must succeed before this one runs, in chain order.
    pub prerequisites: Vec<JobId>,
    /// Jobs waiting on this one.
    pub dependents: Vec<JobId>,
    /// Unique work name the job is bound to.
    pub unique_name: Option<String>,
    /// Submission order.
    pub sequence: u64,
    /// Bumped on every persisted mutation.
    pub version: u64,
    /// When the job was submitted.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched.
    pub next_run_at: DateTime<Utc>,
    /// When the latest execution started.
    pub last_started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// Identity of the current execution while `Running`.
    pub execution_id: Option<ExecutionId>,
    /// Update waiting for the current execution to finish.
    pub pending_request: Option<JobRequest>,
}

impl JobRecord {
    /// Create a record for a newly submitted request.
    pub fn new(request: JobRequest, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: *request.id(),
            next_run_at: request.first_run_at(now),
            request,
            state: JobState::Enqueued,
            progress: Data::new(),
            output: Data::new(),
            stop_reason: StopReason::NotStopped,
            failure: None,
            run_attempt_count: 0,
            generation: 0,
            period_count: 0,
            prerequisites: Vec::new(),
            dependents: Vec::new(),
            unique_name: None,
            sequence,
            version: 0,
            enqueued_at: now,
            last_started_at: None,
            finished_at: None,
            updated_at: now,
            execution_id: None,
            pending_request: None,
        }
    }

    pub fn job_type(&self) -> &str {
        self.request.job_type()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_periodic(&self) -> bool {
        self.request.is_periodic()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.request.has_tag(tag)
    }

    /// Whether the given execution is the one currently running this record.
    pub fn is_running(&self, execution: ExecutionId) -> bool {
        self.state == JobState::Running && self.execution_id == Some(execution)
    }

    /// Mark the record as running a new execution.
    pub fn mark_running(&mut self, execution: ExecutionId, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.execution_id = Some(execution);
        self.run_attempt_count += 1;
        self.last_started_at = Some(now);
        self.stop_reason = StopReason::NotStopped;
        self.failure = None;
        self.progress = Data::new();
    }

    /// Mark the record as succeeded.
    pub fn mark_succeeded(&mut self, output: Data, now: DateTime<Utc>) {
        self.leave_running();
        self.state = JobState::Succeeded;
        self.output = output;
        self.finished_at = Some(now);
        self.pending_request = None;
    }

    /// Mark the record as failed.
    pub fn mark_failed(&mut self, cause: FailureCause, now: DateTime<Utc>) {
        self.leave_running();
        self.state = JobState::Failed;
        self.failure = Some(cause);
        self.finished_at = Some(now);
        self.pending_request = None;
    }

    /// Mark the record as cancelled.
    pub fn mark_cancelled(&mut self, reason: StopReason, now: DateTime<Utc>) {
        if self.state == JobState::Running {
            self.stop_reason = reason;
        }
        self.leave_running();
        self.state = JobState::Cancelled;
        self.finished_at = Some(now);
        self.pending_request = None;
    }

    /// Mark the record as blocked, pausing any execution.
    pub fn mark_blocked(&mut self, reason: StopReason) {
        self.stop_reason = reason;
        self.apply_pending_request();
        self.leave_running();
        self.state = JobState::Blocked;
    }

    /// Put the record back in the queue.
    pub fn mark_enqueued(&mut self, next_run_at: DateTime<Utc>) {
        self.apply_pending_request();
        self.leave_running();
        self.state = JobState::Enqueued;
        self.next_run_at = next_run_at;
    }

    /// Close the current period of a periodic job and enqueue the next one.
    pub fn start_next_period(&mut self, now: DateTime<Utc>) {
        self.apply_pending_request();
        let last_start = self.last_started_at.unwrap_or(now);
        let next = self.request.next_period_at(last_start).unwrap_or(now);
        self.leave_running();
        self.state = JobState::Enqueued;
        self.period_count += 1;
        self.run_attempt_count = 0;
        self.next_run_at = next;
    }

    fn apply_pending_request(&mut self) {
        if let Some(pending) = self.pending_request.take() {
            self.request = pending;
        }
    }

    fn leave_running(&mut self) {
        self.execution_id = None;
        self.progress = Data::new();
    }
}

/// Storage trait for persisting job records.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new record.
    async fn insert_record(&self, record: JobRecord) -> Result<(), StorageError>;

    /// Replace an existing record.
    async fn update_record(&self, record: JobRecord) -> Result<(), StorageError>;

    /// Get a record by ID.
    async fn get_record(&self, id: &JobId) -> Result<JobRecord, StorageError>;

    /// Delete a record by ID.
    async fn delete_record(&self, id: &JobId) -> Result<(), StorageError>;

    /// List all records in submission order.
    async fn list_records(&self) -> Result<Vec<JobRecord>, StorageError>;

    /// List records in a state, in submission order.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StorageError>;

    /// List records carrying a tag, in submission order.
    async fn list_by_tag(&self, tag: &str) -> Result<Vec<JobRecord>, StorageError>;

    /// List records bound to a unique name, in submission order.
    async fn list_by_unique_name(&self, name: &str) -> Result<Vec<JobRecord>, StorageError>;

    /// Highest submission sequence stored, or 0 when empty.
    async fn max_sequence(&self) -> Result<u64, StorageError>;
}
