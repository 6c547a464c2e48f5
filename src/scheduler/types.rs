//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and the messages that flow
//! into the scheduler loop.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::data::Data;
use crate::core::types::{ExecutionId, JobId};
use crate::store::StoreError;
use crate::worker::runner::ExecutionOutcome;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused. Running executions continue, nothing new starts.
    Paused,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Run a dispatch cycle now.
    Wake { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}

/// Reports from running executions.
#[derive(Debug)]
pub(crate) enum ExecutionMessage {
    Progress {
        job_id: JobId,
        execution: ExecutionId,
        data: Data,
    },
    Finished {
        job_id: JobId,
        execution: ExecutionId,
        outcome: ExecutionOutcome,
    },
}
