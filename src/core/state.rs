//! Job lifecycle states, stop reasons and failure causes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its delay, constraints or a free worker slot.
    Enqueued,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed permanently.
    Failed,
    /// Cancelled by the caller or because a prerequisite did not succeed.
    Cancelled,
    /// Waiting on unfinished prerequisites or paused by a lost constraint.
    Blocked,
}

impl JobState {
    /// Whether the state is terminal.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// All states, in declaration order.
    pub fn all() -> [JobState; 6] {
        [
            JobState::Enqueued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Blocked,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Blocked => "blocked",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution was halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The job has not been stopped.
    #[default]
    NotStopped,
    /// Stopped for a reason that could not be determined, such as a process
    /// restart while the job was running.
    Unknown,
    CancelledByCaller,
    /// Preempted to make room for other work or during shutdown.
    Preempted,
    /// Exceeded the maximum execution time.
    Timeout,
    DeviceState,
    ConstraintBatteryNotLow,
    ConstraintCharging,
    ConstraintConnectivity,
    ConstraintDeviceIdle,
    ConstraintStorageNotLow,
    /// Expedited quota exhausted.
    Quota,
    BackgroundRestriction,
    AppStandby,
    User,
    SystemProcessing,
}

impl StopReason {
    /// Whether this reason reports a constraint that stopped holding.
    pub fn is_constraint(self) -> bool {
        matches!(
            self,
            StopReason::ConstraintBatteryNotLow
                | StopReason::ConstraintCharging
                | StopReason::ConstraintConnectivity
                | StopReason::ConstraintDeviceIdle
                | StopReason::ConstraintStorageNotLow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::NotStopped => "not_stopped",
            StopReason::Unknown => "unknown",
            StopReason::CancelledByCaller => "cancelled_by_caller",
            StopReason::Preempted => "preempted",
            StopReason::Timeout => "timeout",
            StopReason::DeviceState => "device_state",
            StopReason::ConstraintBatteryNotLow => "constraint_battery_not_low",
            StopReason::ConstraintCharging => "constraint_charging",
            StopReason::ConstraintConnectivity => "constraint_connectivity",
            StopReason::ConstraintDeviceIdle => "constraint_device_idle",
            StopReason::ConstraintStorageNotLow => "constraint_storage_not_low",
            StopReason::Quota => "quota",
            StopReason::BackgroundRestriction => "background_restriction",
            StopReason::AppStandby => "app_standby",
            StopReason::User => "user",
            StopReason::SystemProcessing => "system_processing",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    /// The worker returned a failure.
    Worker(String),
    /// The worker kept asking for retries past the configured limit.
    RetriesExhausted { attempts: u32 },
    /// A remote worker crashed, disconnected, timed out or replied with
    /// something that could not be decoded.
    RemoteExecutionLost(String),
    /// Prerequisite outputs could not be merged into an input.
    MergeConflict(String),
    /// The execution exceeded its time budget or ignored a stop request.
    Timeout,
    /// An expedited job was dropped because the quota was exhausted.
    QuotaExceeded,
    /// No worker is registered for the job type.
    UnknownJobType(String),
    /// The worker panicked.
    Panicked(String),
    /// Worker output exceeded the payload limit.
    OutputTooLarge,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Worker(reason) => write!(f, "worker failure: {}", reason),
            FailureCause::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            FailureCause::RemoteExecutionLost(detail) => {
                write!(f, "remote execution lost: {}", detail)
            }
            FailureCause::MergeConflict(detail) => write!(f, "merge conflict: {}", detail),
            FailureCause::Timeout => f.write_str("timed out"),
            FailureCause::QuotaExceeded => f.write_str("expedited quota exceeded"),
            FailureCause::UnknownJobType(name) => write!(f, "unknown job type: {}", name),
            FailureCause::Panicked(detail) => write!(f, "worker panicked: {}", detail),
            FailureCause::OutputTooLarge => f.write_str("worker output too large"),
        }
    }
}
