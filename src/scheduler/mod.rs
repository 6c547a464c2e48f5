//! Scheduler engine for job execution.
//!
//! This module provides the run loop that dispatches stored jobs onto
//! workers, supervises executions and recovers from interruptions.

mod dispatch;
mod engine;
mod handle;
mod quota;
mod types;

pub use dispatch::{DispatchPlan, PlannedRun, plan_dispatch};
pub use engine::{DEFAULT_MAX_CONCURRENT_WORKERS, DEFAULT_MAX_RETRIES, Scheduler};
pub use handle::SchedulerHandle;
pub use quota::{DEFAULT_EXPEDITED_PER_WINDOW, DEFAULT_EXPEDITED_WINDOW};
pub use types::{SchedulerError, SchedulerState};
