//! Lifecycle events and event handling.
//!
//! The scheduler emits an [`Event`] for every execution transition to the
//! handlers registered on its [`EventBus`]. Handlers run after the dispatch
//! cycle that produced the event has released the store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::state::{FailureCause, StopReason};
use crate::core::types::JobId;

/// Lifecycle events emitted during execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// An execution has started.
    JobStarted {
        job_id: JobId,
        job_type: String,
        /// Attempt number within the current period (1-indexed).
        attempt: u32,
        timestamp: Instant,
    },

    /// A one-shot job succeeded.
    JobSucceeded {
        job_id: JobId,
        job_type: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// A one-shot job failed permanently.
    JobFailed {
        job_id: JobId,
        job_type: String,
        cause: FailureCause,
        timestamp: Instant,
    },

    /// An execution asked to be retried and was re-enqueued.
    JobRetrying {
        job_id: JobId,
        job_type: String,
        /// The attempt that just finished.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
        timestamp: Instant,
    },

    /// A running execution was stopped.
    JobStopped {
        job_id: JobId,
        job_type: String,
        reason: StopReason,
        timestamp: Instant,
    },

    /// A period of a periodic job finished and the next one is enqueued.
    PeriodCompleted {
        job_id: JobId,
        job_type: String,
        /// Number of periods completed so far.
        period: u64,
        success: bool,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of this event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobStarted { timestamp, .. }
            | Event::JobSucceeded { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::JobRetrying { timestamp, .. }
            | Event::JobStopped { timestamp, .. }
            | Event::PeriodCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::JobStarted { job_id, .. }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobRetrying { job_id, .. }
            | Event::JobStopped { job_id, .. }
            | Event::PeriodCompleted { job_id, .. } => job_id,
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(job_id: JobId, job_type: impl Into<String>, attempt: u32) -> Self {
        Event::JobStarted {
            job_id,
            job_type: job_type.into(),
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobSucceeded event.
    pub fn job_succeeded(job_id: JobId, job_type: impl Into<String>, duration: Duration) -> Self {
        Event::JobSucceeded {
            job_id,
            job_type: job_type.into(),
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFailed event.
    pub fn job_failed(job_id: JobId, job_type: impl Into<String>, cause: FailureCause) -> Self {
        Event::JobFailed {
            job_id,
            job_type: job_type.into(),
            cause,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRetrying event.
    pub fn job_retrying(
        job_id: JobId,
        job_type: impl Into<String>,
        attempt: u32,
        delay: Duration,
    ) -> Self {
        Event::JobRetrying {
            job_id,
            job_type: job_type.into(),
            attempt,
            delay,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobStopped event.
    pub fn job_stopped(job_id: JobId, job_type: impl Into<String>, reason: StopReason) -> Self {
        Event::JobStopped {
            job_id,
            job_type: job_type.into(),
            reason,
            timestamp: Instant::now(),
        }
    }

    /// Create a PeriodCompleted event.
    pub fn period_completed(
        job_id: JobId,
        job_type: impl Into<String>,
        period: u64,
        success: bool,
    ) -> Self {
        Event::PeriodCompleted {
            job_id,
            job_type: job_type.into(),
            period,
            success,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// User-visible surface shown while expedited work runs.
///
/// Called once per expedited execution start.
pub trait ForegroundNotifier: Send + Sync {
    fn expedited_started(&self, job_id: &JobId, job_type: &str);
}
