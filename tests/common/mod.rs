//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use deferq::{Event, EventBus, EventHandler, JobId, JobRecord, JobRequest, JobState, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Event handler that records every event it sees.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    /// Create an event bus with this handler registered.
    pub async fn bus(self: &Arc<Self>) -> EventBus {
        let bus = EventBus::new();
        bus.register(self.clone()).await;
        bus
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A one-shot request with no options.
pub fn request(job_type: &str) -> JobRequest {
    JobRequest::builder(job_type).build().unwrap()
}

/// Wait for a job to reach an expected state, polling the store.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the state.
pub async fn wait_for_state(
    store: &JobStore,
    id: &JobId,
    expected: JobState,
    timeout: Duration,
) -> JobRecord {
    let start = tokio::time::Instant::now();
    loop {
        let record = store.get(id).await.unwrap().unwrap();
        if record.state == expected {
            return record;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {}, current state: {}",
                id, expected, record.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
