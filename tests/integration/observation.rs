//! Observation integration tests.
//!
//! Tests that verify observers see state transitions and progress of
//! scheduled work, and that lifecycle events are emitted in order.

use deferq::testing::{EchoWorker, ProgressWorker, TestHarness};
use deferq::{Data, Event, JobRequest, JobState, WorkQuery};
use std::time::Duration;

use crate::common::{RecordingHandler, request};

#[tokio::test]
async fn test_observer_sees_progress_and_completion() {
    let steps = [Data::new().with("pct", 50), Data::new().with("pct", 100)];
    let harness = TestHarness::new().with_worker(
        "upload",
        ProgressWorker::new(steps, Duration::from_millis(50)),
    );

    let id = harness.store().submit(request("upload")).await.unwrap();
    let mut observer = harness.store().observe(id);
    let h = harness.start();

    let mut states = Vec::new();
    let mut progress = Vec::new();
    let observed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(record) = observer.next().await {
            if states.last() != Some(&record.state) {
                states.push(record.state);
            }
            if let Some(pct) = record.progress.get_int("pct")
                && progress.last() != Some(&pct)
            {
                progress.push(pct);
            }
            if record.is_finished() {
                return record;
            }
        }
        panic!("observer closed before the job finished");
    })
    .await
    .unwrap();

    assert_eq!(observed.state, JobState::Succeeded);
    assert!(observed.progress.is_empty());
    assert_eq!(
        states,
        vec![JobState::Enqueued, JobState::Running, JobState::Succeeded]
    );
    assert_eq!(progress, vec![50, 100]);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_observer_tracks_tagged_work() {
    let h = TestHarness::new().with_worker("echo", EchoWorker).start();
    let tagged = || JobRequest::builder("echo").tag("batch").build().unwrap();

    let mut observer = h.store.observe_query(WorkQuery::new().with_tags(["batch"]));
    let first = h.store.submit(tagged()).await.unwrap();
    let second = h.store.submit(tagged()).await.unwrap();
    h.store.submit(request("echo")).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(records) = observer.next().await {
            if records.len() == 2 && records.iter().all(|r| r.is_finished()) {
                return records;
            }
        }
        panic!("observer closed before the batch finished");
    })
    .await
    .unwrap();

    assert!(snapshot.iter().any(|r| r.id == first));
    assert!(snapshot.iter().any(|r| r.id == second));
    assert!(snapshot.iter().all(|r| r.state == JobState::Succeeded));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_follow_the_lifecycle() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let h = TestHarness::new()
        .with_worker("echo", EchoWorker)
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(request("echo")).await.unwrap();
    h.wait_for_state(&id, JobState::Succeeded).await;
    h.shutdown().await.unwrap();

    let events = recorder.events().await;
    let kinds: Vec<&str> = events
        .iter()
        .filter(|e| e.job_id() == &id)
        .map(|e| match e {
            Event::JobStarted { attempt, .. } => {
                assert_eq!(*attempt, 1);
                "started"
            }
            Event::JobSucceeded { .. } => "succeeded",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["started", "succeeded"]);
}
