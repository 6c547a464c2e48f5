//! Constraint integration tests.
//!
//! Tests that verify jobs wait for their constraints, stop when a constraint
//! is lost mid-run and resume once it holds again.

use deferq::testing::{EchoWorker, GatedWorker, TestHarness};
use deferq::{
    ConstraintSet, DeviceSignals, Event, JobRequest, JobState, NetworkStatus, NetworkType,
    StopReason, WorkResult,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::RecordingHandler;

fn charging_only() -> JobRequest {
    JobRequest::builder("upload")
        .constraints(ConstraintSet::none().with_charging(true))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_job_waits_for_constraints() {
    let h = TestHarness::new()
        .with_signals(DeviceSignals::default())
        .with_worker("upload", EchoWorker)
        .start();

    let id = h.store.submit(charging_only()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.run_attempt_count, 0);

    h.signals.update(|s| s.charging = true);
    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_network_type_is_matched() {
    let metered = DeviceSignals::default().with_network(Some(NetworkStatus {
        metered: true,
        roaming: false,
    }));
    let h = TestHarness::new()
        .with_signals(metered)
        .with_worker("upload", EchoWorker)
        .start();

    let unmetered = h
        .store
        .submit(
            JobRequest::builder("upload")
                .constraints(ConstraintSet::none().with_network(NetworkType::Unmetered))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let connected = h
        .store
        .submit(
            JobRequest::builder("upload")
                .constraints(ConstraintSet::none().with_network(NetworkType::Connected))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    h.wait_for_state(&connected, JobState::Succeeded).await;
    let record = h.store.get(&unmetered).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);

    h.signals.update(|s| {
        s.network = Some(NetworkStatus {
            metered: false,
            roaming: false,
        })
    });
    h.wait_for_state(&unmetered, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_losing_a_constraint_stops_and_blocks_the_job() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("upload", gate.clone())
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(charging_only()).await.unwrap();
    h.wait_for_state(&id, JobState::Running).await;

    h.signals.update(|s| s.charging = false);
    let record = h.wait_for_state(&id, JobState::Blocked).await;
    assert_eq!(record.stop_reason, StopReason::ConstraintCharging);
    assert!(record.execution_id.is_none());

    h.signals.update(|s| s.charging = true);
    h.wait_for(&id, |r| r.state == JobState::Running && r.run_attempt_count == 2, "second run")
        .await;
    assert_eq!(gate.started(), 2);

    gate.release();
    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();

    let stopped = recorder
        .count(|e| {
            matches!(
                e,
                Event::JobStopped { reason: StopReason::ConstraintCharging, .. }
            )
        })
        .await;
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_constraints_can_be_forced() {
    let h = TestHarness::new()
        .with_signals(DeviceSignals::default())
        .with_worker("upload", EchoWorker)
        .start();

    let id = h.store.submit(charging_only()).await.unwrap();
    h.driver.set_all_constraints_met(&id).await.unwrap();

    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forced_constraints_cover_one_run() {
    let h = TestHarness::new()
        .with_signals(DeviceSignals::default())
        .with_worker("upload", EchoWorker)
        .start();

    let request = JobRequest::builder("upload")
        .constraints(ConstraintSet::none().with_charging(true))
        .periodic(Duration::from_secs(3600))
        .build()
        .unwrap();
    let id = h.store.submit(request).await.unwrap();
    h.driver.set_all_constraints_met(&id).await.unwrap();
    h.wait_for(&id, |r| r.period_count == 1, "first period").await;

    h.clock.advance(Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.period_count, 1);

    h.signals.update(|s| s.charging = true);
    h.wait_for(&id, |r| r.period_count == 2, "second period").await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paused_scheduler_starts_nothing() {
    let h = TestHarness::new().with_worker("upload", EchoWorker).start();

    h.handle.pause().await.unwrap();
    let id = h.store.submit(charging_only()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);

    h.handle.resume().await.unwrap();
    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}
