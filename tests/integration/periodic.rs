//! Periodic work integration tests.
//!
//! Tests that verify periodic jobs repeat on their interval, survive failed
//! periods and can be driven with the test driver.

use deferq::testing::{EchoWorker, FailingWorker, TestHarness};
use deferq::{Event, FailureCause, JobRequest, JobState};
use std::time::Duration;

use crate::common::RecordingHandler;

const HOUR: Duration = Duration::from_secs(3600);

fn hourly(job_type: &str) -> JobRequest {
    JobRequest::builder(job_type).periodic(HOUR).build().unwrap()
}

#[tokio::test]
async fn test_periodic_job_repeats_each_interval() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let h = TestHarness::new()
        .with_worker("refresh", EchoWorker)
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(hourly("refresh")).await.unwrap();

    let record = h.wait_for(&id, |r| r.period_count == 1, "first period").await;
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.run_attempt_count, 0);
    let started = record.last_started_at.unwrap();
    assert_eq!(record.next_run_at, started + chrono::Duration::hours(1));

    // The next period is not due yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.period_count, 1);

    h.driver.advance(HOUR);
    let record = h.wait_for(&id, |r| r.period_count == 2, "second period").await;
    assert!(!record.is_finished());

    h.shutdown().await.unwrap();

    let periods = recorder
        .count(|e| matches!(e, Event::PeriodCompleted { success: true, .. }))
        .await;
    assert_eq!(periods, 2);
    let succeeded = recorder
        .count(|e| matches!(e, Event::JobSucceeded { .. }))
        .await;
    assert_eq!(succeeded, 0);
}

#[tokio::test]
async fn test_failed_period_schedules_the_next_one() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let h = TestHarness::new()
        .with_worker("refresh", FailingWorker::new(1))
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(hourly("refresh")).await.unwrap();

    let record = h.wait_for(&id, |r| r.period_count == 1, "first period").await;
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(
        record.failure,
        Some(FailureCause::Worker("injected failure".to_string()))
    );

    h.driver.advance(HOUR);
    let record = h.wait_for(&id, |r| r.period_count == 2, "second period").await;
    assert_eq!(record.failure, None);

    h.shutdown().await.unwrap();

    let failed_periods = recorder
        .count(|e| matches!(e, Event::PeriodCompleted { success: false, .. }))
        .await;
    assert_eq!(failed_periods, 1);
}

#[tokio::test]
async fn test_period_delay_can_be_forced() {
    let h = TestHarness::new().with_worker("refresh", EchoWorker).start();

    let id = h.store.submit(hourly("refresh")).await.unwrap();
    h.wait_for(&id, |r| r.period_count == 1, "first period").await;

    h.driver.set_period_delay_met(&id).await.unwrap();
    h.wait_for(&id, |r| r.period_count == 2, "forced period").await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_period_delay_rejects_one_shot_work() {
    let h = TestHarness::new().with_worker("refresh", EchoWorker).start();

    let id = h
        .store
        .submit(JobRequest::builder("refresh").build().unwrap())
        .await
        .unwrap();

    assert!(h.driver.set_period_delay_met(&id).await.is_err());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flex_window_delays_the_first_run() {
    let h = TestHarness::new().with_worker("refresh", EchoWorker).start();

    let id = h
        .store
        .submit(
            JobRequest::builder("refresh")
                .periodic_with_flex(HOUR, Duration::from_secs(900))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.period_count, 0);
    assert_eq!(record.state, JobState::Enqueued);

    h.driver.advance(Duration::from_secs(2700));
    h.wait_for(&id, |r| r.period_count == 1, "first period").await;

    h.shutdown().await.unwrap();
}
