//! One-shot job lifecycle tests.
//!
//! Tests that verify jobs move from submission to a terminal state through
//! retries, failures, cancellation, delays and slot limits.

use deferq::testing::{EchoWorker, FailingWorker, GatedWorker, PanickingWorker, ScriptedWorker, TestHarness};
use deferq::{
    BackoffPolicy, Clock, Data, Event, FailureCause, JobRequest, JobState, OutOfQuotaPolicy,
    StopReason, WorkResult,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{RecordingHandler, request};

#[tokio::test]
async fn test_job_runs_to_success_with_output() {
    let h = TestHarness::new().with_worker("echo", EchoWorker).start();

    let input = Data::new().with("file", "photo.jpg").with("size", 42);
    let id = h
        .store
        .submit(JobRequest::builder("echo").input(input.clone()).build().unwrap())
        .await
        .unwrap();

    let record = h.wait_for_state(&id, JobState::Succeeded).await;
    assert_eq!(record.output, input);
    assert_eq!(record.run_attempt_count, 1);
    assert!(record.finished_at.is_some());
    assert!(record.execution_id.is_none());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let worker = Arc::new(FailingWorker::retrying(2));
    let h = TestHarness::new()
        .with_shared_worker("flaky", worker.clone())
        .start();

    let id = h
        .store
        .submit(
            JobRequest::builder("flaky")
                .backoff(BackoffPolicy::linear(Duration::from_secs(30)))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let record = h
        .wait_for(
            &id,
            |r| r.state == JobState::Enqueued && r.run_attempt_count == 1,
            "first retry",
        )
        .await;
    let expected = h.clock.now() + chrono::Duration::seconds(30);
    assert_eq!(record.next_run_at, expected);

    // Nothing runs until the backoff has elapsed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.call_count(), 1);

    h.driver.advance(Duration::from_secs(30));
    let record = h
        .wait_for(
            &id,
            |r| r.state == JobState::Enqueued && r.run_attempt_count == 2,
            "second retry",
        )
        .await;
    let expected = h.clock.now() + chrono::Duration::seconds(60);
    assert_eq!(record.next_run_at, expected);

    h.driver.advance(Duration::from_secs(60));
    let record = h.wait_for_state(&id, JobState::Succeeded).await;
    assert_eq!(record.run_attempt_count, 3);
    assert_eq!(worker.call_count(), 3);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retries_exhausted() {
    let h = TestHarness::new()
        .with_worker("flaky", FailingWorker::retrying(u32::MAX))
        .start();

    let id = h
        .store
        .submit(JobRequest::builder("flaky").max_retries(1).build().unwrap())
        .await
        .unwrap();

    h.wait_for(
        &id,
        |r| r.state == JobState::Enqueued && r.run_attempt_count == 1,
        "first retry",
    )
    .await;
    h.driver.advance(Duration::from_secs(30));

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::RetriesExhausted { attempts: 2 })
    );

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_reported() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let h = TestHarness::new()
        .with_worker("upload", FailingWorker::always().with_message("disk full"))
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(request("upload")).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::Worker("disk full".to_string()))
    );
    assert_eq!(record.run_attempt_count, 1);

    h.shutdown().await.unwrap();

    let failed = recorder
        .count(|e| matches!(e, Event::JobFailed { job_id, .. } if *job_id == id))
        .await;
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_unknown_job_type_fails() {
    let h = TestHarness::new().start();

    let id = h.store.submit(request("missing")).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::UnknownJobType("missing".to_string()))
    );

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_worker_fails_the_job() {
    let h = TestHarness::new()
        .with_blocking_worker("boom", PanickingWorker)
        .start();

    let id = h.store.submit(request("boom")).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::Panicked("worker exploded".to_string()))
    );

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_job() {
    let recorder = RecordingHandler::new();
    let bus = recorder.bus().await;
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("slow", gate.clone())
        .start_with(|s| s.with_event_bus(bus));

    let id = h.store.submit(request("slow")).await.unwrap();
    h.wait_for_state(&id, JobState::Running).await;

    assert_eq!(h.store.cancel(&id).await.unwrap(), 1);

    let record = h.wait_for_state(&id, JobState::Cancelled).await;
    assert_eq!(record.stop_reason, StopReason::CancelledByCaller);

    // A late result must not resurrect the record.
    gate.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Cancelled);

    h.shutdown().await.unwrap();

    let stopped = recorder
        .count(|e| {
            matches!(
                e,
                Event::JobStopped { reason: StopReason::CancelledByCaller, .. }
            )
        })
        .await;
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_initial_delay_is_honored() {
    let h = TestHarness::new().with_worker("echo", EchoWorker).start();

    let id = h
        .store
        .submit(
            JobRequest::builder("echo")
                .initial_delay(Duration::from_secs(3600))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);

    h.driver.advance(Duration::from_secs(3600));
    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_initial_delay_can_be_forced() {
    let h = TestHarness::new().with_worker("echo", EchoWorker).start();

    let id = h
        .store
        .submit(
            JobRequest::builder("echo")
                .initial_delay(Duration::from_secs(3600))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    h.driver.set_initial_delay_met(&id).await.unwrap();
    h.wait_for_state(&id, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_slots_limit_concurrency() {
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("slow", gate.clone())
        .start_with(|s| s.with_max_concurrent_workers(1));

    let first = h.store.submit(request("slow")).await.unwrap();
    let second = h.store.submit(request("slow")).await.unwrap();

    h.wait_for_state(&first, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get(&second).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(gate.started(), 1);

    gate.release();
    h.wait_for_state(&first, JobState::Succeeded).await;
    h.wait_for_state(&second, JobState::Running).await;

    gate.release();
    h.wait_for_state(&second, JobState::Succeeded).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expedited_work_starts_first() {
    let worker = Arc::new(ScriptedWorker::new([WorkResult::success()]));
    let harness = TestHarness::new().with_shared_worker("send", worker.clone());

    let normal = harness.store().submit(request("send")).await.unwrap();
    let urgent = harness
        .store()
        .submit(
            JobRequest::builder("send")
                .expedited(OutOfQuotaPolicy::RunAsNonExpedited)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let h = harness.start_with(|s| s.with_max_concurrent_workers(1));
    h.wait_for_state(&normal, JobState::Succeeded).await;
    h.wait_for_state(&urgent, JobState::Succeeded).await;

    let order: Vec<_> = worker
        .contexts()
        .await
        .iter()
        .map(|ctx| *ctx.job_id())
        .collect();
    assert_eq!(order, vec![urgent, normal]);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expedited_over_quota_is_dropped() {
    let harness = TestHarness::new().with_worker("send", EchoWorker);

    let expedited = || {
        JobRequest::builder("send")
            .expedited(OutOfQuotaPolicy::Drop)
            .build()
            .unwrap()
    };
    let first = harness.store().submit(expedited()).await.unwrap();
    let second = harness.store().submit(expedited()).await.unwrap();

    let h = harness.start_with(|s| s.with_expedited_quota(1, Duration::from_secs(600)));

    h.wait_for_state(&first, JobState::Succeeded).await;
    let record = h.wait_for_state(&second, JobState::Failed).await;
    assert_eq!(record.failure, Some(FailureCause::QuotaExceeded));
    assert_eq!(record.stop_reason, StopReason::Quota);

    h.shutdown().await.unwrap();
}
