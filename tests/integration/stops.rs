//! Stop handling integration tests.
//!
//! Tests that verify a blocking worker which ignores its stop signal loses
//! its slot after the grace period, that its job fails with a timeout, and
//! that the job never runs twice at the same time.

use deferq::testing::{EchoWorker, TestHarness};
use deferq::{
    BlockingWorker, ConstraintSet, FailureCause, JobRequest, JobState, StopReason, WorkContext,
    WorkResult,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const GRACE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Stats {
    starts: AtomicU32,
    active: AtomicU32,
    peak: AtomicU32,
}

/// Sleeps on its thread without looking at the stop signal.
struct StubbornWorker {
    sleep: Duration,
    stats: Arc<Stats>,
}

impl StubbornWorker {
    fn new(sleep: Duration) -> (Self, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        let worker = Self {
            sleep,
            stats: stats.clone(),
        };
        (worker, stats)
    }
}

impl BlockingWorker for StubbornWorker {
    fn do_work(&self, _ctx: WorkContext) -> WorkResult {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.sleep);
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        WorkResult::success()
    }
}

#[tokio::test]
async fn test_ignored_stop_after_constraint_loss_fails_with_timeout() {
    let (worker, stats) = StubbornWorker::new(Duration::from_millis(800));
    let h = TestHarness::new()
        .with_blocking_worker("upload", worker)
        .start_with(|s| s.with_stop_grace_period(GRACE));

    let request = JobRequest::builder("upload")
        .constraints(ConstraintSet::none().with_charging(true))
        .build()
        .unwrap();
    let id = h.store.submit(request).await.unwrap();
    h.wait_for_state(&id, JobState::Running).await;

    h.signals.update(|s| s.charging = false);
    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(record.failure, Some(FailureCause::Timeout));
    assert_eq!(record.stop_reason, StopReason::Timeout);

    // The job must not come back while the old thread is still sleeping.
    h.signals.update(|s| s.charging = true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(stats.starts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.peak.load(Ordering::SeqCst), 1);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ignored_cancel_frees_the_slot_and_keeps_the_cancellation() {
    let (worker, stats) = StubbornWorker::new(Duration::from_secs(2));
    let h = TestHarness::new()
        .with_blocking_worker("upload", worker)
        .with_worker("echo", EchoWorker)
        .start_with(|s| s.with_stop_grace_period(GRACE).with_max_concurrent_workers(1));

    let stuck = h
        .store
        .submit(JobRequest::builder("upload").build().unwrap())
        .await
        .unwrap();
    h.wait_for_state(&stuck, JobState::Running).await;

    h.store.cancel(&stuck).await.unwrap();
    let next = h
        .store
        .submit(JobRequest::builder("echo").build().unwrap())
        .await
        .unwrap();

    // The only slot is reclaimed while the cancelled thread still sleeps.
    h.wait_for_state(&next, JobState::Succeeded).await;
    assert_eq!(stats.active.load(Ordering::SeqCst), 1);

    let record = h.store.get(&stuck).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.stop_reason, StopReason::CancelledByCaller);
    assert_eq!(record.failure, None);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_next_period_waits_for_the_reclaimed_thread() {
    let (worker, stats) = StubbornWorker::new(Duration::from_millis(1000));
    let h = TestHarness::new()
        .with_blocking_worker("sync", worker)
        .start_with(|s| {
            s.with_stop_grace_period(GRACE)
                .with_max_execution_time(Duration::from_millis(50))
        });

    let request = JobRequest::builder("sync")
        .periodic(Duration::from_secs(3600))
        .build()
        .unwrap();
    let id = h.store.submit(request).await.unwrap();

    let record = h
        .wait_for(&id, |r| r.period_count == 1, "first period timed out")
        .await;
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.failure, Some(FailureCause::Timeout));

    // The next period is due, but the first thread has not returned.
    h.clock.advance(Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stats.starts.load(Ordering::SeqCst), 1);

    let started = tokio::time::timeout(Duration::from_secs(5), async {
        while stats.starts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(started.is_ok(), "second period never started");
    assert_eq!(stats.starts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.peak.load(Ordering::SeqCst), 1);

    h.shutdown().await.unwrap();
}
