//! Unique work integration tests.
//!
//! Tests that verify existing work policies resolve correctly against work
//! that is already running.

use deferq::testing::{EchoWorker, GatedWorker, ScriptedWorker, TestHarness};
use deferq::{Data, ExistingWorkPolicy, JobState, StopReason, SubmitKind, WorkResult};
use std::sync::Arc;

use crate::common::request;

#[tokio::test]
async fn test_keep_while_running_does_not_start_a_second_job() {
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("sync", gate.clone())
        .start();

    let first = h
        .store
        .submit_unique("sync", ExistingWorkPolicy::Keep, request("sync"))
        .await
        .unwrap();
    let id = first.id().unwrap();
    h.wait_for_state(&id, JobState::Running).await;

    let second = h
        .store
        .submit_unique("sync", ExistingWorkPolicy::Keep, request("sync"))
        .await
        .unwrap();
    assert_eq!(second.kind, SubmitKind::Kept);
    assert_eq!(second.ids, vec![id]);

    gate.release();
    h.wait_for_state(&id, JobState::Succeeded).await;
    assert_eq!(gate.started(), 1);
    assert_eq!(h.store.all().await.unwrap().len(), 1);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replace_stops_running_work() {
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("sync", gate.clone())
        .start();

    let old = h
        .store
        .submit_unique("sync", ExistingWorkPolicy::Keep, request("sync"))
        .await
        .unwrap()
        .id()
        .unwrap();
    h.wait_for_state(&old, JobState::Running).await;

    let outcome = h
        .store
        .submit_unique("sync", ExistingWorkPolicy::Replace, request("sync"))
        .await
        .unwrap();
    assert_eq!(outcome.kind, SubmitKind::Replaced);
    let new = outcome.id().unwrap();

    let record = h.wait_for_state(&old, JobState::Cancelled).await;
    assert_eq!(record.stop_reason, StopReason::CancelledByCaller);
    assert_eq!(record.unique_name, None);

    let record = h.wait_for_state(&new, JobState::Running).await;
    assert_eq!(record.generation, 1);
    assert_eq!(record.unique_name.as_deref(), Some("sync"));

    gate.release();
    h.wait_for_state(&new, JobState::Succeeded).await;

    let bound = h.store.by_unique_name("sync").await.unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].id, new);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_append_runs_after_existing_work_with_its_output() {
    let producer = Arc::new(ScriptedWorker::new([WorkResult::Success(
        Data::new().with("token", "abc"),
    )]));
    let h = TestHarness::new()
        .with_shared_worker("fetch", producer.clone())
        .with_worker("store", EchoWorker)
        .start();

    let first = h
        .store
        .submit_unique("pipeline", ExistingWorkPolicy::Append, request("fetch"))
        .await
        .unwrap()
        .id()
        .unwrap();
    let outcome = h
        .store
        .submit_unique("pipeline", ExistingWorkPolicy::Append, request("store"))
        .await
        .unwrap();
    assert_eq!(outcome.kind, SubmitKind::Appended);
    let second = outcome.id().unwrap();

    h.wait_for_state(&first, JobState::Succeeded).await;
    let record = h.wait_for_state(&second, JobState::Succeeded).await;
    assert_eq!(record.prerequisites, vec![first]);
    assert_eq!(record.output.get_str("token"), Some("abc"));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_append_after_failure_cancels_new_work() {
    let h = TestHarness::new()
        .with_worker("store", EchoWorker)
        .start();

    // Unregistered job type, so the first record fails.
    let first = h
        .store
        .submit_unique("pipeline", ExistingWorkPolicy::Append, request("missing"))
        .await
        .unwrap()
        .id()
        .unwrap();
    h.wait_for_state(&first, JobState::Failed).await;

    let second = h
        .store
        .submit_unique("pipeline", ExistingWorkPolicy::Append, request("store"))
        .await
        .unwrap()
        .id()
        .unwrap();

    h.wait_for_state(&second, JobState::Cancelled).await;

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_append_or_replace_starts_over_after_failure() {
    let h = TestHarness::new()
        .with_worker("store", EchoWorker)
        .start();

    let first = h
        .store
        .submit_unique(
            "pipeline",
            ExistingWorkPolicy::AppendOrReplace,
            request("missing"),
        )
        .await
        .unwrap()
        .id()
        .unwrap();
    h.wait_for_state(&first, JobState::Failed).await;

    let outcome = h
        .store
        .submit_unique(
            "pipeline",
            ExistingWorkPolicy::AppendOrReplace,
            request("store"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.kind, SubmitKind::Replaced);

    let record = h
        .wait_for_state(&outcome.id().unwrap(), JobState::Succeeded)
        .await;
    assert!(record.prerequisites.is_empty());

    h.shutdown().await.unwrap();
}
