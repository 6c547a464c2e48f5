//! Chain integration tests.
//!
//! Tests that verify chained stages run in order, receive the outputs of
//! their prerequisites and are cancelled when a prerequisite does not succeed.

use deferq::testing::{EchoWorker, FailingWorker, GatedWorker, ScriptedWorker, TestHarness};
use deferq::{
    Chain, Data, FailureCause, InputMerger, JobRequest, JobState, StopReason, Value, WorkResult,
};
use std::sync::Arc;

use crate::common::request;

fn producing(data: Data) -> Arc<ScriptedWorker> {
    Arc::new(ScriptedWorker::new([WorkResult::Success(data)]))
}

#[tokio::test]
async fn test_chain_passes_outputs_downstream() {
    let h = TestHarness::new()
        .with_shared_worker("fetch", producing(Data::new().with("rows", 12)))
        .with_worker("report", EchoWorker)
        .start();

    let report = JobRequest::builder("report")
        .input(Data::new().with("format", "csv"))
        .build()
        .unwrap();
    let ids = h
        .store
        .submit_chain(Chain::begin_with([request("fetch")]).then([report]))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let first = h.wait_for_state(&ids[0], JobState::Succeeded).await;
    let second = h.wait_for_state(&ids[1], JobState::Succeeded).await;

    assert!(second.last_started_at >= first.finished_at);
    assert_eq!(second.output.get_int("rows"), Some(12));
    assert_eq!(second.output.get_str("format"), Some("csv"));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_array_creating_merger_collects_parallel_outputs() {
    let h = TestHarness::new()
        .with_shared_worker("left", producing(Data::new().with("n", 1)))
        .with_shared_worker("right", producing(Data::new().with("n", 2)))
        .with_worker("join", EchoWorker)
        .start();

    let join = JobRequest::builder("join")
        .input_merger(InputMerger::ArrayCreating)
        .build()
        .unwrap();
    let ids = h
        .store
        .submit_chain(Chain::begin_with([request("left"), request("right")]).then([join]))
        .await
        .unwrap();

    let record = h.wait_for_state(&ids[2], JobState::Succeeded).await;
    let expected = Value::array([Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(record.output.get("n"), Some(&expected));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_cancels_the_rest_of_the_chain() {
    let h = TestHarness::new()
        .with_worker("fetch", FailingWorker::always())
        .with_worker("report", EchoWorker)
        .start();

    let ids = h
        .store
        .submit_chain(
            Chain::begin_with([request("fetch")])
                .then([request("report")])
                .then([request("report")]),
        )
        .await
        .unwrap();

    h.wait_for_state(&ids[0], JobState::Failed).await;
    for id in &ids[1..] {
        let record = h.wait_for_state(id, JobState::Cancelled).await;
        assert_eq!(record.stop_reason, StopReason::NotStopped);
        assert_eq!(record.run_attempt_count, 0);
    }

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_kinds_fail_with_merge_conflict() {
    let h = TestHarness::new()
        .with_shared_worker("fetch", producing(Data::new().with("n", 1)))
        .with_worker("report", EchoWorker)
        .start();

    let report = JobRequest::builder("report")
        .input(Data::new().with("n", "one"))
        .build()
        .unwrap();
    let ids = h
        .store
        .submit_chain(Chain::begin_with([request("fetch")]).then([report]))
        .await
        .unwrap();

    let record = h.wait_for_state(&ids[1], JobState::Failed).await;
    assert!(matches!(record.failure, Some(FailureCause::MergeConflict(_))));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelling_a_running_stage_cancels_dependents() {
    let gate = Arc::new(GatedWorker::new(WorkResult::success()));
    let h = TestHarness::new()
        .with_shared_worker("fetch", gate.clone())
        .with_worker("report", EchoWorker)
        .start();

    let ids = h
        .store
        .submit_chain(Chain::begin_with([request("fetch")]).then([request("report")]))
        .await
        .unwrap();
    h.wait_for_state(&ids[0], JobState::Running).await;

    assert_eq!(h.store.cancel(&ids[0]).await.unwrap(), 2);

    h.wait_for_state(&ids[0], JobState::Cancelled).await;
    h.wait_for_state(&ids[1], JobState::Cancelled).await;

    h.shutdown().await.unwrap();
}
