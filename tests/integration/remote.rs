//! Remote worker integration tests.
//!
//! Tests that run jobs in a child `deferq remote-worker` process.

use deferq::testing::TestHarness;
use deferq::{Data, FailureCause, JobRequest, JobState, RemoteWorker};
use std::time::Duration;

fn child() -> RemoteWorker {
    RemoteWorker::builder(env!("CARGO_BIN_EXE_deferq"))
        .arg("remote-worker")
        .build()
}

fn with_input(job_type: &str, input: Data) -> JobRequest {
    JobRequest::builder(job_type).input(input).build().unwrap()
}

#[tokio::test]
async fn test_remote_worker_returns_output() {
    let h = TestHarness::new().with_remote_worker("echo", child()).start();

    let input = Data::new().with("file", "photo.jpg");
    let id = h.store.submit(with_input("echo", input.clone())).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Succeeded).await;
    assert_eq!(record.output, input);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_failure_is_reported() {
    let h = TestHarness::new().with_remote_worker("fail", child()).start();

    let id = h
        .store
        .submit(with_input("fail", Data::new().with("message", "quota reached")))
        .await
        .unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::Worker("quota reached".to_string()))
    );

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_progress_and_output() {
    let h = TestHarness::new().with_remote_worker("sleep", child()).start();

    let id = h
        .store
        .submit(with_input("sleep", Data::new().with("millis", 300)))
        .await
        .unwrap();

    let record = h.wait_for_state(&id, JobState::Succeeded).await;
    assert_eq!(record.output.get_int("slept_ms"), Some(300));
    assert!(record.progress.is_empty());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_job_type_unknown_to_the_child() {
    let h = TestHarness::new().with_remote_worker("mystery", child()).start();

    let id = h.store.submit(JobRequest::builder("mystery").build().unwrap()).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert_eq!(
        record.failure,
        Some(FailureCause::Worker("unknown job type: mystery".to_string()))
    );

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_timeout_loses_the_execution() {
    let worker = RemoteWorker::builder(env!("CARGO_BIN_EXE_deferq"))
        .arg("remote-worker")
        .timeout(Duration::from_millis(200))
        .build();
    let h = TestHarness::new().with_remote_worker("sleep", worker).start();

    let id = h
        .store
        .submit(with_input("sleep", Data::new().with("millis", 5000)))
        .await
        .unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert!(matches!(
        record.failure,
        Some(FailureCause::RemoteExecutionLost(_))
    ));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_program_loses_the_execution() {
    let worker = RemoteWorker::builder("/nonexistent/deferq-worker").build();
    let h = TestHarness::new().with_remote_worker("echo", worker).start();

    let id = h.store.submit(JobRequest::builder("echo").build().unwrap()).await.unwrap();

    let record = h.wait_for_state(&id, JobState::Failed).await;
    assert!(matches!(
        record.failure,
        Some(FailureCause::RemoteExecutionLost(_))
    ));

    h.shutdown().await.unwrap();
}
