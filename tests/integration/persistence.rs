//! Persistence integration tests.
//!
//! Tests that verify work survives a restart of the process: records are
//! reloaded from SQLite and interrupted executions run again.

#![cfg(feature = "sqlite")]

use deferq::testing::{EchoWorker, GatedWorker};
use deferq::{
    Data, ExistingWorkPolicy, JobRequest, JobState, JobStore, Scheduler, SqliteStorage,
    StopReason, SubmitKind, SystemClock, WorkResult, WorkerRegistry,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::{request, wait_for_state};

const WAIT: Duration = Duration::from_secs(5);

async fn open(path: &Path) -> Arc<JobStore> {
    let storage = SqliteStorage::new(path).await.unwrap();
    Arc::new(
        JobStore::open(Arc::new(storage), Arc::new(SystemClock))
            .await
            .unwrap(),
    )
}

fn echo_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_async("echo", EchoWorker);
    registry
}

#[tokio::test]
async fn test_pending_work_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("jobs.db");

    let input = Data::new().with("file", "photo.jpg");
    let id = {
        let store = open(&path).await;
        store
            .submit(
                JobRequest::builder("echo")
                    .input(input.clone())
                    .tag("media")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap()
    };

    let store = open(&path).await;
    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(store.by_tag("media").await.unwrap().len(), 1);

    let (handle, task) = Scheduler::new(store.clone(), echo_registry())
        .with_tick_interval(Duration::from_millis(20))
        .start();

    let record = wait_for_state(&store, &id, JobState::Succeeded, WAIT).await;
    assert_eq!(record.output, input);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_interrupted_execution_runs_again_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("jobs.db");

    let id = {
        let store = open(&path).await;
        let mut registry = WorkerRegistry::new();
        registry.register_async("echo", GatedWorker::new(WorkResult::success()));

        let (_handle, task) = Scheduler::new(store.clone(), registry)
            .with_tick_interval(Duration::from_millis(20))
            .start();
        let id = store.submit(request("echo")).await.unwrap();
        wait_for_state(&store, &id, JobState::Running, WAIT).await;

        // Simulate a crash: the loop disappears with the record still running.
        task.abort();
        let _ = task.await;
        id
    };

    let store = open(&path).await;
    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Running);

    let recovered = store.recover().await.unwrap();
    assert_eq!(recovered, vec![id]);
    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.stop_reason, StopReason::Unknown);

    let (handle, task) = Scheduler::new(store.clone(), echo_registry())
        .with_tick_interval(Duration::from_millis(20))
        .start();

    let record = wait_for_state(&store, &id, JobState::Succeeded, WAIT).await;
    assert_eq!(record.run_attempt_count, 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unique_names_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("jobs.db");

    let id = {
        let store = open(&path).await;
        store
            .submit_unique(
                "daily-sync",
                ExistingWorkPolicy::Keep,
                JobRequest::builder("echo")
                    .initial_delay(Duration::from_secs(3600))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap()
            .id()
            .unwrap()
    };

    let store = open(&path).await;
    let outcome = store
        .submit_unique("daily-sync", ExistingWorkPolicy::Keep, request("echo"))
        .await
        .unwrap();
    assert_eq!(outcome.kind, SubmitKind::Kept);
    assert_eq!(outcome.ids, vec![id]);

    // Sequence numbers continue after the stored ones.
    let other = store.submit(request("echo")).await.unwrap();
    let first = store.get(&id).await.unwrap().unwrap();
    let second = store.get(&other).await.unwrap().unwrap();
    assert!(second.sequence > first.sequence);
}
