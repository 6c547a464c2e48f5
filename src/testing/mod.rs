//! Testing utilities for users of the deferq library.
//!
//! This module provides helpers for testing code that schedules work:
//!
//! - [`TestDriver`]: moves the clock and forces delays and constraints
//! - [`TestHarness`]: runs a scheduler over an in-memory store and a manual clock
//! - Reusable workers such as [`EchoWorker`], [`FailingWorker`],
//!   [`ScriptedWorker`] and [`ProgressWorker`]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

pub use crate::core::clock::ManualClock;

use crate::core::constraints::{DeviceSignals, SignalFeed};
use crate::core::data::Data;
use crate::core::state::JobState;
use crate::core::types::JobId;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::storage::JobRecord;
use crate::store::{JobStore, StoreError};
use crate::worker::{BlockingWorker, RemoteWorker, WorkContext, WorkResult, Worker, WorkerRegistry};

/// Drives time and preconditions for jobs in a store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use deferq::testing::{ManualClock, TestDriver};
/// use deferq::{JobRequest, JobStore};
///
/// # #[tokio::main]
/// # async fn main() {
/// let clock = Arc::new(ManualClock::new());
/// let store = Arc::new(JobStore::in_memory_with_clock(clock.clone()));
/// let driver = TestDriver::new(store.clone(), clock);
///
/// let request = JobRequest::builder("sync")
///     .initial_delay(Duration::from_secs(3600))
///     .build()
///     .unwrap();
/// let id = store.submit(request).await.unwrap();
///
/// // Either skip the delay for this job...
/// driver.set_initial_delay_met(&id).await.unwrap();
/// // ...or move time past it.
/// driver.advance(Duration::from_secs(3600));
/// # }
/// ```
#[derive(Clone)]
pub struct TestDriver {
    store: Arc<JobStore>,
    clock: Arc<ManualClock>,
}

impl TestDriver {
    /// Create a driver over a store that uses `clock`.
    pub fn new(store: Arc<JobStore>, clock: Arc<ManualClock>) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Move the clock forward and wake the scheduler.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.store.wake();
    }

    /// Treat the initial delay of a job as elapsed.
    pub async fn set_initial_delay_met(&self, id: &JobId) -> Result<(), StoreError> {
        self.store.force_delay(id).await
    }

    /// Treat the current period delay of a periodic job as elapsed.
    pub async fn set_period_delay_met(&self, id: &JobId) -> Result<(), StoreError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(*id))?;
        if !record.is_periodic() {
            return Err(StoreError::InvalidOperation(format!(
                "job {} is not periodic",
                id
            )));
        }
        self.store.force_delay(id).await
    }

    /// Treat every constraint of a job as met from now on.
    pub async fn set_all_constraints_met(&self, id: &JobId) -> Result<(), StoreError> {
        self.store.force_constraints(id).await
    }
}

/// Returns its input as output.
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        WorkResult::Success(ctx.input().clone())
    }
}

/// Fails a number of times, then succeeds.
///
/// Failures are reported as [`WorkResult::Failure`], or as
/// [`WorkResult::Retry`] when built with [`FailingWorker::retrying`].
pub struct FailingWorker {
    failures: AtomicU32,
    calls: AtomicU32,
    message: String,
    retry: bool,
}

impl FailingWorker {
    /// Fail `fail_count` times with a permanent failure.
    pub fn new(fail_count: u32) -> Self {
        Self {
            failures: AtomicU32::new(fail_count),
            calls: AtomicU32::new(0),
            message: "injected failure".to_string(),
            retry: false,
        }
    }

    /// Ask for a retry `fail_count` times.
    pub fn retrying(fail_count: u32) -> Self {
        Self {
            retry: true,
            ..Self::new(fail_count)
        }
    }

    /// Fail forever.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FailingWorker {
    async fn do_work(&self, _ctx: WorkContext) -> WorkResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        match (failed, self.retry) {
            (false, _) => WorkResult::success(),
            (true, true) => WorkResult::Retry,
            (true, false) => WorkResult::Failure(self.message.clone()),
        }
    }
}

/// Returns results from a script, one per call. The last one repeats.
pub struct ScriptedWorker {
    script: Mutex<VecDeque<WorkResult>>,
    last: Mutex<WorkResult>,
    contexts: Mutex<Vec<WorkContext>>,
}

impl ScriptedWorker {
    pub fn new(results: impl IntoIterator<Item = WorkResult>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            last: Mutex::new(WorkResult::success()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Contexts of every call so far.
    pub async fn contexts(&self) -> Vec<WorkContext> {
        self.contexts.lock().await.clone()
    }

    /// Inputs of every call so far.
    pub async fn inputs(&self) -> Vec<Data> {
        self.contexts
            .lock()
            .await
            .iter()
            .map(|ctx| ctx.input().clone())
            .collect()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        self.contexts.lock().await.push(ctx);
        let mut last = self.last.lock().await;
        if let Some(next) = self.script.lock().await.pop_front() {
            *last = next;
        }
        last.clone()
    }
}

/// Reports each progress step, waiting `step_delay` after each, then succeeds.
pub struct ProgressWorker {
    steps: Vec<Data>,
    step_delay: Duration,
}

impl ProgressWorker {
    pub fn new(steps: impl IntoIterator<Item = Data>, step_delay: Duration) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            step_delay,
        }
    }
}

#[async_trait]
impl Worker for ProgressWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        for step in &self.steps {
            ctx.set_progress(step.clone());
            tokio::time::sleep(self.step_delay).await;
        }
        WorkResult::success()
    }
}

/// Runs until released, returning `result` afterwards.
///
/// Useful to keep a job in `Running` while a test changes the world around it.
pub struct GatedWorker {
    gate: Arc<Notify>,
    started: AtomicU32,
    result: WorkResult,
}

impl GatedWorker {
    pub fn new(result: WorkResult) -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            started: AtomicU32::new(0),
            result,
        }
    }

    /// Let one waiting execution finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Number of executions started so far.
    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for GatedWorker {
    async fn do_work(&self, _ctx: WorkContext) -> WorkResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        self.result.clone()
    }
}

/// Panics on every call.
pub struct PanickingWorker;

impl BlockingWorker for PanickingWorker {
    fn do_work(&self, _ctx: WorkContext) -> WorkResult {
        panic!("worker exploded");
    }
}

/// How long [`RunningHarness::wait_for_state`] waits by default.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Builds a scheduler over an in-memory store and a [`ManualClock`].
pub struct TestHarness {
    clock: Arc<ManualClock>,
    store: Arc<JobStore>,
    signals: SignalFeed,
    registry: WorkerRegistry,
}

impl TestHarness {
    /// Create a harness whose device signals are all met.
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(JobStore::in_memory_with_clock(clock.clone()));
        Self {
            clock,
            store,
            signals: SignalFeed::new(DeviceSignals::all_met()),
            registry: WorkerRegistry::new(),
        }
    }

    pub fn with_signals(self, signals: DeviceSignals) -> Self {
        self.signals.set(signals);
        self
    }

    pub fn with_worker(mut self, job_type: impl Into<String>, worker: impl Worker + 'static) -> Self {
        self.registry.register_async(job_type, worker);
        self
    }

    pub fn with_shared_worker(mut self, job_type: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.registry
            .register(job_type, crate::worker::WorkerKind::Async(worker));
        self
    }

    pub fn with_blocking_worker(
        mut self,
        job_type: impl Into<String>,
        worker: impl BlockingWorker + 'static,
    ) -> Self {
        self.registry.register_blocking(job_type, worker);
        self
    }

    pub fn with_remote_worker(mut self, job_type: impl Into<String>, worker: RemoteWorker) -> Self {
        self.registry.register_remote(job_type, worker);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Start the scheduler with a fast tick.
    pub fn start(self) -> RunningHarness {
        self.start_with(|scheduler| scheduler)
    }

    /// Start the scheduler after adjusting it.
    pub fn start_with(self, configure: impl FnOnce(Scheduler) -> Scheduler) -> RunningHarness {
        let scheduler = Scheduler::new(self.store.clone(), self.registry)
            .with_signals(self.signals.clone())
            .with_tick_interval(Duration::from_millis(20));
        let (handle, task) = configure(scheduler).start();

        RunningHarness {
            driver: TestDriver::new(self.store.clone(), self.clock.clone()),
            store: self.store,
            clock: self.clock,
            signals: self.signals,
            handle,
            task,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A started [`TestHarness`].
pub struct RunningHarness {
    pub store: Arc<JobStore>,
    pub clock: Arc<ManualClock>,
    pub signals: SignalFeed,
    pub driver: TestDriver,
    pub handle: SchedulerHandle,
    task: JoinHandle<Result<(), SchedulerError>>,
}

impl RunningHarness {
    /// Wait until a job reaches `state`.
    ///
    /// # Panics
    ///
    /// Panics if the job does not reach the state within [`DEFAULT_WAIT`].
    pub async fn wait_for_state(&self, id: &JobId, state: JobState) -> JobRecord {
        self.wait_for(id, |record| record.state == state, &format!("state {}", state))
            .await
    }

    /// Wait until a job satisfies a predicate.
    ///
    /// # Panics
    ///
    /// Panics if the predicate does not hold within [`DEFAULT_WAIT`].
    pub async fn wait_for(
        &self,
        id: &JobId,
        predicate: impl Fn(&JobRecord) -> bool,
        what: &str,
    ) -> JobRecord {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            if let Ok(Some(record)) = self.store.get(id).await
                && predicate(&record)
            {
                return record;
            }
            if tokio::time::Instant::now() >= deadline {
                let current = self.store.get(id).await.ok().flatten();
                panic!("job {} did not reach {}: {:?}", id, what, current.map(|r| r.state));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shut the scheduler down and wait for its loop to end.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.handle.shutdown().await?;
        self.task
            .await
            .map_err(|e| SchedulerError::ChannelError(format!("scheduler task failed: {}", e)))?
    }
}
