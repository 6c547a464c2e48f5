//! Scheduler engine.
//!
//! The [`Scheduler`] owns the run loop. It wakes on timer ticks, store
//! mutations, device signal changes, handle commands and execution reports,
//! and runs a dispatch cycle each time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::quota::{DEFAULT_EXPEDITED_PER_WINDOW, DEFAULT_EXPEDITED_WINDOW, ExpeditedQuota};
use super::types::{ExecutionMessage, SchedulerCommand, SchedulerError, SchedulerState};
use crate::config::SchedulerConfig;
use crate::core::backoff::MAX_BACKOFF;
use crate::core::constraints::{DeviceSignals, SignalFeed};
use crate::core::state::{FailureCause, StopReason};
use crate::core::types::{ExecutionId, JobId};
use crate::events::{Event, EventBus, ForegroundNotifier};
use crate::store::JobStore;
use crate::worker::{StopSignal, WorkerRegistry};

/// Default number of concurrent worker slots.
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 4;

/// Default retry limit when a request does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// One execution tracked by the run loop.
pub(super) struct RunningExecution {
    pub(super) execution: ExecutionId,
    pub(super) job_type: String,
    pub(super) stop: StopSignal,
    pub(super) handle: JoinHandle<()>,
    pub(super) started: Instant,
    pub(super) stop_requested_at: Option<Instant>,
    /// Runs on the blocking pool, where aborting the task does not stop it.
    pub(super) blocking: bool,
    /// Worker slot, released when the execution is no longer tracked.
    pub(super) _permit: OwnedSemaphorePermit,
}

impl RunningExecution {
    /// Signal the worker to stop. Only the first request counts.
    pub(super) fn request_stop(&mut self, reason: StopReason) -> bool {
        if self.stop_requested_at.is_some() {
            return false;
        }
        self.stop.stop(reason);
        self.stop_requested_at = Some(Instant::now());
        true
    }
}

/// State owned by the run loop.
pub(super) struct Runtime {
    pub(super) slots: Arc<Semaphore>,
    pub(super) running: HashMap<JobId, RunningExecution>,
    /// Reclaimed blocking executions whose thread has not returned yet.
    /// Their jobs are not dispatched again until it does.
    pub(super) detached: HashMap<JobId, ExecutionId>,
    pub(super) quota: ExpeditedQuota,
    pub(super) messages: mpsc::UnboundedSender<ExecutionMessage>,
}

impl Runtime {
    /// Stop and abort every execution without touching the store.
    fn abandon_all(&mut self) {
        for (_, mut execution) in self.running.drain() {
            execution.request_stop(StopReason::Unknown);
            execution.handle.abort();
        }
        self.detached.clear();
    }
}

/// What woke the run loop.
enum Wakeup {
    Tick,
    Command(SchedulerCommand),
    Signals(bool),
    StoreChanged,
    Message(ExecutionMessage),
}

/// The main scheduler that dispatches jobs from a [`JobStore`].
pub struct Scheduler {
    pub(super) store: Arc<JobStore>,
    pub(super) registry: Arc<WorkerRegistry>,
    pub(super) signals: SignalFeed,
    pub(super) event_bus: Arc<EventBus>,
    pub(super) notifier: Option<Arc<dyn ForegroundNotifier>>,
    pub(super) tick_interval: Duration,
    pub(super) max_concurrent_workers: usize,
    pub(super) max_retries: u32,
    pub(super) max_backoff: Duration,
    pub(super) stop_grace_period: Duration,
    pub(super) max_execution_time: Duration,
    pub(super) shutdown_timeout: Duration,
    pub(super) remote_timeout: Duration,
    pub(super) expedited_per_window: usize,
    pub(super) expedited_window: Duration,
}

impl Scheduler {
    /// Create a new scheduler over a store and a set of workers.
    ///
    /// Device signals start as all met.
    pub fn new(store: Arc<JobStore>, registry: WorkerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            signals: SignalFeed::new(DeviceSignals::all_met()),
            event_bus: Arc::new(EventBus::new()),
            notifier: None,
            tick_interval: Duration::from_secs(1),
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_backoff: MAX_BACKOFF,
            stop_grace_period: Duration::from_secs(10),
            max_execution_time: Duration::from_secs(10 * 60),
            shutdown_timeout: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(60),
            expedited_per_window: DEFAULT_EXPEDITED_PER_WINDOW,
            expedited_window: DEFAULT_EXPEDITED_WINDOW,
        }
    }

    /// Apply the settings of a loaded configuration file.
    pub fn with_config(self, config: &SchedulerConfig) -> Self {
        self.with_tick_interval(config.tick_interval())
            .with_max_concurrent_workers(config.max_concurrent_workers)
            .with_max_retries(config.max_retries)
            .with_max_backoff(config.max_backoff())
            .with_stop_grace_period(config.stop_grace_period())
            .with_max_execution_time(config.max_execution_time())
            .with_shutdown_timeout(config.shutdown_timeout())
            .with_remote_timeout(config.remote_timeout())
            .with_expedited_quota(config.expedited.max_per_window, config.expedited.window())
    }

    /// Use a shared device signal feed.
    pub fn with_signals(mut self, signals: SignalFeed) -> Self {
        self.signals = signals;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the surface notified when expedited work starts.
    pub fn with_notifier(mut self, notifier: Arc<dyn ForegroundNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the number of worker slots. At least one slot is kept.
    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max.max(1);
        self
    }

    /// Set the retry limit for requests that do not carry their own.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the cap applied to backoff delays.
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Set how long a stopped worker may keep running before its slot is
    /// reclaimed and its job fails with [`FailureCause::Timeout`].
    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Set the execution time budget.
    pub fn with_max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = max;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the default timeout for remote workers.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Allow `max_per_window` expedited starts per rolling `window`.
    pub fn with_expedited_quota(mut self, max_per_window: usize, window: Duration) -> Self {
        self.expedited_per_window = max_per_window;
        self.expedited_window = window;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Get the device signal feed.
    pub fn signals(&self) -> &SignalFeed {
        &self.signals
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Re-enqueue records left running by a previous process.
    ///
    /// Called automatically when the scheduler starts.
    pub async fn recover(&self) -> Result<Vec<JobId>, SchedulerError> {
        let recovered = self.store.recover().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered interrupted jobs");
        }
        Ok(recovered)
    }

    /// Start the scheduler and return a handle for control.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: state.clone(),
        };

        let task = tokio::spawn(self.run(command_rx, state));

        (handle, task)
    }

    /// Main scheduler loop.
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) -> Result<(), SchedulerError> {
        if let Err(e) = self.recover().await {
            *state.write().await = SchedulerState::Stopped;
            return Err(e);
        }

        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let mut rt = Runtime {
            slots: Arc::new(Semaphore::new(self.max_concurrent_workers)),
            running: HashMap::new(),
            detached: HashMap::new(),
            quota: ExpeditedQuota::new(self.expedited_per_window, self.expedited_window),
            messages: messages_tx,
        };
        let mut signals_rx = self.signals.subscribe();
        let mut signals_open = true;
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            workers = self.max_concurrent_workers,
            job_types = ?self.registry.names(),
            "Scheduler started"
        );

        loop {
            let wakeup = tokio::select! {
                _ = interval.tick() => Wakeup::Tick,
                Some(command) = command_rx.recv() => Wakeup::Command(command),
                changed = signals_rx.changed(), if signals_open => Wakeup::Signals(changed.is_ok()),
                _ = self.store.notified() => Wakeup::StoreChanged,
                Some(message) = messages_rx.recv() => Wakeup::Message(message),
            };

            let step = match wakeup {
                Wakeup::Tick => self.tick(&mut rt, &state).await,
                Wakeup::Signals(open) => {
                    signals_open = open;
                    self.cycle(&mut rt, &state).await
                }
                Wakeup::StoreChanged => self.cycle(&mut rt, &state).await,
                Wakeup::Message(message) => self.on_message(&mut rt, &state, message).await,
                Wakeup::Command(command) => match command {
                    SchedulerCommand::Pause { response } => {
                        *state.write().await = SchedulerState::Paused;
                        tracing::info!("Scheduler paused");
                        let _ = response.send(());
                        Ok(())
                    }
                    SchedulerCommand::Resume { response } => {
                        *state.write().await = SchedulerState::Running;
                        tracing::info!("Scheduler resumed");
                        let _ = response.send(());
                        self.cycle(&mut rt, &state).await
                    }
                    SchedulerCommand::Wake { response } => {
                        let result = self.cycle(&mut rt, &state).await;
                        let _ = response.send(());
                        result
                    }
                    SchedulerCommand::Shutdown { response } => {
                        let mut s = state.write().await;
                        *s = SchedulerState::Stopped;
                        drop(s); // Release the lock before waiting

                        let result = self.await_running_jobs(&mut rt, &mut messages_rx).await;
                        if result.is_err() {
                            rt.abandon_all();
                        }
                        let _ = response.send(());
                        return result;
                    }
                },
            };

            if let Err(e) = step {
                tracing::error!(error = %e, "Scheduler stopping after store failure");
                rt.abandon_all();
                *state.write().await = SchedulerState::Stopped;
                return Err(e);
            }
        }
    }

    async fn tick(
        &self,
        rt: &mut Runtime,
        state: &RwLock<SchedulerState>,
    ) -> Result<(), SchedulerError> {
        let events = self.supervise(rt).await?;
        self.emit_all(events).await;
        self.cycle(rt, state).await
    }

    async fn on_message(
        &self,
        rt: &mut Runtime,
        state: &RwLock<SchedulerState>,
        message: ExecutionMessage,
    ) -> Result<(), SchedulerError> {
        let events = self.handle_message(rt, message).await?;
        self.emit_all(events).await;
        self.cycle(rt, state).await
    }

    async fn cycle(
        &self,
        rt: &mut Runtime,
        state: &RwLock<SchedulerState>,
    ) -> Result<(), SchedulerError> {
        let paused = *state.read().await != SchedulerState::Running;
        let events = self.dispatch_cycle(rt, paused).await?;
        self.emit_all(events).await;
        Ok(())
    }

    pub(super) async fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.event_bus.emit(event).await;
        }
    }

    /// Enforce the execution time budget and the stop grace period.
    async fn supervise(&self, rt: &mut Runtime) -> Result<Vec<Event>, SchedulerError> {
        let mut events = Vec::new();
        let mut reclaimed = Vec::new();

        for (job_id, execution) in rt.running.iter_mut() {
            if execution.started.elapsed() >= self.max_execution_time
                && execution.request_stop(StopReason::Timeout)
            {
                tracing::warn!(
                    job_id = %job_id,
                    job_type = %execution.job_type,
                    budget = ?self.max_execution_time,
                    "Execution exceeded its time budget, stopping"
                );
                events.push(Event::job_stopped(
                    *job_id,
                    execution.job_type.clone(),
                    StopReason::Timeout,
                ));
            }

            if let Some(requested) = execution.stop_requested_at
                && requested.elapsed() >= self.stop_grace_period
            {
                reclaimed.push(*job_id);
            }
        }

        if reclaimed.is_empty() {
            return Ok(events);
        }

        let mut txn = self.store.lock().await;
        for job_id in reclaimed {
            let Some(execution) = rt.running.remove(&job_id) else {
                continue;
            };
            tracing::warn!(
                job_id = %job_id,
                job_type = %execution.job_type,
                grace = ?self.stop_grace_period,
                "Worker ignored stop request, reclaiming slot"
            );
            if execution.blocking {
                rt.detached.insert(job_id, execution.execution);
            } else {
                execution.handle.abort();
            }
            txn.clear_forced_constraints(&job_id);

            let mut record = match txn.get(&job_id).await {
                Ok(record) => record,
                Err(crate::store::StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            // Cancelled and replaced records keep their outcome.
            if !record.is_finished() {
                let now = txn.now();
                record.stop_reason = StopReason::Timeout;
                finish_with_failure(&mut txn, &mut record, FailureCause::Timeout, now, &mut events)
                    .await?;
            }
        }
        Ok(events)
    }

    /// Wait for running jobs to complete during shutdown.
    ///
    /// Completions are still recorded while waiting. Executions left at the
    /// deadline are preempted and their records re-enqueued.
    async fn await_running_jobs(
        &self,
        rt: &mut Runtime,
        messages_rx: &mut mpsc::UnboundedReceiver<ExecutionMessage>,
    ) -> Result<(), SchedulerError> {
        if rt.running.is_empty() {
            tracing::info!("No running jobs to wait for during shutdown");
            return Ok(());
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            rt.running.len(),
            self.shutdown_timeout
        );

        let start = Instant::now();
        let deadline = start + self.shutdown_timeout;

        while !rt.running.is_empty() {
            match tokio::time::timeout_at(deadline, messages_rx.recv()).await {
                Ok(Some(message)) => {
                    let events = self.handle_message(rt, message).await?;
                    self.emit_all(events).await;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if rt.running.is_empty() {
            tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
            return Ok(());
        }

        tracing::warn!(
            "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
            self.shutdown_timeout,
            rt.running.len()
        );

        let mut events = Vec::new();
        {
            let mut txn = self.store.lock().await;
            for (job_id, mut execution) in rt.running.drain() {
                execution.request_stop(StopReason::Preempted);
                execution.handle.abort();

                let mut record = match txn.get(&job_id).await {
                    Ok(record) => record,
                    Err(crate::store::StoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                if record.is_running(execution.execution) {
                    let next = record.next_run_at;
                    record.mark_enqueued(next);
                    record.stop_reason = StopReason::Preempted;
                    txn.save(&mut record).await?;
                    events.push(Event::job_stopped(
                        job_id,
                        execution.job_type,
                        StopReason::Preempted,
                    ));
                }
            }
        }
        self.emit_all(events).await;
        Ok(())
    }
}

/// Fail a record, or close its period if it is periodic.
pub(super) async fn finish_with_failure(
    txn: &mut crate::store::Txn<'_>,
    record: &mut crate::storage::JobRecord,
    cause: FailureCause,
    now: chrono::DateTime<chrono::Utc>,
    events: &mut Vec<Event>,
) -> Result<(), SchedulerError> {
    if record.is_periodic() {
        tracing::warn!(job_id = %record.id, job_type = %record.job_type(), cause = %cause, "Periodic job failed, scheduling next period");
        record.failure = Some(cause);
        record.start_next_period(now);
        txn.save(record).await?;
        events.push(Event::period_completed(
            record.id,
            record.job_type(),
            record.period_count,
            false,
        ));
        return Ok(());
    }

    tracing::warn!(job_id = %record.id, job_type = %record.job_type(), cause = %cause, "Job failed");
    record.mark_failed(cause.clone(), now);
    txn.save(record).await?;
    txn.cancel_dependents(record).await?;
    events.push(Event::job_failed(record.id, record.job_type(), cause));
    Ok(())
}
