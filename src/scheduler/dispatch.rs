//! The dispatch cycle and completion handling.
//!
//! Every cycle runs under the store lock:
//!
//! 1. executions whose record left `Running` behind their back are stopped;
//! 2. running records whose constraints stopped holding become `Blocked`;
//! 3. `Blocked` records whose prerequisites succeeded and whose constraints
//!    hold again return to `Enqueued`;
//! 4. eligible `Enqueued` records are started, expedited work first.

use std::time::Duration;

use tracing::Instrument;

use super::engine::{RunningExecution, Runtime, Scheduler, finish_with_failure};
use super::types::{ExecutionMessage, SchedulerError};
use crate::core::clock;
use crate::core::data::Data;
use crate::core::request::OutOfQuotaPolicy;
use crate::core::state::{FailureCause, JobState, StopReason};
use crate::core::types::{ExecutionId, JobId};
use crate::events::Event;
use crate::storage::JobRecord;
use crate::store::{StoreError, Txn};
use crate::worker::runner::{self, ExecutionOutcome};
use crate::worker::{ProgressSink, StopSignal, WorkContext, WorkResult, WorkerKind};

/// A record selected to start.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub record: JobRecord,
    /// Whether the start consumes expedited quota.
    pub expedited: bool,
}

/// Start order for one cycle.
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    /// Records to start, in order, as long as worker slots remain.
    pub run: Vec<PlannedRun>,
    /// Expedited records over quota whose policy is to drop.
    pub dropped: Vec<JobRecord>,
}

/// Order eligible records for dispatch.
///
/// Expedited records within `expedited_slots` come first, the rest follow in
/// submission order. Expedited records past the quota either join the normal
/// order or are dropped, depending on their [`OutOfQuotaPolicy`].
pub fn plan_dispatch(mut candidates: Vec<JobRecord>, expedited_slots: usize) -> DispatchPlan {
    candidates.sort_by_key(|record| record.sequence);

    let mut slots = expedited_slots;
    let mut expedited = Vec::new();
    let mut normal = Vec::new();
    let mut dropped = Vec::new();

    for record in candidates {
        match record.request.expedited() {
            Some(_) if slots > 0 => {
                slots -= 1;
                expedited.push(PlannedRun {
                    record,
                    expedited: true,
                });
            }
            Some(OutOfQuotaPolicy::Drop) => dropped.push(record),
            _ => normal.push(PlannedRun {
                record,
                expedited: false,
            }),
        }
    }

    expedited.extend(normal);
    DispatchPlan {
        run: expedited,
        dropped,
    }
}

impl Scheduler {
    /// Run one dispatch cycle. Returns the events to emit once the store is released.
    pub(super) async fn dispatch_cycle(
        &self,
        rt: &mut Runtime,
        paused: bool,
    ) -> Result<Vec<Event>, SchedulerError> {
        let mut events = Vec::new();
        let mut txn = self.store.lock().await;
        let signals = self.signals.current();

        // Executions whose record was cancelled or replaced.
        for (job_id, execution) in rt.running.iter_mut() {
            if execution.stop_requested_at.is_some() {
                continue;
            }
            let reason = match txn.get(job_id).await {
                Ok(record) if record.is_running(execution.execution) => continue,
                Ok(record) if record.stop_reason != StopReason::NotStopped => record.stop_reason,
                Ok(_) | Err(StoreError::NotFound(_)) => StopReason::CancelledByCaller,
                Err(e) => return Err(e.into()),
            };
            execution.request_stop(reason);
            tracing::info!(job_id = %job_id, reason = %reason, "Stopping execution");
            events.push(Event::job_stopped(
                *job_id,
                execution.job_type.clone(),
                reason,
            ));
        }

        // Running records whose constraints stopped holding.
        for mut record in txn.list_by_state(JobState::Running).await? {
            if txn.constraints_forced(&record.id) {
                continue;
            }
            let Some(reason) = record.request.constraints().unmet(&signals) else {
                continue;
            };
            let Some(execution) = rt.running.get_mut(&record.id) else {
                continue;
            };
            if record.execution_id != Some(execution.execution) {
                continue;
            }
            record.mark_blocked(reason);
            txn.save(&mut record).await?;
            execution.request_stop(reason);
            tracing::info!(job_id = %record.id, reason = %reason, "Constraint lost, blocking job");
            events.push(Event::job_stopped(record.id, record.job_type(), reason));
        }

        // Blocked records that may continue.
        for mut record in txn.list_by_state(JobState::Blocked).await? {
            match prerequisites_state(&txn, &record).await? {
                Prerequisites::Pending => continue,
                Prerequisites::Failed => {
                    txn.cancel(&record.id, StopReason::NotStopped).await?;
                    continue;
                }
                Prerequisites::Succeeded => {}
            }
            if record.stop_reason.is_constraint()
                && !txn.constraints_forced(&record.id)
                && !record.request.constraints().is_satisfied(&signals)
            {
                continue;
            }
            let next = record.next_run_at;
            record.mark_enqueued(next);
            txn.save(&mut record).await?;
            tracing::debug!(job_id = %record.id, "Job unblocked");
        }

        if paused {
            return Ok(events);
        }

        let now = txn.now();
        let mut candidates = Vec::new();
        for record in txn.list_by_state(JobState::Enqueued).await? {
            if record.next_run_at > now && !txn.delay_forced(&record.id) {
                continue;
            }
            if !txn.constraints_forced(&record.id)
                && !record.request.constraints().is_satisfied(&signals)
            {
                continue;
            }
            if rt.running.contains_key(&record.id) || rt.detached.contains_key(&record.id) {
                // Previous execution has not returned yet.
                continue;
            }
            if prerequisites_state(&txn, &record).await? != Prerequisites::Succeeded {
                continue;
            }
            candidates.push(record);
        }
        if candidates.is_empty() {
            return Ok(events);
        }

        let plan = plan_dispatch(candidates, rt.quota.remaining(now));

        for mut record in plan.dropped {
            tracing::warn!(job_id = %record.id, job_type = %record.job_type(), "Expedited quota exhausted, dropping job");
            record.stop_reason = StopReason::Quota;
            finish_with_failure(&mut txn, &mut record, FailureCause::QuotaExceeded, now, &mut events)
                .await?;
        }

        for PlannedRun {
            mut record,
            expedited,
        } in plan.run
        {
            if rt.slots.available_permits() == 0 {
                tracing::debug!("No free worker slots, deferring remaining jobs");
                break;
            }

            let Some(kind) = self.registry.resolve(record.job_type()) else {
                let job_type = record.job_type().to_string();
                finish_with_failure(
                    &mut txn,
                    &mut record,
                    FailureCause::UnknownJobType(job_type),
                    now,
                    &mut events,
                )
                .await?;
                continue;
            };

            let input = match merged_input(&txn, &record).await? {
                Ok(input) => input,
                Err(detail) => {
                    finish_with_failure(
                        &mut txn,
                        &mut record,
                        FailureCause::MergeConflict(detail),
                        now,
                        &mut events,
                    )
                    .await?;
                    continue;
                }
            };

            let Ok(permit) = rt.slots.clone().try_acquire_owned() else {
                break;
            };

            let execution = ExecutionId::new();
            record.mark_running(execution, now);
            txn.save(&mut record).await?;
            txn.clear_forced_delay(&record.id);

            if expedited {
                rt.quota.record(now);
                if let Some(notifier) = &self.notifier {
                    notifier.expedited_started(&record.id, record.job_type());
                }
            }

            tracing::info!(
                job_id = %record.id,
                job_type = %record.job_type(),
                attempt = record.run_attempt_count,
                expedited,
                "Starting job"
            );
            events.push(Event::job_started(
                record.id,
                record.job_type(),
                record.run_attempt_count,
            ));
            self.spawn_execution(rt, &record, kind, input, execution, permit);
        }

        Ok(events)
    }

    fn spawn_execution(
        &self,
        rt: &mut Runtime,
        record: &JobRecord,
        kind: WorkerKind,
        input: Data,
        execution: ExecutionId,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let job_id = record.id;
        let blocking = matches!(kind, WorkerKind::Blocking(_));
        let stop = StopSignal::new();
        let progress_tx = rt.messages.clone();
        let ctx = WorkContext::new(job_id, record.job_type(), input)
            .with_tags(record.request.tags().clone())
            .with_run_attempt_count(record.run_attempt_count)
            .with_generation(record.generation)
            .with_progress(ProgressSink::from_fn(move |data| {
                let _ = progress_tx.send(ExecutionMessage::Progress {
                    job_id,
                    execution,
                    data,
                });
            }))
            .with_stop_signal(stop.clone());

        let span = tracing::info_span!(
            "job_execution",
            job_id = %job_id,
            job_type = %record.job_type()
        );
        let messages = rt.messages.clone();
        let remote_timeout = self.remote_timeout;

        let handle = tokio::spawn(
            async move {
                let outcome = runner::execute(kind, ctx, remote_timeout).await;
                let _ = messages.send(ExecutionMessage::Finished {
                    job_id,
                    execution,
                    outcome,
                });
            }
            .instrument(span),
        );

        rt.running.insert(
            job_id,
            RunningExecution {
                execution,
                job_type: record.job_type().to_string(),
                stop,
                handle,
                started: tokio::time::Instant::now(),
                stop_requested_at: None,
                blocking,
                _permit: permit,
            },
        );
    }

    /// Apply a progress or completion report from an execution.
    pub(super) async fn handle_message(
        &self,
        rt: &mut Runtime,
        message: ExecutionMessage,
    ) -> Result<Vec<Event>, SchedulerError> {
        match message {
            ExecutionMessage::Progress {
                job_id,
                execution,
                data,
            } => {
                if let Err(e) = data.ensure_within_limit() {
                    tracing::warn!(job_id = %job_id, error = %e, "Dropping oversized progress");
                    return Ok(Vec::new());
                }
                let mut txn = self.store.lock().await;
                let mut record = match txn.get(&job_id).await {
                    Ok(record) => record,
                    Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                if record.is_running(execution) {
                    record.progress = data;
                    txn.save(&mut record).await?;
                }
                Ok(Vec::new())
            }
            ExecutionMessage::Finished {
                job_id,
                execution,
                outcome,
            } => {
                if rt.detached.get(&job_id) == Some(&execution) {
                    rt.detached.remove(&job_id);
                    tracing::debug!(job_id = %job_id, "Reclaimed execution returned");
                    self.store.wake();
                    return Ok(Vec::new());
                }
                let tracked = match rt.running.get(&job_id) {
                    Some(running) if running.execution == execution => rt.running.remove(&job_id),
                    _ => None,
                };
                let elapsed = tracked
                    .as_ref()
                    .map_or(Duration::ZERO, |running| running.started.elapsed());
                let stop_reason = tracked
                    .as_ref()
                    .map_or(StopReason::NotStopped, |running| running.stop.reason());

                let mut txn = self.store.lock().await;
                let mut record = match txn.get(&job_id).await {
                    Ok(record) => record,
                    Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                if !record.is_running(execution) {
                    tracing::debug!(job_id = %job_id, "Ignoring result of a superseded execution");
                    return Ok(Vec::new());
                }

                txn.clear_forced_constraints(&job_id);
                let mut events = Vec::new();
                self.complete(&mut txn, &mut record, outcome, stop_reason, elapsed, &mut events)
                    .await?;
                Ok(events)
            }
        }
    }

    async fn complete(
        &self,
        txn: &mut Txn<'_>,
        record: &mut JobRecord,
        outcome: ExecutionOutcome,
        stop_reason: StopReason,
        elapsed: Duration,
        events: &mut Vec<Event>,
    ) -> Result<(), SchedulerError> {
        let now = txn.now();

        if stop_reason == StopReason::Timeout {
            record.stop_reason = StopReason::Timeout;
            return finish_with_failure(txn, record, FailureCause::Timeout, now, events).await;
        }

        match outcome {
            ExecutionOutcome::Stopped => {
                let next = record.next_run_at;
                record.mark_enqueued(next);
                record.stop_reason = stop_reason;
                txn.save(record).await?;
                Ok(())
            }
            ExecutionOutcome::Completed(WorkResult::Success(output)) => {
                if output.ensure_within_limit().is_err() {
                    return finish_with_failure(txn, record, FailureCause::OutputTooLarge, now, events)
                        .await;
                }
                if record.is_periodic() {
                    record.output = output;
                    record.start_next_period(now);
                    txn.save(record).await?;
                    tracing::info!(job_id = %record.id, period = record.period_count, next_run_at = %record.next_run_at, "Period completed");
                    events.push(Event::period_completed(
                        record.id,
                        record.job_type(),
                        record.period_count,
                        true,
                    ));
                } else {
                    record.mark_succeeded(output, now);
                    txn.save(record).await?;
                    tracing::info!(job_id = %record.id, job_type = %record.job_type(), duration = ?elapsed, "Job succeeded");
                    events.push(Event::job_succeeded(record.id, record.job_type(), elapsed));
                }
                Ok(())
            }
            ExecutionOutcome::Completed(WorkResult::Failure(reason)) => {
                finish_with_failure(txn, record, FailureCause::Worker(reason), now, events).await
            }
            ExecutionOutcome::Completed(WorkResult::Retry) => {
                let attempts = record.run_attempt_count;
                let max_retries = record.request.max_retries().unwrap_or(self.max_retries);
                if attempts > max_retries {
                    return finish_with_failure(
                        txn,
                        record,
                        FailureCause::RetriesExhausted { attempts },
                        now,
                        events,
                    )
                    .await;
                }

                let delay = record.request.backoff().delay_for(attempts, self.max_backoff);
                record.mark_enqueued(clock::add(now, delay));
                txn.save(record).await?;
                tracing::info!(job_id = %record.id, attempt = attempts, delay = ?delay, "Job will be retried");
                events.push(Event::job_retrying(
                    record.id,
                    record.job_type(),
                    attempts,
                    delay,
                ));
                Ok(())
            }
            ExecutionOutcome::Panicked(detail) => {
                finish_with_failure(txn, record, FailureCause::Panicked(detail), now, events).await
            }
            ExecutionOutcome::Lost(detail) => {
                finish_with_failure(
                    txn,
                    record,
                    FailureCause::RemoteExecutionLost(detail),
                    now,
                    events,
                )
                .await
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Prerequisites {
    Succeeded,
    Pending,
    Failed,
}

async fn prerequisites_state(
    txn: &Txn<'_>,
    record: &JobRecord,
) -> Result<Prerequisites, StoreError> {
    let mut state = Prerequisites::Succeeded;
    for id in &record.prerequisites {
        match txn.get(id).await {
            Ok(prerequisite) => match prerequisite.state {
                JobState::Succeeded => {}
                JobState::Failed | JobState::Cancelled => return Ok(Prerequisites::Failed),
                _ => state = Prerequisites::Pending,
            },
            Err(StoreError::NotFound(_)) => return Ok(Prerequisites::Failed),
            Err(e) => return Err(e),
        }
    }
    Ok(state)
}

/// Own input first, then prerequisite outputs in chain order.
///
/// The inner error describes a merge conflict.
async fn merged_input(
    txn: &Txn<'_>,
    record: &JobRecord,
) -> Result<Result<Data, String>, StoreError> {
    if record.prerequisites.is_empty() {
        return Ok(Ok(record.request.input().clone()));
    }

    let mut inputs: Vec<(JobId, Data)> = vec![(record.id, record.request.input().clone())];
    for id in &record.prerequisites {
        inputs.push((*id, txn.get(id).await?.output));
    }

    let merged = match record.request.input_merger().merge(&inputs) {
        Ok(merged) => merged,
        Err(e) => return Ok(Err(e.to_string())),
    };
    if let Err(e) = merged.ensure_within_limit() {
        return Ok(Err(e.to_string()));
    }
    Ok(Ok(merged))
}
