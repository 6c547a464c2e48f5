//! The job record store.
//!
//! [`JobStore`] owns every [`JobRecord`] and is the only component that
//! mutates them. All mutations are serialized behind one lock, persisted
//! through a [`Storage`] backend and published on a change feed that
//! observers subscribe to.

mod query;
mod unique;

pub use query::WorkQuery;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, MutexGuard, Notify, broadcast};

use crate::core::chain::{Chain, ChainError};
use crate::core::clock::{self, Clock, SystemClock};
use crate::core::request::{ExistingWorkPolicy, JobRequest};
use crate::core::state::{JobState, StopReason};
use crate::core::types::JobId;
use crate::storage::{InMemoryStorage, JobRecord, Storage, StorageError};

/// Capacity of the change feed before slow observers start lagging.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The chain is malformed.
    #[error("invalid chain: {0}")]
    InvalidChain(#[from] ChainError),

    /// The operation is not allowed for this request.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How a submission was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    /// New records were inserted.
    Inserted,
    /// Existing unfinished work was kept; nothing was inserted.
    Kept,
    /// Existing work was cancelled and new records were inserted.
    Replaced,
    /// New records were inserted after the existing work.
    Appended,
    /// The existing record was updated in place.
    Updated(UpdateResult),
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Ids of the inserted records, or of the records that were kept or updated.
    pub ids: Vec<JobId>,
    pub kind: SubmitKind,
}

impl SubmitOutcome {
    /// First id of the outcome.
    pub fn id(&self) -> Option<JobId> {
        self.ids.first().copied()
    }
}

/// Result of [`JobStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The record is finished or the change is not allowed in its state.
    NotApplied,
    /// The record was waiting; the new request is in effect now.
    AppliedImmediately,
    /// The record is running; the new request takes over when it finishes.
    AppliedForNextRun,
}

pub(crate) struct StoreState {
    next_sequence: u64,
    forced_constraints: HashSet<JobId>,
    forced_delay: HashSet<JobId>,
}

/// Persistent, observable collection of job records.
pub struct JobStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
    changes: broadcast::Sender<JobRecord>,
    wake: Notify,
}

impl JobStore {
    /// Open a store over a storage backend.
    ///
    /// Sequence numbers continue after the highest one already stored.
    pub async fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let max_sequence = storage.max_sequence().await?;
        Ok(Self::with_parts(storage, clock, max_sequence + 1))
    }

    /// Create a store backed by memory and the system clock.
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Create a store backed by memory with a custom clock.
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(Arc::new(InMemoryStorage::new()), clock, 1)
    }

    fn with_parts(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, next_sequence: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            storage,
            clock,
            state: Mutex::new(StoreState {
                next_sequence,
                forced_constraints: HashSet::new(),
                forced_delay: HashSet::new(),
            }),
            changes,
            wake: Notify::new(),
        }
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Enqueue a request.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, StoreError> {
        let mut txn = self.lock().await;
        let ids = txn.insert_stages(vec![vec![request]], None, 0, Vec::new()).await?;
        drop(txn);
        self.wake();
        ids.into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidOperation("no record inserted".to_string()))
    }

    /// Enqueue a request under a unique name.
    pub async fn submit_unique(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        request: JobRequest,
    ) -> Result<SubmitOutcome, StoreError> {
        let mut txn = self.lock().await;
        let outcome = unique::resolve(&mut txn, name, policy, vec![vec![request]]).await?;
        drop(txn);
        self.wake();
        Ok(outcome)
    }

    /// Enqueue a chain, returning the ids of its records in stage order.
    ///
    /// A chain bound to a unique name is resolved like
    /// [`submit_unique`](Self::submit_unique); if existing work is kept the
    /// returned ids are those of the kept records.
    pub async fn submit_chain(&self, chain: Chain) -> Result<Vec<JobId>, StoreError> {
        chain.validate()?;
        let (stages, unique) = chain.into_parts();

        let mut txn = self.lock().await;
        let ids = match unique {
            Some((name, policy)) => unique::resolve(&mut txn, &name, policy, stages).await?.ids,
            None => txn.insert_stages(stages, None, 0, Vec::new()).await?,
        };
        drop(txn);
        self.wake();
        Ok(ids)
    }

    /// Current snapshot of a record.
    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        match self.storage.get_record(id).await {
            Ok(record) => Ok(Some(record)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Records carrying a tag.
    pub async fn by_tag(&self, tag: &str) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.storage.list_by_tag(tag).await?)
    }

    /// Records bound to a unique name.
    pub async fn by_unique_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.storage.list_by_unique_name(name).await?)
    }

    /// Records in a state.
    pub async fn by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.storage.list_by_state(state).await?)
    }

    /// Every record, in submission order.
    pub async fn all(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.storage.list_records().await?)
    }

    /// Records matching a query, in submission order.
    pub async fn query(&self, query: &WorkQuery) -> Result<Vec<JobRecord>, StoreError> {
        let records = self.storage.list_records().await?;
        Ok(records.into_iter().filter(|r| query.matches(r)).collect())
    }

    /// Replace the request behind an existing id.
    pub async fn update(&self, id: &JobId, request: JobRequest) -> Result<UpdateResult, StoreError> {
        let mut txn = self.lock().await;
        let result = txn.update(id, request).await?;
        drop(txn);
        if result != UpdateResult::NotApplied {
            self.wake();
        }
        Ok(result)
    }

    /// Cancel a record and its dependents.
    pub async fn cancel(&self, id: &JobId) -> Result<usize, StoreError> {
        let mut txn = self.lock().await;
        txn.get(id).await?;
        let count = txn.cancel(id, StopReason::CancelledByCaller).await?;
        drop(txn);
        self.wake();
        Ok(count)
    }

    /// Cancel every record carrying a tag.
    pub async fn cancel_by_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let records = self.storage.list_by_tag(tag).await?;
        self.cancel_records(records).await
    }

    /// Cancel all unfinished work of a unique name.
    pub async fn cancel_unique(&self, name: &str) -> Result<usize, StoreError> {
        let records = self.storage.list_by_unique_name(name).await?;
        self.cancel_records(records).await
    }

    /// Cancel every unfinished record.
    pub async fn cancel_all(&self) -> Result<usize, StoreError> {
        let records = self.storage.list_records().await?;
        self.cancel_records(records).await
    }

    async fn cancel_records(&self, records: Vec<JobRecord>) -> Result<usize, StoreError> {
        let mut txn = self.lock().await;
        let mut count = 0;
        for record in records {
            count += txn.cancel(&record.id, StopReason::CancelledByCaller).await?;
        }
        drop(txn);
        if count > 0 {
            self.wake();
        }
        Ok(count)
    }

    /// Delete finished records that finished at least `older_than` ago.
    ///
    /// Records still referenced by unfinished dependents are kept.
    pub async fn prune_finished(&self, older_than: Duration) -> Result<usize, StoreError> {
        let mut txn = self.lock().await;
        let cutoff = clock::sub(txn.now(), older_than);
        let records = txn.list().await?;

        let unfinished: HashSet<JobId> = records
            .iter()
            .filter(|r| !r.is_finished())
            .map(|r| r.id)
            .collect();

        let mut pruned = 0;
        for record in &records {
            let expired = record.is_finished() && record.finished_at.is_some_and(|t| t <= cutoff);
            let referenced = record.dependents.iter().any(|d| unfinished.contains(d));
            if expired && !referenced {
                self.storage.delete_record(&record.id).await?;
                txn.forget_forced(&record.id);
                pruned += 1;
            }
        }

        if pruned > 0 {
            tracing::info!(count = pruned, "Pruned finished jobs");
        }
        Ok(pruned)
    }

    /// Return records left `Running` by a previous process to the queue.
    pub async fn recover(&self) -> Result<Vec<JobId>, StoreError> {
        let mut txn = self.lock().await;
        let running = txn.list_by_state(JobState::Running).await?;

        let mut recovered = Vec::with_capacity(running.len());
        for mut record in running {
            let next_run_at = record.next_run_at;
            record.mark_enqueued(next_run_at);
            record.stop_reason = StopReason::Unknown;
            txn.save(&mut record).await?;
            tracing::info!(job_id = %record.id, job_type = %record.job_type(), "Recovered interrupted job");
            recovered.push(record.id);
        }
        drop(txn);

        if !recovered.is_empty() {
            self.wake();
        }
        Ok(recovered)
    }

    /// Subscribe to every persisted record change.
    pub fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.changes.subscribe()
    }

    /// Ask the scheduler to run a dispatch cycle.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub(crate) async fn lock(&self) -> Txn<'_> {
        Txn {
            store: self,
            state: self.state.lock().await,
        }
    }

    pub(crate) async fn force_constraints(&self, id: &JobId) -> Result<(), StoreError> {
        let mut txn = self.lock().await;
        txn.get(id).await?;
        txn.state.forced_constraints.insert(*id);
        drop(txn);
        self.wake();
        Ok(())
    }

    pub(crate) async fn force_delay(&self, id: &JobId) -> Result<(), StoreError> {
        let mut txn = self.lock().await;
        txn.get(id).await?;
        txn.state.forced_delay.insert(*id);
        drop(txn);
        self.wake();
        Ok(())
    }
}

/// Exclusive access to the store for a sequence of mutations.
pub(crate) struct Txn<'a> {
    store: &'a JobStore,
    state: MutexGuard<'a, StoreState>,
}

impl Txn<'_> {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.store.clock.now()
    }

    pub(crate) async fn get(&self, id: &JobId) -> Result<JobRecord, StoreError> {
        match self.store.storage.get_record(id).await {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound(_)) => Err(StoreError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.store.storage.list_records().await?)
    }

    pub(crate) async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.store.storage.list_by_state(state).await?)
    }

    pub(crate) async fn list_by_unique_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.store.storage.list_by_unique_name(name).await?)
    }

    /// Persist a changed record and publish it.
    pub(crate) async fn save(&mut self, record: &mut JobRecord) -> Result<(), StoreError> {
        record.version += 1;
        record.updated_at = self.now();
        self.store.storage.update_record(record.clone()).await?;
        if record.is_finished() {
            self.forget_forced(&record.id);
        }
        let _ = self.store.changes.send(record.clone());
        Ok(())
    }

    async fn insert(&mut self, record: &mut JobRecord) -> Result<(), StoreError> {
        record.version = 1;
        record.updated_at = self.now();
        self.store.storage.insert_record(record.clone()).await?;
        let _ = self.store.changes.send(record.clone());
        Ok(())
    }

    fn new_record(&mut self, request: JobRequest) -> JobRecord {
        let sequence = self.state.next_sequence;
        self.state.next_sequence += 1;
        JobRecord::new(request, sequence, self.now())
    }

    /// Insert chain stages; every record of a stage depends on the whole previous stage.
    ///
    /// `after` lists existing records the first stage depends on.
    pub(crate) async fn insert_stages(
        &mut self,
        stages: Vec<Vec<JobRequest>>,
        unique_name: Option<&str>,
        generation: u32,
        after: Vec<JobId>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut states: HashMap<JobId, JobState> = HashMap::new();
        for id in &after {
            states.insert(*id, self.get(id).await?.state);
        }

        let mut inserted = Vec::new();
        let mut previous = after;
        for stage in stages {
            let mut current = Vec::with_capacity(stage.len());
            for request in stage {
                let mut record = self.new_record(request);
                record.unique_name = unique_name.map(str::to_string);
                record.generation = generation;
                record.state = initial_state(previous.iter().filter_map(|p| states.get(p)));
                if record.state == JobState::Cancelled {
                    record.finished_at = Some(record.enqueued_at);
                }
                record.prerequisites = previous.clone();
                self.insert(&mut record).await?;

                tracing::debug!(job_id = %record.id, job_type = %record.job_type(), state = %record.state, "Job submitted");
                states.insert(record.id, record.state);
                current.push(record.id);
            }

            for id in &previous {
                let mut prerequisite = self.get(id).await?;
                prerequisite.dependents.extend(current.iter().copied());
                self.save(&mut prerequisite).await?;
            }

            inserted.extend(current.iter().copied());
            previous = current;
        }
        Ok(inserted)
    }

    pub(crate) async fn update(
        &mut self,
        id: &JobId,
        request: JobRequest,
    ) -> Result<UpdateResult, StoreError> {
        let mut record = self.get(id).await?;
        let request = request.with_id(*id);

        if record.is_finished() || record.is_periodic() != request.is_periodic() {
            return Ok(UpdateResult::NotApplied);
        }

        let result = match record.state {
            JobState::Running => {
                if record.job_type() != request.job_type() {
                    return Ok(UpdateResult::NotApplied);
                }
                record.pending_request = Some(request);
                UpdateResult::AppliedForNextRun
            }
            _ => {
                record.next_run_at = match record.last_started_at {
                    None => request.first_run_at(record.enqueued_at),
                    Some(started) => request.next_period_at(started).unwrap_or(record.next_run_at),
                };
                record.request = request;
                UpdateResult::AppliedImmediately
            }
        };

        record.generation += 1;
        self.save(&mut record).await?;
        tracing::info!(job_id = %id, generation = record.generation, result = ?result, "Job updated");
        Ok(result)
    }

    /// Cancel a record and its transitive dependents. Returns how many
    /// records transitioned.
    pub(crate) async fn cancel(&mut self, id: &JobId, reason: StopReason) -> Result<usize, StoreError> {
        let mut queue = VecDeque::from([*id]);
        let mut seen = HashSet::new();
        let mut count = 0;

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            let mut record = match self.get(&next).await {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            queue.extend(record.dependents.iter().copied());

            if record.is_finished() {
                continue;
            }
            let now = self.now();
            record.mark_cancelled(reason, now);
            self.save(&mut record).await?;
            tracing::info!(job_id = %record.id, job_type = %record.job_type(), "Job cancelled");
            count += 1;
        }
        Ok(count)
    }

    /// Cancel the transitive dependents of a record that did not succeed.
    pub(crate) async fn cancel_dependents(&mut self, record: &JobRecord) -> Result<usize, StoreError> {
        let mut count = 0;
        for dependent in &record.dependents {
            count += self.cancel(dependent, StopReason::NotStopped).await?;
        }
        Ok(count)
    }

    pub(crate) fn constraints_forced(&self, id: &JobId) -> bool {
        self.state.forced_constraints.contains(id)
    }

    pub(crate) fn delay_forced(&self, id: &JobId) -> bool {
        self.state.forced_delay.contains(id)
    }

    pub(crate) fn clear_forced_delay(&mut self, id: &JobId) {
        self.state.forced_delay.remove(id);
    }

    /// Forcing constraints lasts for one execution.
    pub(crate) fn clear_forced_constraints(&mut self, id: &JobId) {
        self.state.forced_constraints.remove(id);
    }

    fn forget_forced(&mut self, id: &JobId) {
        self.state.forced_constraints.remove(id);
        self.state.forced_delay.remove(id);
    }
}

/// State of a new record given the states of its prerequisites.
fn initial_state<'a>(prerequisites: impl Iterator<Item = &'a JobState>) -> JobState {
    let mut state = JobState::Enqueued;
    for prerequisite in prerequisites {
        match prerequisite {
            JobState::Failed | JobState::Cancelled => return JobState::Cancelled,
            JobState::Succeeded => {}
            _ => state = JobState::Blocked,
        }
    }
    state
}
