//! Live observation of job records.
//!
//! Observers are pull-based: `next().await` returns the next snapshot. Each
//! observer starts with the current state, then follows the store's change
//! feed. If the feed overflows the observer falls back to re-reading the
//! store, so a slow consumer skips intermediate snapshots but never sees
//! them out of order.

use futures::Stream;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::core::types::JobId;
use crate::storage::JobRecord;
use crate::store::{JobStore, WorkQuery};

impl JobStore {
    /// Observe one job.
    pub fn observe(self: &Arc<Self>, id: JobId) -> JobObserver {
        JobObserver {
            changes: self.subscribe(),
            store: Arc::clone(self),
            id,
            last_version: None,
            needs_snapshot: true,
        }
    }

    /// Observe every job matching a query.
    pub fn observe_query(self: &Arc<Self>, query: WorkQuery) -> QueryObserver {
        QueryObserver {
            changes: self.subscribe(),
            store: Arc::clone(self),
            query,
            matched: HashSet::new(),
            needs_snapshot: true,
        }
    }
}

/// Stream of snapshots of a single job.
pub struct JobObserver {
    store: Arc<JobStore>,
    id: JobId,
    changes: broadcast::Receiver<JobRecord>,
    last_version: Option<u64>,
    needs_snapshot: bool,
}

impl JobObserver {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Wait for the next snapshot newer than the last one returned.
    ///
    /// The first call returns the current snapshot if the job exists.
    pub async fn next(&mut self) -> Option<JobRecord> {
        loop {
            if self.needs_snapshot {
                self.needs_snapshot = false;
                match self.store.get(&self.id).await {
                    Ok(Some(record)) => {
                        if let Some(record) = self.accept(record) {
                            return Some(record);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %self.id, error = %e, "Failed to read job snapshot");
                    }
                }
                continue;
            }

            match self.changes.recv().await {
                Ok(record) if record.id == self.id => {
                    if let Some(record) = self.accept(record) {
                        return Some(record);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.id, skipped, "Observer lagged, re-reading job");
                    self.needs_snapshot = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, record: JobRecord) -> Option<JobRecord> {
        if self.last_version.is_some_and(|v| record.version <= v) {
            return None;
        }
        self.last_version = Some(record.version);
        Some(record)
    }

    /// Convert into a [`Stream`] of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = JobRecord> {
        futures::stream::unfold(self, |mut observer| async move {
            observer.next().await.map(|record| (record, observer))
        })
    }
}

/// Stream of result sets of a [`WorkQuery`].
pub struct QueryObserver {
    store: Arc<JobStore>,
    query: WorkQuery,
    changes: broadcast::Receiver<JobRecord>,
    matched: HashSet<JobId>,
    needs_snapshot: bool,
}

impl QueryObserver {
    pub fn query(&self) -> &WorkQuery {
        &self.query
    }

    /// Wait for the next result set.
    ///
    /// The first call returns the current matches. Later calls return once
    /// a change touches a record that matches the query, or one that matched
    /// it in the last result set.
    pub async fn next(&mut self) -> Option<Vec<JobRecord>> {
        loop {
            if self.needs_snapshot {
                match self.store.query(&self.query).await {
                    Ok(records) => {
                        self.needs_snapshot = false;
                        self.matched = records.iter().map(|r| r.id).collect();
                        return Some(records);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to run observed query");
                    }
                }
            }

            match self.changes.recv().await {
                Ok(record) => {
                    if self.query.matches(&record) || self.matched.contains(&record.id) {
                        self.needs_snapshot = true;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Query observer lagged, re-running query");
                    self.needs_snapshot = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`] of result sets.
    pub fn into_stream(self) -> impl Stream<Item = Vec<JobRecord>> {
        futures::stream::unfold(self, |mut observer| async move {
            observer.next().await.map(|records| (records, observer))
        })
    }
}
