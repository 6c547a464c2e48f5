//! Resolution of submissions against existing unique work.

use std::collections::HashSet;

use super::{StoreError, SubmitKind, SubmitOutcome, Txn};
use crate::core::request::{ExistingWorkPolicy, JobRequest};
use crate::core::state::{JobState, StopReason};
use crate::core::types::JobId;
use crate::storage::JobRecord;

pub(super) async fn resolve(
    txn: &mut Txn<'_>,
    name: &str,
    policy: ExistingWorkPolicy,
    stages: Vec<Vec<JobRequest>>,
) -> Result<SubmitOutcome, StoreError> {
    let periodic = stages.iter().flatten().any(JobRequest::is_periodic);
    let existing = txn.list_by_unique_name(name).await?;
    let active: Vec<JobId> = existing
        .iter()
        .filter(|r| !r.is_finished())
        .map(|r| r.id)
        .collect();
    let current_generation = existing.iter().map(|r| r.generation).max();
    let next_generation = current_generation.map_or(0, |g| g + 1);

    tracing::debug!(unique_name = %name, policy = ?policy, existing = existing.len(), active = active.len(), "Resolving unique work");

    match policy {
        ExistingWorkPolicy::Keep => {
            if active.is_empty() {
                insert(txn, name, stages, next_generation, Vec::new(), SubmitKind::Inserted).await
            } else {
                Ok(SubmitOutcome {
                    ids: active,
                    kind: SubmitKind::Kept,
                })
            }
        }
        ExistingWorkPolicy::Replace => replace(txn, name, &existing, stages, next_generation).await,
        ExistingWorkPolicy::Append | ExistingWorkPolicy::AppendOrReplace if periodic => {
            Err(StoreError::InvalidOperation(format!(
                "periodic work cannot be appended to '{}'",
                name
            )))
        }
        ExistingWorkPolicy::Append => {
            append(txn, name, &existing, stages, current_generation.unwrap_or(0)).await
        }
        ExistingWorkPolicy::AppendOrReplace => {
            let broken = leaves(&existing)
                .iter()
                .any(|r| matches!(r.state, JobState::Failed | JobState::Cancelled));
            if broken {
                replace(txn, name, &existing, stages, next_generation).await
            } else {
                append(txn, name, &existing, stages, current_generation.unwrap_or(0)).await
            }
        }
        ExistingWorkPolicy::Update => match active.as_slice() {
            [] => insert(txn, name, stages, next_generation, Vec::new(), SubmitKind::Inserted).await,
            [id] => {
                let request = single_request(stages).ok_or_else(|| {
                    StoreError::InvalidOperation(format!(
                        "only a single request can update '{}'",
                        name
                    ))
                })?;
                let result = txn.update(id, request).await?;
                Ok(SubmitOutcome {
                    ids: vec![*id],
                    kind: SubmitKind::Updated(result),
                })
            }
            _ => Err(StoreError::InvalidOperation(format!(
                "'{}' has {} unfinished jobs, cannot update in place",
                name,
                active.len()
            ))),
        },
    }
}

async fn insert(
    txn: &mut Txn<'_>,
    name: &str,
    stages: Vec<Vec<JobRequest>>,
    generation: u32,
    after: Vec<JobId>,
    kind: SubmitKind,
) -> Result<SubmitOutcome, StoreError> {
    let ids = txn.insert_stages(stages, Some(name), generation, after).await?;
    Ok(SubmitOutcome { ids, kind })
}

/// Cancel the unfinished work of the name, release every old record from it
/// and insert the new stages.
async fn replace(
    txn: &mut Txn<'_>,
    name: &str,
    existing: &[JobRecord],
    stages: Vec<Vec<JobRequest>>,
    generation: u32,
) -> Result<SubmitOutcome, StoreError> {
    for record in existing.iter().filter(|r| !r.is_finished()) {
        txn.cancel(&record.id, StopReason::CancelledByCaller).await?;
    }
    for record in existing {
        let mut record = txn.get(&record.id).await?;
        record.unique_name = None;
        txn.save(&mut record).await?;
    }

    let kind = if existing.is_empty() {
        SubmitKind::Inserted
    } else {
        tracing::info!(unique_name = %name, generation, "Replacing unique work");
        SubmitKind::Replaced
    };
    insert(txn, name, stages, generation, Vec::new(), kind).await
}

async fn append(
    txn: &mut Txn<'_>,
    name: &str,
    existing: &[JobRecord],
    stages: Vec<Vec<JobRequest>>,
    generation: u32,
) -> Result<SubmitOutcome, StoreError> {
    if existing.is_empty() {
        return insert(txn, name, stages, generation, Vec::new(), SubmitKind::Inserted).await;
    }
    let after: Vec<JobId> = leaves(existing).iter().map(|r| r.id).collect();
    insert(txn, name, stages, generation, after, SubmitKind::Appended).await
}

/// Records of the name that no other record of the name depends on.
fn leaves(existing: &[JobRecord]) -> Vec<&JobRecord> {
    let ids: HashSet<JobId> = existing.iter().map(|r| r.id).collect();
    existing
        .iter()
        .filter(|r| !r.dependents.iter().any(|d| ids.contains(d)))
        .collect()
}

fn single_request(stages: Vec<Vec<JobRequest>>) -> Option<JobRequest> {
    let mut requests = stages.into_iter().flatten();
    let first = requests.next()?;
    requests.next().is_none().then_some(first)
}
