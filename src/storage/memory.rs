//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobRecord, Storage, StorageError};
use crate::core::state::JobState;
use crate::core::types::JobId;

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    fn filtered(
        &self,
        predicate: impl Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = records.values().filter(|r| predicate(r)).cloned().collect();
        result.sort_by_key(|r| r.sequence);
        Ok(result)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_record(&self, record: JobRecord) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if records.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", record.id)));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn update_record(&self, record: JobRecord) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if !records.contains_key(&record.id) {
            return Err(StorageError::NotFound(format!("job: {}", record.id)));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get_record(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn delete_record(&self, id: &JobId) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        records
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<JobRecord>, StorageError> {
        self.filtered(|_| true)
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StorageError> {
        self.filtered(|r| r.state == state)
    }

    async fn list_by_tag(&self, tag: &str) -> Result<Vec<JobRecord>, StorageError> {
        self.filtered(|r| r.has_tag(tag))
    }

    async fn list_by_unique_name(&self, name: &str) -> Result<Vec<JobRecord>, StorageError> {
        self.filtered(|r| r.unique_name.as_deref() == Some(name))
    }

    async fn max_sequence(&self) -> Result<u64, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.values().map(|r| r.sequence).max().unwrap_or(0))
    }
}
