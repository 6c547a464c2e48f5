//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Each record is stored
//! as a JSON document next to the columns used for lookups; tags live in
//! their own table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{JobRecord, Storage, StorageError};
use crate::core::state::JobState;
use crate::core::types::JobId;

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_bodies(
        &self,
        sql: &str,
        bind: Option<&str>,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let mut query = sqlx::query_as::<_, (String,)>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(|(body,)| decode_record(&body)).collect()
    }

    async fn write_record(&self, record: &JobRecord, insert: bool) -> Result<(), StorageError> {
        let body = encode_record(record)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let result = if insert {
            sqlx::query(
                r#"
                INSERT INTO job_records (id, sequence, job_type, state, unique_name, version, updated_at, body)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id.to_string())
            .bind(record.sequence as i64)
            .bind(record.job_type())
            .bind(record.state.as_str())
            .bind(&record.unique_name)
            .bind(record.version as i64)
            .bind(datetime_to_string(record.updated_at))
            .bind(&body)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE job_records
                SET job_type = ?, state = ?, unique_name = ?, version = ?, updated_at = ?, body = ?
                WHERE id = ?
                "#,
            )
            .bind(record.job_type())
            .bind(record.state.as_str())
            .bind(&record.unique_name)
            .bind(record.version as i64)
            .bind(datetime_to_string(record.updated_at))
            .bind(&body)
            .bind(record.id.to_string())
            .execute(&mut *tx)
            .await
        };

        match result {
            Ok(done) if !insert && done.rows_affected() == 0 => {
                return Err(StorageError::NotFound(format!("job: {}", record.id)));
            }
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StorageError::DuplicateKey(format!("job: {}", record.id)));
            }
            Err(e) => return Err(StorageError::Other(e.to_string())),
        }

        sqlx::query("DELETE FROM job_tags WHERE job_id = ?")
            .bind(record.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        for tag in record.request.tags() {
            sqlx::query("INSERT INTO job_tags (job_id, tag) VALUES (?, ?)")
                .bind(record.id.to_string())
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))
    }
}

// Helper functions for conversion
fn datetime_to_string(time: DateTime<Utc>) -> String {
    time.timestamp_millis().to_string()
}

fn encode_record(record: &JobRecord) -> Result<String, StorageError> {
    serde_json::to_string(record).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_record(body: &str) -> Result<JobRecord, StorageError> {
    serde_json::from_str(body).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_record(&self, record: JobRecord) -> Result<(), StorageError> {
        self.write_record(&record, true).await
    }

    async fn update_record(&self, record: JobRecord) -> Result<(), StorageError> {
        self.write_record(&record, false).await
    }

    async fn get_record(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let row: (String,) = sqlx::query_as("SELECT body FROM job_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        decode_record(&row.0)
    }

    async fn delete_record(&self, id: &JobId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM job_tags WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let result = sqlx::query("DELETE FROM job_records WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<JobRecord>, StorageError> {
        self.fetch_bodies("SELECT body FROM job_records ORDER BY sequence", None)
            .await
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StorageError> {
        self.fetch_bodies(
            "SELECT body FROM job_records WHERE state = ? ORDER BY sequence",
            Some(state.as_str()),
        )
        .await
    }

    async fn list_by_tag(&self, tag: &str) -> Result<Vec<JobRecord>, StorageError> {
        self.fetch_bodies(
            r#"
            SELECT r.body FROM job_records r
            JOIN job_tags t ON t.job_id = r.id
            WHERE t.tag = ?
            ORDER BY r.sequence
            "#,
            Some(tag),
        )
        .await
    }

    async fn list_by_unique_name(&self, name: &str) -> Result<Vec<JobRecord>, StorageError> {
        self.fetch_bodies(
            "SELECT body FROM job_records WHERE unique_name = ? ORDER BY sequence",
            Some(name),
        )
        .await
    }

    async fn max_sequence(&self) -> Result<u64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM job_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(row.0.max(0) as u64)
    }
}
