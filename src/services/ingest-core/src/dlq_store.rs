//! Postgres-backed mirror of the in-memory [`crate::dlq::DeadLetterQueue`].
//!
//! Grounded in `event-streaming/src/storage.rs`: the same inline
//! `CREATE TABLE IF NOT EXISTS` bootstrap run at startup instead of a
//! migration runner, and the same `INSERT ... ON CONFLICT (id) DO UPDATE`
//! upsert shape. Writes are fire-and-forget from the hot path — spawned
//! onto their own task and bounded by a timeout — so a slow or unavailable
//! database never blocks dead-lettering an event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::dlq::DlqEntry;
use crate::error::{ErrorCategory, IngestError, Result};
use crate::model::MediaEvent;

/// Durable mirror of the in-memory DLQ, keyed by `event_id`.
pub struct DlqStore {
    pool: Arc<PgPool>,
    write_timeout: Duration,
}

impl DlqStore {
    pub async fn new(pool: Arc<PgPool>) -> Result<Self> {
        Self::bootstrap(&pool).await?;
        Ok(Self {
            pool,
            write_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    async fn bootstrap(pool: &PgPool) -> Result<()> {
        let ddl = r#"
            CREATE TABLE IF NOT EXISTS dlq_entries (
                event_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                original_error TEXT NOT NULL,
                last_error TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                category TEXT NOT NULL,
                first_failure TIMESTAMPTZ NOT NULL,
                last_failure TIMESTAMPTZ NOT NULL,
                next_retry TIMESTAMPTZ NOT NULL,
                event_payload JSONB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS dlq_entries_first_failure_idx
                ON dlq_entries (first_failure);
            CREATE INDEX IF NOT EXISTS dlq_entries_next_retry_idx
                ON dlq_entries (next_retry);
        "#;

        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to bootstrap dlq_entries table: {e}"),
                ErrorCategory::Database,
            ))?;
        Ok(())
    }

    /// Upsert `entry`, spawned off the caller's task with a bounded timeout.
    /// Never propagates a failure back to the hot path — persistence here is
    /// best-effort durability for crash recovery, not a correctness
    /// dependency of the in-memory queue.
    pub fn persist(&self, entry: DlqEntry) {
        let pool = self.pool.clone();
        let timeout = self.write_timeout;
        tokio::spawn(async move {
            let write = Self::upsert(&pool, &entry);
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event_id = %entry.event.event_id, error = %err, "failed to persist DLQ entry");
                }
                Err(_) => {
                    warn!(event_id = %entry.event.event_id, "timed out persisting DLQ entry");
                }
            }
        });
    }

    async fn upsert(pool: &PgPool, entry: &DlqEntry) -> Result<()> {
        let payload = serde_json::to_value(&entry.event)?;

        let query = r#"
            INSERT INTO dlq_entries (
                event_id, message_id, original_error, last_error, retry_count,
                category, first_failure, last_failure, next_retry, event_payload
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id) DO UPDATE SET
                last_error = EXCLUDED.last_error,
                retry_count = EXCLUDED.retry_count,
                category = EXCLUDED.category,
                last_failure = EXCLUDED.last_failure,
                next_retry = EXCLUDED.next_retry
        "#;

        sqlx::query(query)
            .bind(&entry.event.event_id)
            .bind(&entry.message_id)
            .bind(&entry.original_error)
            .bind(&entry.last_error)
            .bind(entry.retry_count as i32)
            .bind(entry.category.to_string())
            .bind(entry.first_failure)
            .bind(entry.last_failure)
            .bind(entry.next_retry)
            .bind(payload)
            .execute(pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to upsert dlq entry: {e}"),
                ErrorCategory::Database,
            ))?;
        Ok(())
    }

    /// Remove a persisted entry. Called once the in-memory queue has
    /// successfully retried or permanently dropped it.
    pub async fn delete(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM dlq_entries WHERE event_id = $1")
            .bind(event_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to delete dlq entry: {e}"),
                ErrorCategory::Database,
            ))?;
        Ok(())
    }

    /// Delete all entries whose `first_failure` is older than `cutoff`.
    /// Returns the number of rows removed.
    pub async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dlq_entries WHERE first_failure < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to delete expired dlq entries: {e}"),
                ErrorCategory::Database,
            ))?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM dlq_entries")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to count dlq entries: {e}"),
                ErrorCategory::Database,
            ))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    /// Load all persisted entries in `first_failure` order, for recovery
    /// into the in-memory heap on startup.
    pub async fn list(&self) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query("SELECT * FROM dlq_entries ORDER BY first_failure ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| IngestError::retryable_with_category(
                format!("failed to list dlq entries: {e}"),
                ErrorCategory::Database,
            ))?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<DlqEntry> {
        let payload: serde_json::Value = row.get("event_payload");
        let event: MediaEvent = serde_json::from_value(payload)?;
        let category_str: String = row.get("category");

        Ok(DlqEntry {
            event,
            message_id: row.get("message_id"),
            original_error: row.get("original_error"),
            last_error: row.get("last_error"),
            retry_count: row.get::<i32, _>("retry_count") as u32,
            first_failure: row.get("first_failure"),
            last_failure: row.get("last_failure"),
            next_retry: row.get("next_retry"),
            category: category_str.parse().unwrap_or(ErrorCategory::Unknown),
        })
    }
}
