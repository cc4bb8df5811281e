//! Checkpoint Store: durable `(consumer_name, stream_name)` replay cursors.
//!
//! Grounded in `event-streaming/src/storage.rs`'s upsert-by-unique-key
//! pattern, generalized from the single-row-per-id `events` table to a
//! `(consumer_name, stream_name)` unique pair.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::{ErrorCategory, IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Initialized,
    Running,
    Paused,
    Completed,
    Error,
    Canceled,
}

impl CheckpointStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Initialized => "initialized",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Paused => "paused",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Error => "error",
            CheckpointStatus::Canceled => "canceled",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Completed | CheckpointStatus::Error | CheckpointStatus::Canceled
        )
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "initialized" => CheckpointStatus::Initialized,
            "running" => CheckpointStatus::Running,
            "paused" => CheckpointStatus::Paused,
            "completed" => CheckpointStatus::Completed,
            "error" => CheckpointStatus::Error,
            "canceled" => CheckpointStatus::Canceled,
            _ => CheckpointStatus::Error,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub consumer_name: String,
    pub stream_name: String,
    pub last_sequence: i64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub processed_count: i64,
    pub error_count: i64,
    pub status: CheckpointStatus,
    pub replay_mode: String,
    pub start_sequence: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    pool: Arc<PgPool>,
}

impl CheckpointStore {
    pub async fn new(pool: Arc<PgPool>) -> Result<Self> {
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        let ddl = r#"
            CREATE TABLE IF NOT EXISTS replay_checkpoints (
                id BIGSERIAL PRIMARY KEY,
                consumer_name TEXT NOT NULL,
                stream_name TEXT NOT NULL,
                last_sequence BIGINT NOT NULL DEFAULT 0,
                last_timestamp TIMESTAMPTZ,
                processed_count BIGINT NOT NULL DEFAULT 0,
                error_count BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'initialized',
                replay_mode TEXT NOT NULL DEFAULT 'new',
                start_sequence BIGINT,
                start_time TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (consumer_name, stream_name)
            );
        "#;
        sqlx::query(ddl).execute(&*self.pool).await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to bootstrap replay_checkpoints table: {e}"),
                ErrorCategory::Database,
            )
        })?;

        // A plain `CREATE TABLE IF NOT EXISTS` can leave `updated_at`'s
        // `now()` default unflushed through a crash immediately following
        // schema creation; force a checkpoint so the table survives a
        // subsequent unclean shutdown.
        let _ = sqlx::query("CHECKPOINT").execute(&*self.pool).await;
        Ok(())
    }

    pub async fn upsert(&self, checkpoint: &Checkpoint) -> Result<()> {
        let query = r#"
            INSERT INTO replay_checkpoints (
                consumer_name, stream_name, last_sequence, last_timestamp,
                processed_count, error_count, status, replay_mode,
                start_sequence, start_time, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (consumer_name, stream_name) DO UPDATE SET
                last_sequence = EXCLUDED.last_sequence,
                last_timestamp = EXCLUDED.last_timestamp,
                processed_count = EXCLUDED.processed_count,
                error_count = EXCLUDED.error_count,
                status = EXCLUDED.status,
                updated_at = now()
        "#;
        sqlx::query(query)
            .bind(&checkpoint.consumer_name)
            .bind(&checkpoint.stream_name)
            .bind(checkpoint.last_sequence)
            .bind(checkpoint.last_timestamp)
            .bind(checkpoint.processed_count)
            .bind(checkpoint.error_count)
            .bind(checkpoint.status.as_str())
            .bind(&checkpoint.replay_mode)
            .bind(checkpoint.start_sequence)
            .bind(checkpoint.start_time)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                IngestError::retryable_with_category(
                    format!("failed to upsert checkpoint: {e}"),
                    ErrorCategory::Database,
                )
            })?;
        Ok(())
    }

    pub async fn get(&self, consumer_name: &str, stream_name: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM replay_checkpoints WHERE consumer_name = $1 AND stream_name = $2",
        )
        .bind(consumer_name)
        .bind(stream_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to load checkpoint: {e}"),
                ErrorCategory::Database,
            )
        })?;
        row.map(Self::row_to_checkpoint).transpose()
    }

    /// The checkpoint with the highest `last_sequence` for `stream_name`,
    /// across all consumers.
    pub async fn get_last_for_stream(&self, stream_name: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM replay_checkpoints WHERE stream_name = $1 \
             ORDER BY last_sequence DESC LIMIT 1",
        )
        .bind(stream_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to load last checkpoint for stream: {e}"),
                ErrorCategory::Database,
            )
        })?;
        row.map(Self::row_to_checkpoint).transpose()
    }

    /// Remove checkpoints in a terminal state older than `age`. Non-terminal
    /// (in-progress) checkpoints are never deleted by this sweep.
    pub async fn delete_old(&self, age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - age;
        let result = sqlx::query(
            "DELETE FROM replay_checkpoints \
             WHERE updated_at < $1 AND status IN ('completed', 'error', 'canceled')",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to delete old checkpoints: {e}"),
                ErrorCategory::Database,
            )
        })?;
        Ok(result.rows_affected())
    }

    fn row_to_checkpoint(row: sqlx::postgres::PgRow) -> Result<Checkpoint> {
        let status_str: String = row.get("status");
        Ok(Checkpoint {
            id: row.get("id"),
            consumer_name: row.get("consumer_name"),
            stream_name: row.get("stream_name"),
            last_sequence: row.get("last_sequence"),
            last_timestamp: row.get("last_timestamp"),
            processed_count: row.get("processed_count"),
            error_count: row.get("error_count"),
            status: status_str.parse().unwrap_or(CheckpointStatus::Error),
            replay_mode: row.get("replay_mode"),
            start_sequence: row.get("start_sequence"),
            start_time: row.get("start_time"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_identified_correctly() {
        assert!(CheckpointStatus::Completed.is_terminal());
        assert!(CheckpointStatus::Error.is_terminal());
        assert!(CheckpointStatus::Canceled.is_terminal());
        assert!(!CheckpointStatus::Running.is_terminal());
        assert!(!CheckpointStatus::Initialized.is_terminal());
        assert!(!CheckpointStatus::Paused.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            CheckpointStatus::Initialized,
            CheckpointStatus::Running,
            CheckpointStatus::Paused,
            CheckpointStatus::Completed,
            CheckpointStatus::Error,
            CheckpointStatus::Canceled,
        ] {
            let parsed: CheckpointStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
