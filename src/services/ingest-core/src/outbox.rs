//! Transactional outbox forwarder.
//!
//! Writing an event to the database and publishing it to the bus can't be
//! one atomic operation across two different systems, so the outbox row is
//! written inside the *same* `sqlx::Transaction` as the business write
//! (mirroring `event-streaming/src/storage.rs`'s pattern of binding
//! parameters into one `INSERT` against the caller-owned connection) and a
//! background poller forwards unsent rows afterward. A message is
//! published at least once; the poller only deletes a row once the bus
//! publish has been acknowledged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use crate::error::{ErrorCategory, IngestError, Result};
use crate::metrics::MetricsCollector;
use crate::model::MediaEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub event: MediaEvent,
    pub stream_name: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Publishes an event to the bus. Implemented by the production Redis
/// Streams publisher and by an in-memory test double.
#[async_trait::async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, stream_name: &str, event: &MediaEvent) -> Result<()>;
}

/// Storage side of the outbox: writing within the caller's transaction, and
/// reading/clearing unsent rows from the poller.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &MediaEvent,
        stream_name: &str,
    ) -> Result<()>;

    async fn list_unsent(&self, limit: i64) -> Result<Vec<OutboxRecord>>;
    async fn mark_sent(&self, id: i64) -> Result<()>;
    async fn increment_attempts(&self, id: i64) -> Result<()>;
}

/// Postgres-backed outbox table, bootstrapped inline like `dlq_store`'s
/// table and `event-streaming/src/storage.rs`'s `events` table.
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub async fn new(pool: Arc<PgPool>) -> Result<Self> {
        let ddl = r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                event_payload JSONB NOT NULL,
                stream_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                attempts INTEGER NOT NULL DEFAULT 0,
                sent_at TIMESTAMPTZ
            );

            CREATE INDEX IF NOT EXISTS outbox_unsent_idx ON outbox (id) WHERE sent_at IS NULL;
        "#;
        sqlx::query(ddl).execute(&*pool).await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to bootstrap outbox table: {e}"),
                ErrorCategory::Database,
            )
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &MediaEvent,
        stream_name: &str,
    ) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        sqlx::query("INSERT INTO outbox (event_payload, stream_name) VALUES ($1, $2)")
            .bind(payload)
            .bind(stream_name)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                IngestError::retryable_with_category(
                    format!("failed to enqueue outbox row: {e}"),
                    ErrorCategory::Database,
                )
            })?;
        Ok(())
    }

    async fn list_unsent(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            "SELECT id, event_payload, stream_name, created_at, attempts \
             FROM outbox WHERE sent_at IS NULL ORDER BY id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to list unsent outbox rows: {e}"),
                ErrorCategory::Database,
            )
        })?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row.get("event_payload");
                let event: MediaEvent = serde_json::from_value(payload)?;
                Ok(OutboxRecord {
                    id: row.get("id"),
                    event,
                    stream_name: row.get("stream_name"),
                    created_at: row.get("created_at"),
                    attempts: row.get::<i32, _>("attempts") as u32,
                })
            })
            .collect()
    }

    async fn mark_sent(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET sent_at = now() WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                IngestError::retryable_with_category(
                    format!("failed to mark outbox row sent: {e}"),
                    ErrorCategory::Database,
                )
            })?;
        Ok(())
    }

    async fn increment_attempts(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                IngestError::retryable_with_category(
                    format!("failed to bump outbox attempt count: {e}"),
                    ErrorCategory::Database,
                )
            })?;
        Ok(())
    }
}

/// Test double used by handler/router integration tests; stores rows in a
/// `Vec` behind a lock instead of a database.
pub struct InMemoryOutboxStore {
    rows: parking_lot::Mutex<Vec<OutboxRecordState>>,
    next_id: std::sync::atomic::AtomicI64,
}

struct OutboxRecordState {
    record: OutboxRecord,
    sent: bool,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self {
            rows: parking_lot::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly enqueue a row without a transaction, for tests that don't
    /// exercise the "same transaction as the business write" path.
    pub fn enqueue(&self, event: MediaEvent, stream_name: &str) {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.rows.lock().push(OutboxRecordState {
            record: OutboxRecord {
                id,
                event,
                stream_name: stream_name.to_string(),
                created_at: Utc::now(),
                attempts: 0,
            },
            sent: false,
        });
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue_in_tx(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        event: &MediaEvent,
        stream_name: &str,
    ) -> Result<()> {
        self.enqueue(event.clone(), stream_name);
        Ok(())
    }

    async fn list_unsent(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| !r.sent)
            .take(limit.max(0) as usize)
            .map(|r| r.record.clone())
            .collect())
    }

    async fn mark_sent(&self, id: i64) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().find(|r| r.record.id == id) {
            row.sent = true;
        }
        Ok(())
    }

    async fn increment_attempts(&self, id: i64) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().find(|r| r.record.id == id) {
            row.record.attempts += 1;
        }
        Ok(())
    }
}

/// Polls the outbox table and forwards unsent rows to the bus.
pub struct OutboxForwarder<O: OutboxStore, P: BusPublisher> {
    store: Arc<O>,
    publisher: Arc<P>,
    poll_interval: Duration,
    batch_size: i64,
    max_retries: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<O: OutboxStore, P: BusPublisher> OutboxForwarder<O, P> {
    pub fn new(
        store: Arc<O>,
        publisher: Arc<P>,
        poll_interval: Duration,
        batch_size: i64,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            publisher,
            poll_interval,
            batch_size,
            max_retries,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One forwarding pass: publish every currently-unsent row. Returns the
    /// number of rows successfully marked sent. A row that has already
    /// failed `max_retries` times is logged for operator attention and left
    /// untouched rather than retried or dropped.
    pub async fn forward_once(&self) -> Result<usize> {
        let rows = self.store.list_unsent(self.batch_size).await?;
        if let Some(metrics) = &self.metrics {
            metrics.set_outbox_pending(rows.len());
        }
        let mut sent = 0;
        for row in rows {
            if row.attempts >= self.max_retries {
                tracing::error!(
                    id = row.id,
                    attempts = row.attempts,
                    "outbox row exceeded max retries, left in store for operator attention"
                );
                continue;
            }
            match self.publisher.publish(&row.stream_name, &row.event).await {
                Ok(()) => {
                    self.store.mark_sent(row.id).await?;
                    sent += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_outbox_forwarded();
                    }
                }
                Err(err) => {
                    warn!(id = row.id, error = %err, "outbox publish failed, will retry next poll");
                    self.store.increment_attempts(row.id).await?;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_outbox_forward_failed();
                    }
                }
            }
        }
        debug!(sent, "outbox forward pass complete");
        Ok(sent)
    }

    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.forward_once().await {
                        warn!(error = %err, "outbox forward pass errored");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str) -> MediaEvent {
        let mut e = MediaEvent::new_event(Source::Plex);
        e.event_id = id.to_string();
        e.user_id = 1;
        e.title = "t".to_string();
        e
    }

    struct CountingPublisher {
        published: Mutex<Vec<String>>,
        fail_first_n: AtomicUsize,
    }

    use parking_lot::Mutex;

    impl CountingPublisher {
        fn new(fail_first_n: usize) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(fail_first_n),
            }
        }
    }

    #[async_trait::async_trait]
    impl BusPublisher for CountingPublisher {
        async fn publish(&self, _stream_name: &str, event: &MediaEvent) -> Result<()> {
            if self.fail_first_n.load(Ordering::Relaxed) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::Relaxed);
                return Err(IngestError::retryable("bus unavailable"));
            }
            self.published.lock().push(event.event_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_once_marks_published_rows_sent() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue(event("a"), "media.events");
        store.enqueue(event("b"), "media.events");
        let publisher = Arc::new(CountingPublisher::new(0));
        let forwarder = OutboxForwarder::new(store.clone(), publisher.clone(), Duration::from_secs(1), 10, 5);

        let sent = forwarder.forward_once().await.unwrap();
        assert_eq!(sent, 2);
        assert!(store.list_unsent(10).await.unwrap().is_empty());
        assert_eq!(publisher.published.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_publish_leaves_row_unsent_and_bumps_attempts() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue(event("a"), "media.events");
        let publisher = Arc::new(CountingPublisher::new(1));
        let forwarder = OutboxForwarder::new(store.clone(), publisher.clone(), Duration::from_secs(1), 10, 5);

        let sent = forwarder.forward_once().await.unwrap();
        assert_eq!(sent, 0);
        let unsent = store.list_unsent(10).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].attempts, 1);

        let sent = forwarder.forward_once().await.unwrap();
        assert_eq!(sent, 1);
        assert!(store.list_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn row_past_max_retries_is_left_in_store_without_further_attempts() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue(event("a"), "media.events");
        for _ in 0..2 {
            store.increment_attempts(1).await.unwrap();
        }
        let publisher = Arc::new(CountingPublisher::new(0));
        let forwarder = OutboxForwarder::new(store.clone(), publisher.clone(), Duration::from_secs(1), 10, 2);

        let sent = forwarder.forward_once().await.unwrap();
        assert_eq!(sent, 0);
        assert!(publisher.published.lock().is_empty());
        let unsent = store.list_unsent(10).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].attempts, 2);
    }
}
