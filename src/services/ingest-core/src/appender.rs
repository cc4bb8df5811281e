//! Buffered batch appender.
//!
//! Grounded in `data-processing/src/batch.rs`'s worker-pool shape: a
//! `parking_lot::Mutex`-guarded hot-path buffer paired with a
//! `tokio::sync::Mutex` that serializes flushes so a timer-driven flush and
//! a capacity-driven flush never race each other. Unlike the teacher's
//! worker pool (which dispatches jobs to N concurrent workers), the
//! appender has exactly one flush path: batching exists to amortize sink
//! round-trips, not for parallelism.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{ErrorCategory, IngestError, Result};
use crate::metrics::MetricsCollector;
use crate::model::MediaEvent;

/// Destination for a flushed batch of events. The Store Handler appends
/// through this trait so the appender is agnostic to whether events land in
/// Postgres, an in-memory test double, or something else entirely.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn append_batch(&self, events: &[MediaEvent]) -> Result<()>;
}

/// Postgres-backed sink. Events are stored as JSONB rows keyed by
/// `event_id`, bootstrapped inline like `outbox`'s and `dlq_store`'s
/// tables rather than through a migration runner. `ON CONFLICT DO NOTHING`
/// makes a re-delivered batch (the bus's at-least-once redelivery after a
/// crash before ack) idempotent at the storage layer too.
pub struct PostgresEventSink {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresEventSink {
    pub async fn new(pool: Arc<PgPool>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                event_id TEXT PRIMARY KEY, \
                source TEXT NOT NULL, \
                user_id BIGINT NOT NULL, \
                media_type TEXT NOT NULL, \
                started_at TIMESTAMPTZ, \
                payload JSONB NOT NULL, \
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()\
            )"
        );
        sqlx::query(&ddl).execute(&*pool).await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to bootstrap {table} table: {e}"),
                ErrorCategory::Database,
            )
        })?;
        Ok(Self { pool, table })
    }
}

#[async_trait::async_trait]
impl EventSink for PostgresEventSink {
    async fn append_batch(&self, events: &[MediaEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to start append transaction: {e}"),
                ErrorCategory::Database,
            )
        })?;

        let query = format!(
            "INSERT INTO {} (event_id, source, user_id, media_type, started_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (event_id) DO NOTHING",
            self.table
        );
        for event in events {
            let payload = serde_json::to_value(event)?;
            sqlx::query(&query)
                .bind(&event.event_id)
                .bind(event.source.as_str())
                .bind(event.user_id)
                .bind(event.media_type.as_str())
                .bind(event.started_at)
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    IngestError::retryable_with_category(
                        format!("failed to insert event {}: {e}", event.event_id),
                        ErrorCategory::Database,
                    )
                })?;
        }

        tx.commit().await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to commit append transaction: {e}"),
                ErrorCategory::Database,
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppenderConfig {
    /// Buffer size at which `enqueue` dispatches an asynchronous flush.
    pub max_buffer: usize,
    /// Background flush cadence when the buffer hasn't hit `max_buffer`.
    pub flush_interval: Duration,
    /// Max events per call to `EventSink::append_batch`.
    pub chunk_size: usize,
    /// Destination table name, passed through to SQL-backed sinks.
    pub table: String,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            max_buffer: 1000,
            flush_interval: Duration::from_secs(5),
            chunk_size: 100,
            table: "playback_events".to_string(),
        }
    }
}

/// Buffers events in memory and flushes them to an [`EventSink`] in chunks,
/// either when the buffer fills or on a timer.
///
/// `enqueue`/`start`/`close` take `self: &Arc<Self>` because reaching
/// capacity spawns a background flush (and `start` spawns the timer loop)
/// that needs to own a `'static` handle on the same appender — the same
/// pattern `Router::run` uses elsewhere in this crate.
pub struct Appender<S: EventSink> {
    sink: Arc<S>,
    buffer: Mutex<Vec<MediaEvent>>,
    flush_lock: tokio::sync::Mutex<()>,
    config: AppenderConfig,
    appended: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
    started: AtomicBool,
    inflight_flushes: Arc<AtomicUsize>,
    timer_cancel: Mutex<Option<tokio_util::sync::CancellationToken>>,
    timer_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: EventSink> Appender<S> {
    pub fn new(sink: Arc<S>, config: AppenderConfig) -> Self {
        Self {
            sink,
            buffer: Mutex::new(Vec::with_capacity(config.max_buffer.min(1024))),
            flush_lock: tokio::sync::Mutex::new(()),
            config,
            appended: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            inflight_flushes: Arc::new(AtomicUsize::new(0)),
            timer_cancel: Mutex::new(None),
            timer_handle: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Buffer `event`, returning the buffer length after insertion. Once
    /// that length reaches `max_buffer` an asynchronous flush is spawned
    /// immediately rather than waiting for the next timer tick. Fails if
    /// the appender has been `close()`d.
    pub fn enqueue(self: &Arc<Self>, event: MediaEvent) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push(event);
            buffer.len()
        };

        if len >= self.config.max_buffer {
            self.spawn_flush();
        }

        Ok(len)
    }

    fn spawn_flush(self: &Arc<Self>) {
        let appender = self.clone();
        self.inflight_flushes.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(err) = appender.flush().await {
                warn!(error = %err, "capacity-triggered appender flush failed");
            }
            appender.inflight_flushes.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub fn should_flush(&self) -> bool {
        self.buffer.lock().len() >= self.config.max_buffer
    }

    /// Drain the buffer and flush it to the sink in `chunk_size` pieces.
    /// On a chunk failure, the unflushed tail (the failing chunk and
    /// everything after it) is put back at the front of the buffer so a
    /// later flush can retry it; events already flushed are never retried.
    pub async fn flush(&self) -> Result<usize> {
        let started_at = std::time::Instant::now();
        let _guard = self.flush_lock.lock().await;

        let drained: Vec<MediaEvent> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        let chunks: Vec<Vec<MediaEvent>> = drained
            .chunks(self.config.chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        for (i, chunk) in chunks.iter().enumerate() {
            match self.sink.append_batch(chunk).await {
                Ok(()) => {
                    flushed += chunk.len();
                    self.appended.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    self.failed.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    warn!(error = %err, chunk = i, "appender flush chunk failed, restoring tail to buffer");

                    let mut tail: Vec<MediaEvent> = chunk.clone();
                    for remaining in &chunks[i + 1..] {
                        tail.extend(remaining.iter().cloned());
                    }
                    let mut buffer = self.buffer.lock();
                    tail.append(&mut buffer);
                    *buffer = tail;

                    if let Some(metrics) = &self.metrics {
                        metrics.record_appender_flush(started_at.elapsed(), self.buffered_len(), true);
                    }
                    return Err(err);
                }
            }
        }

        debug!(count = flushed, "appender flush complete");
        if let Some(metrics) = &self.metrics {
            metrics.record_appender_flush(started_at.elapsed(), self.buffered_len(), false);
        }
        Ok(flushed)
    }

    /// Run a background flush loop until `cancel` fires, flushing one final
    /// time before returning so no buffered events are lost on shutdown.
    pub async fn run_flush_timer(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "final appender flush on shutdown failed");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "scheduled appender flush failed");
                    }
                }
            }
        }
    }

    /// Idempotent: launches the periodic flush loop. A second call is a
    /// no-op, matching `close()`'s idempotence on the other side of the
    /// lifecycle.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        *self.timer_cancel.lock() = Some(cancel.clone());
        let appender = self.clone();
        let handle = tokio::spawn(async move { appender.run_flush_timer(cancel).await });
        *self.timer_handle.lock() = Some(handle);
    }

    /// Idempotent: stops the flush timer, waits (bounded by `timeout`) for
    /// any in-flight capacity-triggered flushes to land, then performs one
    /// final synchronous flush. Once closed, `enqueue` fails.
    pub async fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(cancel) = self.timer_cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.timer_handle.lock().take() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inflight_flushes.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Err(err) = self.flush().await {
            warn!(error = %err, "final appender flush on close failed");
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn appended_count(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Capacity-rejection helper used by callers that want a typed error instead
/// of silently growing the buffer past `max_buffer` under sustained
/// overload.
pub fn capacity_error(buffer_len: usize, max_buffer: usize) -> IngestError {
    IngestError::retryable_with_category(
        format!("appender buffer full ({buffer_len}/{max_buffer})"),
        ErrorCategory::Capacity,
    )
}

fn closed_error() -> IngestError {
    IngestError::permanent_with_category("appender is closed".to_string(), ErrorCategory::Capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    struct RecordingSink {
        received: Mutex<Vec<MediaEvent>>,
        /// 0-indexed call number that should fail, or `None` to always succeed.
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
    }

    impl RecordingSink {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                fail_on_call,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn append_batch(&self, events: &[MediaEvent]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_on_call == Some(call) {
                return Err(IngestError::retryable("sink unavailable"));
            }
            self.received.lock().extend(events.iter().cloned());
            Ok(())
        }
    }

    fn event(id: &str) -> MediaEvent {
        let mut e = MediaEvent::new_event(Source::Plex);
        e.event_id = id.to_string();
        e.user_id = 1;
        e.title = "t".to_string();
        e
    }

    #[tokio::test]
    async fn flush_drains_buffer_in_chunks() {
        let sink = Arc::new(RecordingSink::new(None));
        let config = AppenderConfig {
            max_buffer: 100,
            flush_interval: Duration::from_secs(60),
            chunk_size: 2,
            table: "playback_events".to_string(),
        };
        let appender = Arc::new(Appender::new(sink.clone(), config));

        for i in 0..5 {
            appender.enqueue(event(&i.to_string())).unwrap();
        }
        let flushed = appender.flush().await.unwrap();
        assert_eq!(flushed, 5);
        assert_eq!(appender.buffered_len(), 0);
        assert_eq!(sink.received.lock().len(), 5);
        assert_eq!(appender.appended_count(), 5);
    }

    #[tokio::test]
    async fn failed_chunk_restores_unflushed_tail_to_buffer() {
        // First chunk of 2 succeeds, second chunk of 2 fails (call index 1).
        let sink = Arc::new(RecordingSink::new(Some(1)));

        let config = AppenderConfig {
            max_buffer: 100,
            flush_interval: Duration::from_secs(60),
            chunk_size: 2,
            table: "playback_events".to_string(),
        };
        let appender = Arc::new(Appender::new(sink.clone(), config));
        for i in 0..4 {
            appender.enqueue(event(&i.to_string())).unwrap();
        }

        let result = appender.flush().await;
        assert!(result.is_err());
        assert_eq!(appender.buffered_len(), 2);
        assert_eq!(appender.failed_count(), 2);
        assert_eq!(sink.received.lock().len(), 2);
    }

    #[tokio::test]
    async fn should_flush_reports_at_capacity() {
        let sink = Arc::new(RecordingSink::new(None));
        let config = AppenderConfig {
            max_buffer: 2,
            flush_interval: Duration::from_secs(60),
            chunk_size: 10,
            table: "playback_events".to_string(),
        };
        let appender = Arc::new(Appender::new(sink, config));
        assert!(!appender.should_flush());
        appender.enqueue(event("a")).unwrap();
        assert!(!appender.should_flush());
        appender.enqueue(event("b")).unwrap();
        assert!(appender.should_flush());
    }

    #[tokio::test]
    async fn enqueue_at_capacity_dispatches_an_asynchronous_flush() {
        let sink = Arc::new(RecordingSink::new(None));
        let config = AppenderConfig {
            max_buffer: 2,
            flush_interval: Duration::from_secs(60),
            chunk_size: 10,
            table: "playback_events".to_string(),
        };
        let appender = Arc::new(Appender::new(sink.clone(), config));

        appender.enqueue(event("a")).unwrap();
        appender.enqueue(event("b")).unwrap();

        tokio::time::timeout(Duration::from_millis(100), async {
            while sink.received.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("capacity-triggered flush did not complete in time");

        assert_eq!(appender.buffered_len(), 0);
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let sink = Arc::new(RecordingSink::new(None));
        let appender = Arc::new(Appender::new(sink, AppenderConfig::default()));
        appender.close(Duration::from_millis(100)).await;
        let err = appender.enqueue(event("a")).unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn close_performs_a_final_flush() {
        let sink = Arc::new(RecordingSink::new(None));
        let appender = Arc::new(Appender::new(sink.clone(), AppenderConfig::default()));
        appender.enqueue(event("a")).unwrap();

        appender.close(Duration::from_millis(200)).await;

        assert_eq!(sink.received.lock().len(), 1);
        assert_eq!(appender.buffered_len(), 0);
    }

    #[tokio::test]
    async fn start_and_close_are_idempotent() {
        let sink = Arc::new(RecordingSink::new(None));
        let appender = Arc::new(Appender::new(sink, AppenderConfig::default()));
        appender.start();
        appender.start();
        appender.close(Duration::from_millis(100)).await;
        appender.close(Duration::from_millis(100)).await;
    }
}
