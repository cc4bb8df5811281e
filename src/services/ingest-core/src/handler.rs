//! Store Handler: parses, cross-source-deduplicates, and hands events off
//! to the Appender.
//!
//! Grounded in `event-streaming/src/handlers.rs`'s axum-handler shape for
//! "decode, validate, act, record stats" and the teacher's
//! `DashMap`/`AtomicU64` stats bookkeeping pattern from `data-processing`.
//! The four-namespace dedup check in step 3 is this module's central
//! invariant: checking the *same* source's own namespace would treat a
//! retried delivery as a duplicate of itself before it ever succeeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::appender::{Appender, EventSink};
use crate::bus::BusMessage;
use crate::dedup::DedupCache;
use crate::error::{IngestError, Result};
use crate::metrics::MetricsCollector;
use crate::model::{MediaEvent, Source};
use crate::router::MessageHandler;
use crate::serializer;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub enable_cross_source_dedup: bool,
    pub dedup_window: std::time::Duration,
    pub max_dedup_entries: usize,
    pub enable_dedupe_audit: bool,
    pub store_raw_payload: bool,
    pub sync_flush: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            enable_cross_source_dedup: true,
            dedup_window: std::time::Duration::from_secs(300),
            max_dedup_entries: 10_000,
            enable_dedupe_audit: true,
            store_raw_payload: true,
            sync_flush: false,
        }
    }
}

/// Sink for dedupe-decision audit rows. A no-op implementation is fine in
/// deployments that don't need forensic replay of dedup decisions.
#[async_trait::async_trait]
pub trait DedupeAuditStore: Send + Sync {
    async fn record(&self, entry: DedupeAuditEntry);
}

#[derive(Debug, Clone)]
pub struct DedupeAuditEntry {
    pub event_id: String,
    pub session_key: Option<String>,
    pub correlation_key: Option<String>,
    pub dedupe_reason: DedupeReason,
    pub dedupe_layer: &'static str,
    pub raw_payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeReason {
    EventId,
    SessionKey,
    CorrelationKey,
    CrossSourceKey,
}

#[derive(Debug, Default)]
pub struct HandlerStats {
    pub received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub processed: AtomicU64,
}

impl HandlerStats {
    pub fn parse_error_rate(&self) -> f64 {
        let received = self.received.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        self.parse_errors.load(Ordering::Relaxed) as f64 / received as f64
    }
}

/// Parses `MediaEvent`s off the bus, deduplicates across sources, and
/// appends surviving events to the store.
pub struct StoreHandler<S: EventSink> {
    appender: Arc<Appender<S>>,
    dedup_cache: Arc<DedupCache>,
    audit_store: Option<Arc<dyn DedupeAuditStore>>,
    config: HandlerConfig,
    stats: Arc<HandlerStats>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<S: EventSink> StoreHandler<S> {
    pub fn new(
        appender: Arc<Appender<S>>,
        config: HandlerConfig,
        audit_store: Option<Arc<dyn DedupeAuditStore>>,
    ) -> Self {
        let dedup_cache = Arc::new(DedupCache::new(config.max_dedup_entries, config.dedup_window));
        Self {
            appender,
            dedup_cache,
            audit_store,
            config,
            stats: Arc::new(HandlerStats::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> Arc<HandlerStats> {
        self.stats.clone()
    }

    /// Background sweep; run at half the dedup window per the handler's
    /// documented cadence.
    pub async fn run_cleanup_loop(&self, cancel: tokio_util::sync::CancellationToken) {
        let interval = self.config.dedup_window / 2;
        let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.dedup_cache.cleanup_expired(),
            }
        }
    }

    async fn handle_event(&self, payload: &[u8]) -> Result<()> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_event_received();
        }

        let mut event: MediaEvent = match serializer::unmarshal(payload) {
            Ok(event) => event,
            Err(err) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                let ingest_err = IngestError::permanent(format!("failed to parse event: {err}"));
                if let Some(metrics) = &self.metrics {
                    metrics.record_event_parse_error(ingest_err.category());
                }
                return Err(ingest_err);
            }
        };
        event.validate()?;
        if event.correlation_key.is_none() {
            event.set_correlation_key()?;
        }

        if self.config.enable_cross_source_dedup {
            if let Some(reason) = self.find_duplicate(&event) {
                self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_event_duplicate();
                }
                if self.config.enable_dedupe_audit {
                    self.audit(&event, reason, payload).await;
                }
                return Ok(());
            }
        }

        self.appender.enqueue(event.clone())?;
        if self.config.sync_flush {
            self.appender.flush().await?;
        }

        self.record_identities(&event);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_event_processed();
        }
        Ok(())
    }

    /// Check, in order: `event_id`; `session_key` if distinct from
    /// `event_id`; `corr:<correlation_key>`; and for every *other* known
    /// source, `xsrc:<source>:<cross_source_key>`.
    fn find_duplicate(&self, event: &MediaEvent) -> Option<DedupeReason> {
        if self.dedup_cache.contains(&event.event_id) {
            return Some(DedupeReason::EventId);
        }
        if let Some(session_key) = event.session_key.as_deref().filter(|s| !s.is_empty()) {
            if session_key != event.event_id && self.dedup_cache.contains(session_key) {
                return Some(DedupeReason::SessionKey);
            }
        }
        let Some(correlation_key) = event.correlation_key.as_deref() else {
            return None;
        };
        if self.dedup_cache.contains(&format!("corr:{correlation_key}")) {
            return Some(DedupeReason::CorrelationKey);
        }

        let cross_source = MediaEvent::cross_source_key(correlation_key);
        if cross_source.is_empty() {
            return None;
        }
        for other in Source::ALL {
            if other.as_str() == event.source.as_str() {
                continue;
            }
            let key = format!("xsrc:{}:{}", other.as_str(), cross_source);
            if self.dedup_cache.contains(&key) {
                return Some(DedupeReason::CrossSourceKey);
            }
        }
        None
    }

    fn record_identities(&self, event: &MediaEvent) {
        self.dedup_cache.record(&event.event_id);
        if let Some(session_key) = event.session_key.as_deref().filter(|s| !s.is_empty()) {
            self.dedup_cache.record(session_key);
        }
        if let Some(correlation_key) = event.correlation_key.as_deref() {
            self.dedup_cache.record(&format!("corr:{correlation_key}"));
            let cross_source = MediaEvent::cross_source_key(correlation_key);
            if !cross_source.is_empty() {
                let source = MediaEvent::source_from(correlation_key);
                self.dedup_cache.record(&format!("xsrc:{source}:{cross_source}"));
            }
        }
    }

    async fn audit(&self, event: &MediaEvent, reason: DedupeReason, payload: &[u8]) {
        let Some(store) = &self.audit_store else { return };
        let entry = DedupeAuditEntry {
            event_id: event.event_id.clone(),
            session_key: event.session_key.clone(),
            correlation_key: event.correlation_key.clone(),
            dedupe_reason: reason,
            dedupe_layer: "dedup_cache",
            raw_payload: self.config.store_raw_payload.then(|| payload.to_vec()),
        };
        let store = store.clone();
        tokio::spawn(async move { store.record(entry).await });
    }
}

#[async_trait::async_trait]
impl<S: EventSink> MessageHandler for StoreHandler<S> {
    async fn handle(&self, msg: &BusMessage) -> Result<()> {
        debug!(uuid = %msg.uuid, "store handler received message");
        self.handle_event(&msg.payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaType, Source as ModelSource};
    use chrono::Utc;
    use parking_lot::Mutex;

    struct VecSink {
        rows: Mutex<Vec<MediaEvent>>,
    }

    #[async_trait::async_trait]
    impl EventSink for VecSink {
        async fn append_batch(&self, events: &[MediaEvent]) -> Result<()> {
            self.rows.lock().extend(events.iter().cloned());
            Ok(())
        }
    }

    fn base_event(source: ModelSource, event_id: &str, session_key: &str, started_at: chrono::DateTime<Utc>) -> MediaEvent {
        let mut e = MediaEvent::new_event(source);
        e.event_id = event_id.to_string();
        e.session_key = Some(session_key.to_string());
        e.user_id = 12345;
        e.title = "M".to_string();
        e.media_type = MediaType::Movie;
        e.rating_key = Some("54321".to_string());
        e.machine_id = Some("dev-1".to_string());
        e.started_at = Some(started_at);
        e.set_correlation_key().unwrap();
        e
    }

    fn handler() -> (StoreHandler<VecSink>, Arc<VecSink>) {
        let sink = Arc::new(VecSink { rows: Mutex::new(Vec::new()) });
        let appender = Arc::new(Appender::new(sink.clone(), crate::appender::AppenderConfig::default()));
        let handler = StoreHandler::new(appender, HandlerConfig::default(), None);
        (handler, sink)
    }

    #[tokio::test]
    async fn cross_source_dedup_keeps_only_first_event() {
        let (handler, _sink) = handler();
        let started = Utc::now();

        let a = base_event(ModelSource::Plex, "plex-1", "s-p", started);
        let b = base_event(ModelSource::Tautulli, "taut-1", "s-t", started);

        handler.handle_event(&serializer::marshal(&a).unwrap()).await.unwrap();
        handler.handle_event(&serializer::marshal(&b).unwrap()).await.unwrap();

        assert_eq!(handler.appender.buffered_len(), 1);
        assert_eq!(handler.stats.duplicates_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(
            MediaEvent::cross_source_key(a.correlation_key.as_deref().unwrap()),
            MediaEvent::cross_source_key(b.correlation_key.as_deref().unwrap())
        );
        assert_ne!(a.correlation_key, b.correlation_key);
    }

    #[tokio::test]
    async fn same_source_retry_dedupes_on_event_id() {
        let (handler, _sink) = handler();
        let started = Utc::now();
        let a = base_event(ModelSource::Plex, "plex-1", "s-p", started);

        handler.handle_event(&serializer::marshal(&a).unwrap()).await.unwrap();
        handler.handle_event(&serializer::marshal(&a).unwrap()).await.unwrap();

        assert_eq!(handler.appender.buffered_len(), 1);
        assert_eq!(handler.stats.duplicates_skipped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_permanent_and_counts_parse_error() {
        let (handler, _sink) = handler();
        let err = handler.handle_event(b"not json").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(handler.stats.parse_errors.load(Ordering::Relaxed), 1);
    }
}
