//! In-memory dead-letter queue.
//!
//! Grounded in `integration/src/webhook/queue.rs` (dead-letter entry shape,
//! replay-attempt counters) and `.../retry.rs` (`RetryStrategy::Exponential`
//! with jitter). The heap is a `BinaryHeap<Reverse<...>>` keyed by
//! `first_failure`, paired with a `HashMap` index for O(1) `event_id`
//! lookup, both behind one `parking_lot::RwLock`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{classify_message, ErrorCategory};
use crate::metrics::MetricsCollector;
use crate::model::MediaEvent;

/// A dead-lettered event and its retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub event: MediaEvent,
    pub message_id: String,
    pub original_error: String,
    pub last_error: String,
    pub retry_count: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    pub next_retry: DateTime<Utc>,
    pub category: ErrorCategory,
}

/// Exponential backoff with jitter: `min(initial * multiplier^n, max) *
/// (1 + uniform(-jitter, +jitter))`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
    /// Deterministic seed for tests. `None` uses OS entropy (the default
    /// wall-clock-derived behaviour).
    pub seed: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: 0.1,
            seed: None,
        }
    }
}

impl BackoffPolicy {
    pub fn compute(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(attempt as u64)),
            None => StdRng::from_entropy(),
        };
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

#[derive(Clone, Debug)]
struct HeapKey {
    first_failure: DateTime<Utc>,
    event_id: String,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.first_failure == other.first_failure && self.event_id == other.event_id
    }
}
impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.first_failure
            .cmp(&other.first_failure)
            .then_with(|| self.event_id.cmp(&other.event_id))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<HeapKey>>,
    index: HashMap<String, DlqEntry>,
}

impl Inner {
    fn rebuild_heap(&mut self) {
        self.heap = self
            .index
            .values()
            .map(|entry| {
                Reverse(HeapKey {
                    first_failure: entry.first_failure,
                    event_id: entry.event.event_id.clone(),
                })
            })
            .collect();
    }
}

/// Bounded, persistent-in-memory dead-letter queue.
pub struct DeadLetterQueue {
    inner: RwLock<Inner>,
    pub max_entries: usize,
    pub max_retries: u32,
    pub retention: chrono::Duration,
    pub backoff: BackoffPolicy,
    expired: AtomicU64,
    metrics: Option<std::sync::Arc<MetricsCollector>>,
}

impl DeadLetterQueue {
    pub fn new(
        max_entries: usize,
        max_retries: u32,
        retention: chrono::Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                heap: BinaryHeap::new(),
                index: HashMap::new(),
            }),
            max_entries,
            max_retries,
            retention,
            backoff,
            expired: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: std::sync::Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn report_entries(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_dlq_entries(count);
        }
    }

    /// Add a newly failed event. Never fails; inserting at capacity evicts
    /// the entry with the oldest `first_failure` and increments the
    /// expired counter.
    pub fn add(&self, event: MediaEvent, error: String, message_id: String) -> DlqEntry {
        let now = Utc::now();
        let category = classify_message(&error);
        let entry = DlqEntry {
            event,
            message_id,
            original_error: error.clone(),
            last_error: error,
            retry_count: 0,
            first_failure: now,
            last_failure: now,
            next_retry: now + self.backoff.compute(0),
            category,
        };

        let mut inner = self.inner.write();
        inner.heap.push(Reverse(HeapKey {
            first_failure: entry.first_failure,
            event_id: entry.event.event_id.clone(),
        }));
        inner.index.insert(entry.event.event_id.clone(), entry.clone());

        if inner.index.len() > self.max_entries {
            self.evict_oldest_locked(&mut inner);
        }

        if inner.heap.len() > inner.index.len() * 2 + 16 {
            inner.rebuild_heap();
        }

        self.report_entries(inner.index.len());
        entry
    }

    fn evict_oldest_locked(&self, inner: &mut Inner) {
        while let Some(Reverse(candidate)) = inner.heap.pop() {
            if inner.index.remove(&candidate.event_id).is_some() {
                self.expired.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_dlq_expired();
                }
                return;
            }
            // stale heap entry from a prior explicit remove(); skip it.
        }
    }

    /// Record a failed retry attempt. Returns whether another retry should
    /// be attempted (`retry_count < max_retries`). Returns `false` if the
    /// event is not present.
    pub fn increment_retry(&self, event_id: &str, error: String) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.index.get_mut(event_id) else {
            return false;
        };

        entry.retry_count += 1;
        entry.last_error = error.clone();
        entry.last_failure = Utc::now();
        entry.category = classify_message(&error);
        entry.next_retry = entry.last_failure + self.backoff.compute(entry.retry_count);

        entry.retry_count < self.max_retries
    }

    /// Remove an entry by event id. Returns whether it was present.
    pub fn remove(&self, event_id: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.index.remove(event_id).is_some();
        if removed {
            self.report_entries(inner.index.len());
        }
        removed
    }

    /// All entries whose `next_retry` has elapsed and retry budget remains.
    pub fn get_pending_retries(&self) -> Vec<DlqEntry> {
        let inner = self.inner.read();
        let now = Utc::now();
        inner
            .index
            .values()
            .filter(|entry| entry.next_retry <= now && entry.retry_count < self.max_retries)
            .cloned()
            .collect()
    }

    /// Remove all entries older than the configured retention.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.write();
        let cutoff = Utc::now() - self.retention;
        let before = inner.index.len();
        inner.index.retain(|_, entry| entry.first_failure >= cutoff);
        inner.rebuild_heap();
        let removed = before - inner.index.len();
        if removed > 0 {
            self.report_entries(inner.index.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn get(&self, event_id: &str) -> Option<DlqEntry> {
        self.inner.read().index.get(event_id).cloned()
    }
}

/// Callback invoked by [`AutoRetryWorker`] for each pending retry.
#[async_trait::async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, event: &MediaEvent) -> crate::error::Result<()>;
}

/// Background worker that periodically drains pending DLQ retries under a
/// concurrency semaphore, mirroring the `BatchWorkerPool`/`Semaphore`
/// pattern in `data-processing/src/batch.rs`.
pub struct AutoRetryWorker {
    dlq: std::sync::Arc<DeadLetterQueue>,
    handler: std::sync::Arc<dyn RetryHandler>,
    interval: Duration,
    concurrency: usize,
    metrics: Option<std::sync::Arc<MetricsCollector>>,
}

impl AutoRetryWorker {
    pub fn new(
        dlq: std::sync::Arc<DeadLetterQueue>,
        handler: std::sync::Arc<dyn RetryHandler>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            dlq,
            handler,
            interval,
            concurrency,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: std::sync::Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `cancel` fires. Idempotent to call `cancel.cancel()`
    /// multiple times.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("auto-retry worker stopping on cancellation");
                    return;
                }
                _ = ticker.tick() => {
                    self.drain_once(&semaphore, &cancel).await;
                }
            }
        }
    }

    async fn drain_once(
        &self,
        semaphore: &std::sync::Arc<tokio::sync::Semaphore>,
        cancel: &tokio_util::sync::CancellationToken,
    ) {
        let pending = self.dlq.get_pending_retries();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "draining pending DLQ retries");

        let mut tasks = tokio::task::JoinSet::new();
        for entry in pending {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let dlq = self.dlq.clone();
            let handler = self.handler.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let event_id = entry.event.event_id.clone();
                match handler.retry(&entry.event).await {
                    Ok(()) => {
                        dlq.remove(&event_id);
                    }
                    Err(err) => {
                        if let Some(metrics) = &metrics {
                            metrics.record_dlq_retry();
                        }
                        if !dlq.increment_retry(&event_id, err.message().to_string()) {
                            tracing::warn!(event_id = %event_id, "DLQ entry exhausted retries");
                        }
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn event(id: &str) -> MediaEvent {
        let mut e = MediaEvent::new_event(Source::Plex);
        e.event_id = id.to_string();
        e.user_id = 1;
        e.title = "t".to_string();
        e
    }

    #[test]
    fn add_then_remove_restores_heap_size() {
        let dlq = DeadLetterQueue::new(10, 5, chrono::Duration::days(7), BackoffPolicy::default());
        dlq.add(event("a"), "boom".into(), "m1".into());
        assert_eq!(dlq.len(), 1);
        assert!(dlq.remove("a"));
        assert_eq!(dlq.len(), 0);
    }

    #[test]
    fn capacity_eviction_increments_expired_by_one() {
        let dlq = DeadLetterQueue::new(1, 5, chrono::Duration::days(7), BackoffPolicy::default());
        dlq.add(event("a"), "boom".into(), "m1".into());
        dlq.add(event("b"), "boom".into(), "m2".into());
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.expired_count(), 1);
        assert!(dlq.get("a").is_none());
        assert!(dlq.get("b").is_some());
    }

    #[test]
    fn increment_retry_respects_max_retries() {
        let dlq = DeadLetterQueue::new(10, 3, chrono::Duration::days(7), BackoffPolicy::default());
        dlq.add(event("a"), "boom".into(), "m1".into());
        assert!(dlq.increment_retry("a", "boom".into()));
        assert!(dlq.increment_retry("a", "boom".into()));
        assert!(!dlq.increment_retry("a", "boom".into()));
        assert_eq!(dlq.get("a").unwrap().retry_count, 3);
    }

    #[test]
    fn backoff_scheduling_matches_scenario() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: 0.0,
            seed: Some(0),
        };
        let dlq = DeadLetterQueue::new(10, 3, chrono::Duration::days(7), backoff);
        dlq.add(event("a"), "boom".into(), "m1".into());

        assert!(dlq.get_pending_retries().is_empty());
        std::thread::sleep(Duration::from_millis(15));
        let pending = dlq.get_pending_retries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.event_id, "a");

        assert!(dlq.increment_retry("a", "boom again".into()));
        let entry = dlq.get("a").unwrap();
        let delta = entry.next_retry - entry.last_failure;
        assert!(delta.num_milliseconds() >= 18 && delta.num_milliseconds() <= 22);
    }

    #[test]
    fn backoff_monotonic_in_attempt_number() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
            seed: Some(0),
        };
        let mut prev = Duration::ZERO;
        for n in 0..10 {
            let d = backoff.compute(n);
            assert!(d >= prev);
            prev = d;
        }
        assert!(prev <= Duration::from_secs_f64(1.0 * 1.1));
    }

    #[test]
    fn cleanup_removes_entries_past_retention() {
        let dlq = DeadLetterQueue::new(10, 5, chrono::Duration::milliseconds(5), BackoffPolicy::default());
        dlq.add(event("a"), "boom".into(), "m1".into());
        std::thread::sleep(Duration::from_millis(20));
        let removed = dlq.cleanup();
        assert_eq!(removed, 1);
        assert_eq!(dlq.len(), 0);
    }
}
