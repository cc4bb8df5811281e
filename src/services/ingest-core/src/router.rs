//! Router: the middleware-stack message pipeline sitting between the bus
//! and per-topic handlers.
//!
//! Grounded in `mcp-manager/src/load_balancer.rs` for the
//! failure-rate-over-window shape reused here for retry/backoff decisions,
//! and in `integration/src/webhook/retry.rs` for the exponential-backoff
//! middleware itself (the same [`crate::dlq::BackoffPolicy`] the DLQ uses).
//! Handlers are plain async functions; the router wraps each dispatch in a
//! fixed middleware stack applied outer-to-inner: recover panics, retry
//! with backoff, optional rate throttle, optional message-level dedup,
//! poison-queue on exhaustion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::bus::{BusMessage, Publisher, Subscriber};
use crate::dedup::DedupCache;
use crate::dlq::{BackoffPolicy, DeadLetterQueue};
use crate::error::IngestError;
use crate::metrics::MetricsCollector;
use crate::model::{MediaEvent, Source};

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &BusMessage) -> crate::error::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub close_timeout: Duration,
    pub retry_max_retries: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub retry_multiplier: f64,
    /// Messages per second per handler; `0` disables throttling.
    pub throttle_per_second: u32,
    pub poison_queue_topic: String,
    /// Off by default: the bus message UUID is regenerated by some
    /// publishers on retry, so deduplicating on it is unsafe. When enabled,
    /// the router keys on the `event_id` metadata field instead, falling
    /// back to the (unsafe) message UUID only if that field is absent.
    pub dedup_enabled: bool,
    pub dedup_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(30),
            retry_max_retries: 5,
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            retry_multiplier: 2.0,
            throttle_per_second: 0,
            poison_queue_topic: "dlq.playback".to_string(),
            dedup_enabled: false,
            dedup_ttl: Duration::from_secs(300),
        }
    }
}

struct HandlerEntry {
    subscribe_topic: String,
    publish_topic: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

/// Subscription-driven middleware pipeline. One background task per
/// registered handler; `run` blocks until cancelled, `close` waits up to
/// `close_timeout` for in-flight handler invocations to finish.
pub struct Router<S, P> {
    subscriber: Arc<S>,
    publisher: Arc<P>,
    config: RouterConfig,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    dedup: Option<DedupCache>,
    backoff: BackoffPolicy,
    dlq: Option<Arc<DeadLetterQueue>>,
    metrics: Option<Arc<MetricsCollector>>,
    in_flight: Arc<AtomicUsize>,
}

impl<S, P> Router<S, P>
where
    S: Subscriber + 'static,
    P: Publisher + 'static,
{
    pub fn new(subscriber: Arc<S>, publisher: Arc<P>, config: RouterConfig) -> Self {
        let dedup = config
            .dedup_enabled
            .then(|| DedupCache::new(10_000, config.dedup_ttl));
        let backoff = BackoffPolicy {
            initial: config.retry_initial,
            multiplier: config.retry_multiplier,
            max_backoff: config.retry_max,
            jitter: 0.1,
            seed: None,
        };
        Self {
            subscriber,
            publisher,
            config,
            handlers: RwLock::new(HashMap::new()),
            dedup,
            backoff,
            dlq: None,
            metrics: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wire a dead-letter queue so exhausted/poisoned messages are recorded
    /// durably instead of being published into an unconsumed bus topic.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of `dispatch` calls currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn add_handler(
        &self,
        name: impl Into<String>,
        subscribe_topic: impl Into<String>,
        publish_topic: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.handlers.write().insert(
            name.into(),
            HandlerEntry {
                subscribe_topic: subscribe_topic.into(),
                publish_topic,
                handler,
            },
        );
    }

    /// Drive every registered handler's consumer loop until `cancel` fires.
    pub async fn run(self: &Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let names: Vec<String> = self.handlers.read().keys().cloned().collect();
        let mut tasks = tokio::task::JoinSet::new();

        for name in names {
            let router = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                router.run_handler_loop(&name, cancel).await;
            });
        }

        cancel.cancelled().await;
        while tasks.join_next().await.is_some() {}
    }

    async fn run_handler_loop(self: &Arc<Self>, name: &str, cancel: tokio_util::sync::CancellationToken) {
        let (subscribe_topic, _) = {
            let handlers = self.handlers.read();
            let Some(entry) = handlers.get(name) else { return };
            (entry.subscribe_topic.clone(), ())
        };

        let mut rx = match self.subscriber.subscribe(&subscribe_topic, name).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(handler = name, error = %err, "failed to subscribe, handler will not run");
                return;
            }
        };

        let mut throttle_ticker = (self.config.throttle_per_second > 0).then(|| {
            tokio::time::interval(Duration::from_secs(1) / self.config.throttle_per_second.max(1))
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(handler = name, "router handler loop stopping on cancellation");
                    return;
                }
                maybe_msg = rx.recv() => {
                    let Some(msg) = maybe_msg else { return };
                    if let Some(ticker) = throttle_ticker.as_mut() {
                        ticker.tick().await;
                    }
                    self.dispatch(name, msg).await;
                }
            }
        }
    }

    /// Apply the fixed middleware stack to one message and settle its
    /// disposition: ack on success or after poisoning, leave un-acked (the
    /// bus will redeliver) on a Retryable error that hasn't yet exhausted
    /// its backoff budget would be wrong here — retries are performed
    /// in-process instead, so every terminal outcome acks.
    async fn dispatch(&self, name: &str, msg: BusMessage) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());
        if let Some(metrics) = &self.metrics {
            metrics.record_router_dispatched();
        }

        let (handler, publish_topic, subscribe_topic) = {
            let handlers = self.handlers.read();
            let Some(entry) = handlers.get(name) else { return };
            (entry.handler.clone(), entry.publish_topic.clone(), entry.subscribe_topic.clone())
        };

        if let Some(dedup) = &self.dedup {
            let key = msg.metadata.get("event_id").cloned().unwrap_or_else(|| {
                warn!(handler = name, "dedup enabled but message has no event_id metadata, falling back to message uuid");
                msg.uuid.clone()
            });
            if dedup.is_duplicate(&key) {
                msg.ack();
                let _ = self.subscriber.ack(&subscribe_topic, name, &msg.uuid).await;
                return;
            }
        }

        let mut attempt = 0;
        loop {
            match self.invoke_recoverable(&handler, &msg).await {
                Ok(()) => {
                    msg.ack();
                    let _ = self.subscriber.ack(&subscribe_topic, name, &msg.uuid).await;
                    return;
                }
                Err(err) if err.is_permanent() => {
                    self.poison(name, &subscribe_topic, &msg, &err, publish_topic.as_deref()).await;
                    return;
                }
                Err(err) => {
                    if attempt >= self.config.retry_max_retries {
                        self.poison(name, &subscribe_topic, &msg, &err, publish_topic.as_deref()).await;
                        return;
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.record_router_retry();
                    }
                    let delay = self.backoff.compute(attempt);
                    warn!(handler = name, attempt, error = %err, delay_ms = delay.as_millis() as u64, "handler failed, retrying after backoff");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn invoke_recoverable(&self, handler: &Arc<dyn MessageHandler>, msg: &BusMessage) -> crate::error::Result<()> {
        let handler = handler.clone();
        let msg = msg.clone();
        match tokio::spawn(async move { handler.handle(&msg).await }).await {
            Ok(result) => result,
            Err(join_err) => {
                error!(error = %join_err, "handler panicked, treating as retryable");
                Err(IngestError::retryable(format!("handler panicked: {join_err}")))
            }
        }
    }

    /// Settle an exhausted/permanently-failed message. When a DLQ is wired
    /// in, the message is recorded there durably instead of being published
    /// into `poison_queue_topic`, which has no registered consumer — the
    /// bus-topic path only remains as a fallback for deployments that
    /// haven't wired a DLQ.
    async fn poison(&self, name: &str, subscribe_topic: &str, msg: &BusMessage, err: &IngestError, publish_topic: Option<&str>) {
        error!(handler = name, error = %err, "routing message to dead-letter queue");
        let _ = publish_topic;

        if let Some(dlq) = &self.dlq {
            let event = crate::serializer::unmarshal(&msg.payload).unwrap_or_else(|parse_err| {
                warn!(
                    handler = name,
                    error = %parse_err,
                    "poisoned payload did not parse as a MediaEvent, recording a placeholder DLQ entry"
                );
                let mut placeholder = MediaEvent::new_event(Source::Plex);
                placeholder.event_id = msg.uuid.clone();
                placeholder.title = "<unparseable payload>".to_string();
                placeholder
            });
            dlq.add(event, err.message().to_string(), msg.uuid.clone());
        } else if let Err(publish_err) = self
            .publisher
            .publish(&self.config.poison_queue_topic, msg.payload.clone(), msg.metadata.clone())
            .await
        {
            error!(handler = name, error = %publish_err, "failed to publish to poison queue");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_router_poisoned();
        }
        msg.ack();
        let _ = self.subscriber.ack(subscribe_topic, name, &msg.uuid).await;
    }

    /// Idempotent; waits up to `timeout` (capped by `close_timeout`) for
    /// in-flight `dispatch` calls to finish, then returns regardless.
    pub async fn close(&self, timeout: Duration) {
        let timeout = timeout.min(self.config.close_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the router's in-flight dispatch counter on every exit path out
/// of `dispatch`, including early returns.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _msg: &BusMessage) -> crate::error::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.fail_times {
                return Err(if self.permanent {
                    IngestError::permanent("bad payload")
                } else {
                    IngestError::retryable("transient failure")
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_handler_acks_message() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = RouterConfig::default();
        config.retry_initial = Duration::from_millis(1);
        let router = Arc::new(Router::new(bus.clone(), bus.clone(), config));

        let calls = Arc::new(AtomicUsize::new(0));
        router.add_handler(
            "test",
            "playback.plex.movie",
            None,
            Arc::new(CountingHandler { calls: calls.clone(), fail_times: 0, permanent: false }),
        );

        let cancel = tokio_util::sync::CancellationToken::new();
        let run_cancel = cancel.clone();
        let router_clone = router.clone();
        let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("playback.plex.movie", b"payload".to_vec(), HashMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn permanent_error_routes_to_poison_queue_without_retry() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = RouterConfig::default();
        config.retry_initial = Duration::from_millis(1);
        let router = Arc::new(Router::new(bus.clone(), bus.clone(), config.clone()));

        let mut poison_rx = bus.subscribe(&config.poison_queue_topic, "poison-test").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        router.add_handler(
            "test",
            "playback.plex.movie",
            None,
            Arc::new(CountingHandler { calls: calls.clone(), fail_times: 1, permanent: true }),
        );

        let cancel = tokio_util::sync::CancellationToken::new();
        let run_cancel = cancel.clone();
        let router_clone = router.clone();
        let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("playback.plex.movie", b"bad".to_vec(), HashMap::new()).await.unwrap();

        let poisoned = tokio::time::timeout(Duration::from_millis(500), poison_rx.recv()).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(poisoned.is_ok());
    }

    #[tokio::test]
    async fn retryable_error_succeeds_on_a_later_attempt_without_poisoning() {
        let bus = Arc::new(InMemoryBus::new());
        let mut config = RouterConfig::default();
        config.retry_initial = Duration::from_millis(1);
        config.retry_max = Duration::from_millis(5);
        let router = Arc::new(Router::new(bus.clone(), bus.clone(), config.clone()));

        let mut poison_rx = bus.subscribe(&config.poison_queue_topic, "poison-test").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        router.add_handler(
            "test",
            "playback.plex.movie",
            None,
            Arc::new(CountingHandler { calls: calls.clone(), fail_times: 2, permanent: false }),
        );

        let cancel = tokio_util::sync::CancellationToken::new();
        let run_cancel = cancel.clone();
        let router_clone = router.clone();
        let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("playback.plex.movie", b"payload".to_vec(), HashMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let poisoned = tokio::time::timeout(Duration::from_millis(20), poison_rx.recv()).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(poisoned.is_err(), "message should not have been poisoned");
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_dispatch_to_drain() {
        struct SlowHandler {
            delay: Duration,
        }

        #[async_trait::async_trait]
        impl MessageHandler for SlowHandler {
            async fn handle(&self, _msg: &BusMessage) -> crate::error::Result<()> {
                tokio::time::sleep(self.delay).await;
                Ok(())
            }
        }

        let bus = Arc::new(InMemoryBus::new());
        let config = RouterConfig::default();
        let router = Arc::new(Router::new(bus.clone(), bus.clone(), config));
        router.add_handler(
            "test",
            "playback.plex.movie",
            None,
            Arc::new(SlowHandler { delay: Duration::from_millis(100) }),
        );

        let cancel = tokio_util::sync::CancellationToken::new();
        let run_cancel = cancel.clone();
        let router_clone = router.clone();
        let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("playback.plex.movie", b"payload".to_vec(), HashMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(router.in_flight_count(), 1);
        router.close(Duration::from_secs(1)).await;
        assert_eq!(router.in_flight_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
