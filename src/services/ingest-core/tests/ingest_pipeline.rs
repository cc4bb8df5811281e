//! End-to-end integration tests for the Router -> Store Handler -> Appender
//! path over an in-memory bus, exercising the pieces whose interaction
//! can't be verified by any single module's unit tests: delivery ack/retry,
//! cross-source dedup, and poison-queue/DLQ routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use ingest_core::appender::{Appender, AppenderConfig, EventSink};
use ingest_core::bus::{derive_topic, InMemoryBus, Publisher};
use ingest_core::dlq::{BackoffPolicy, DeadLetterQueue};
use ingest_core::error::Result;
use ingest_core::handler::{HandlerConfig, StoreHandler};
use ingest_core::model::{MediaEvent, MediaType, Source};
use ingest_core::router::{Router, RouterConfig};
use ingest_core::serializer;

struct VecSink {
    rows: Mutex<Vec<MediaEvent>>,
}

impl VecSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { rows: Mutex::new(Vec::new()) })
    }

    fn event_ids(&self) -> Vec<String> {
        self.rows.lock().iter().map(|e| e.event_id.clone()).collect()
    }
}

#[async_trait::async_trait]
impl EventSink for VecSink {
    async fn append_batch(&self, events: &[MediaEvent]) -> Result<()> {
        self.rows.lock().extend(events.iter().cloned());
        Ok(())
    }
}

fn event(source: Source, event_id: &str, session_key: &str) -> MediaEvent {
    let mut e = MediaEvent::new_event(source);
    e.event_id = event_id.to_string();
    e.session_key = Some(session_key.to_string());
    e.user_id = 42;
    e.title = "Arrival".to_string();
    e.media_type = MediaType::Movie;
    e.rating_key = Some("999".to_string());
    e.machine_id = Some("test-machine".to_string());
    e.started_at = Some(Utc::now());
    e.set_correlation_key().unwrap();
    e
}

/// Wires a Router with one store-handler-backed topic per source/media
/// type combination, backed by a real (buffer-size-1, sync-flush) Appender
/// over a `VecSink`, so every enqueued event is immediately visible.
async fn build_pipeline() -> (Arc<Router<InMemoryBus, InMemoryBus>>, Arc<VecSink>, Arc<InMemoryBus>) {
    let bus = Arc::new(InMemoryBus::new());
    let sink = VecSink::new();
    let appender_config = AppenderConfig { max_buffer: 1000, ..AppenderConfig::default() };
    let appender = Arc::new(Appender::new(sink.clone(), appender_config));

    let mut handler_config = HandlerConfig::default();
    handler_config.sync_flush = true;
    let store_handler = Arc::new(StoreHandler::new(appender, handler_config, None));

    let mut router_config = RouterConfig::default();
    router_config.retry_initial = Duration::from_millis(1);
    let router = Arc::new(Router::new(bus.clone(), bus.clone(), router_config));

    for source in Source::ALL {
        let topic = derive_topic(source, MediaType::Movie);
        router.add_handler(format!("store-{topic}"), topic, None, store_handler.clone());
    }

    (router, sink, bus)
}

#[tokio::test]
async fn event_published_to_bus_is_stored_exactly_once() {
    let (router, sink, bus) = build_pipeline().await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let router_clone = router.clone();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let topic = derive_topic(Source::Plex, MediaType::Movie);
    let payload = serializer::marshal(&event(Source::Plex, "plex-1", "sess-1")).unwrap();
    bus.publish(&topic, payload, HashMap::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(sink.event_ids(), vec!["plex-1".to_string()]);
}

#[tokio::test]
async fn cross_source_duplicate_is_not_double_stored() {
    let (router, sink, bus) = build_pipeline().await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let router_clone = router.clone();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let a = event(Source::Plex, "plex-1", "sess-p");
    let b = event(Source::Tautulli, "taut-1", "sess-t");
    // Same correlation key across sources: same user, title, rating_key,
    // machine, and started_at, just reported by two different servers.
    assert_eq!(
        MediaEvent::cross_source_key(a.correlation_key.as_deref().unwrap()),
        MediaEvent::cross_source_key(b.correlation_key.as_deref().unwrap())
    );

    let plex_topic = derive_topic(Source::Plex, MediaType::Movie);
    let taut_topic = derive_topic(Source::Tautulli, MediaType::Movie);
    bus.publish(&plex_topic, serializer::marshal(&a).unwrap(), HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    bus.publish(&taut_topic, serializer::marshal(&b).unwrap(), HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(sink.event_ids(), vec!["plex-1".to_string()]);
}

#[tokio::test]
async fn unparseable_payload_is_recorded_in_the_dead_letter_queue() {
    let bus = Arc::new(InMemoryBus::new());
    let sink = VecSink::new();
    let appender = Arc::new(Appender::new(sink.clone(), AppenderConfig::default()));
    let store_handler = Arc::new(StoreHandler::new(appender, HandlerConfig::default(), None));

    let dlq = Arc::new(DeadLetterQueue::new(100, 5, chrono::Duration::days(7), BackoffPolicy::default()));

    let mut router_config = RouterConfig::default();
    router_config.retry_initial = Duration::from_millis(1);
    let router = Arc::new(Router::new(bus.clone(), bus.clone(), router_config).with_dlq(dlq.clone()));

    let topic = derive_topic(Source::Plex, MediaType::Movie);
    router.add_handler("store", topic.clone(), None, store_handler.clone());

    let cancel = tokio_util::sync::CancellationToken::new();
    let router_clone = router.clone();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { router_clone.run(run_cancel).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut metadata = HashMap::new();
    metadata.insert("event_id".to_string(), "poison-1".to_string());
    bus.publish(&topic, b"not valid json".to_vec(), metadata).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(dlq.len(), 1);
    assert!(sink.event_ids().is_empty());
}
