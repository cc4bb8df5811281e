//! Message bus abstractions and the Redis Streams-backed implementation.
//!
//! Grounded in `event-streaming/src/redis_streams.rs`'s `RedisStreamManager`:
//! the same `xadd`/`xreadgroup_options`/`xack` trio via `redis::AsyncCommands`
//! on a cloneable `redis::aio::ConnectionManager`, and the same
//! create-stream-by-adding-then-trimming bootstrap. The Router and Replay
//! Subscriber depend only on the `Publisher`/`Subscriber` traits here, never
//! on Redis directly, so an in-memory double can stand in for tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorCategory, IngestError, Result};
use crate::model::{MediaType, Source};

/// A message in flight on the bus. `ack`/`nack` are idempotent; calling
/// either after the other is a no-op.
#[derive(Clone)]
pub struct BusMessage {
    pub uuid: String,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
    ack_state: Arc<Mutex<AckState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    Pending,
    Acked,
    Nacked,
}

impl BusMessage {
    pub fn new(uuid: String, metadata: HashMap<String, String>, payload: Vec<u8>) -> Self {
        Self {
            uuid,
            metadata,
            payload,
            ack_state: Arc::new(Mutex::new(AckState::Pending)),
        }
    }

    pub fn ack(&self) {
        let mut state = self.ack_state.lock();
        if *state == AckState::Pending {
            *state = AckState::Acked;
        }
    }

    pub fn nack(&self) {
        let mut state = self.ack_state.lock();
        if *state == AckState::Pending {
            *state = AckState::Nacked;
        }
    }

    pub fn is_acked(&self) -> bool {
        *self.ack_state.lock() == AckState::Acked
    }

    pub fn is_nacked(&self) -> bool {
        *self.ack_state.lock() == AckState::Nacked
    }
}

/// Derive the publish topic for an event: `playback.<source>.<media_type>`.
pub fn derive_topic(source: Source, media_type: MediaType) -> String {
    format!("playback.{}.{}", source, media_type)
}

/// Match a subscription pattern against a concrete dotted topic. `*` matches
/// exactly one segment; a trailing `>` matches any number of remaining
/// segments.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let topic_parts: Vec<&str> = topic.split('.').collect();

    for (i, part) in pattern_parts.iter().enumerate() {
        if *part == ">" {
            return true;
        }
        match topic_parts.get(i) {
            Some(topic_part) if *part == "*" || part == topic_part => continue,
            _ => return false,
        }
    }
    pattern_parts.len() == topic_parts.len()
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, metadata: HashMap<String, String>) -> Result<()>;
}

#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `topic` (a concrete stream name, not a wildcard pattern
    /// — wildcard fan-out is resolved by the caller against known streams).
    async fn subscribe(&self, topic: &str, consumer_name: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Acknowledge delivery of a message previously received from `topic`.
    async fn ack(&self, topic: &str, consumer_name: &str, message_uuid: &str) -> Result<()>;
}

/// Redis Streams-backed bus. One consumer group per `consumer_name`.
pub struct RedisBus {
    client: redis::Client,
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to create redis client: {e}"),
                ErrorCategory::Connection,
            )
        })?;
        let conn = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| {
                IngestError::retryable_with_category(
                    format!("failed to connect to redis: {e}"),
                    ErrorCategory::Connection,
                )
            })?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    async fn connection(&self) -> redis::aio::ConnectionManager {
        self.conn.lock().await.clone()
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.connection().await;
        match conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0").await {
            Ok(()) => {
                info!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(IngestError::retryable_with_category(
                format!("failed to create consumer group {group} on {stream}: {e}"),
                ErrorCategory::Connection,
            )),
        }
    }
}

#[async_trait::async_trait]
impl Publisher for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
        let mut conn = self.connection().await;
        let payload_str = String::from_utf8_lossy(&payload).into_owned();
        let mut fields: Vec<(String, String)> = vec![("payload".to_string(), payload_str)];
        fields.extend(metadata.into_iter());

        let field_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let _id: String = conn.xadd(topic, "*", &field_refs).await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to publish to stream {topic}: {e}"),
                ErrorCategory::Connection,
            )
        })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Subscriber for RedisBus {
    async fn subscribe(&self, topic: &str, consumer_name: &str) -> Result<mpsc::Receiver<BusMessage>> {
        self.ensure_group(topic, consumer_name).await?;

        let (tx, rx) = mpsc::channel(256);
        let mut conn = self.connection().await;
        let topic = topic.to_string();
        let group = consumer_name.to_string();

        tokio::spawn(async move {
            let opts = redis::streams::StreamReadOptions::default()
                .group(&group, &group)
                .count(16)
                .block(5_000);

            loop {
                let result: redis::RedisResult<redis::streams::StreamReadReply> =
                    conn.xread_options(&[&topic], &[">"], &opts).await;

                match result {
                    Ok(reply) => {
                        for stream in reply.keys {
                            for id in stream.ids {
                                let mut metadata = HashMap::new();
                                let mut payload = Vec::new();
                                for (k, v) in &id.map {
                                    let value_str = match v {
                                        redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                                        redis::Value::Status(s) => s.clone(),
                                        other => format!("{other:?}"),
                                    };
                                    if k == "payload" {
                                        payload = value_str.into_bytes();
                                    } else {
                                        metadata.insert(k.clone(), value_str);
                                    }
                                }
                                let msg = BusMessage::new(id.id.clone(), metadata, payload);
                                if tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, stream = %topic, "redis stream read failed, backing off");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, topic: &str, consumer_name: &str, message_uuid: &str) -> Result<()> {
        let mut conn = self.connection().await;
        let _: u64 = conn.xack(topic, consumer_name, &[message_uuid]).await.map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to ack message {message_uuid} on {topic}: {e}"),
                ErrorCategory::Connection,
            )
        })?;
        Ok(())
    }
}

/// In-memory bus double for tests: topics are `tokio::sync::broadcast`-free
/// mpsc channels keyed by topic name, so publishing before a subscriber
/// exists silently drops the message (acceptable for unit tests that
/// subscribe first).
#[derive(Default)]
pub struct InMemoryBus {
    senders: Mutex<HashMap<String, mpsc::Sender<BusMessage>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
        let sender = self.senders.lock().get(topic).cloned();
        if let Some(sender) = sender {
            let msg = BusMessage::new(uuid::Uuid::new_v4().to_string(), metadata, payload);
            debug!(topic, "publishing to in-memory bus");
            let _ = sender.send(msg).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str, _consumer_name: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn ack(&self, _topic: &str, _consumer_name: &str, _message_uuid: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_topic_matches_spec_format() {
        assert_eq!(derive_topic(Source::Plex, MediaType::Movie), "playback.plex.movie");
        assert_eq!(derive_topic(Source::Jellyfin, MediaType::Episode), "playback.jellyfin.episode");
    }

    #[test]
    fn topic_matches_wildcards() {
        assert!(topic_matches("playback.>", "playback.plex.movie"));
        assert!(topic_matches("playback.*.movie", "playback.plex.movie"));
        assert!(!topic_matches("playback.*.movie", "playback.plex.episode"));
        assert!(!topic_matches("playback.*.movie", "playback.plex.movie.extra"));
        assert!(topic_matches("playback.plex.movie", "playback.plex.movie"));
    }

    #[test]
    fn bus_message_ack_is_idempotent_against_nack() {
        let msg = BusMessage::new("u1".into(), HashMap::new(), vec![]);
        msg.ack();
        msg.nack();
        assert!(msg.is_acked());
        assert!(!msg.is_nacked());
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_published_message() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("playback.plex.movie", "test-consumer").await.unwrap();
        bus.publish("playback.plex.movie", b"hello".to_vec(), HashMap::new())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"hello");
    }
}
