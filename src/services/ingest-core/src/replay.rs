//! Replay Subscriber: checkpoint-driven re-delivery from a given sequence
//! or time, used for backfills and recovery drills.
//!
//! Grounded in `event-streaming/src/redis_streams.rs`'s consumer-loop shape
//! and `data-processing/src/batch.rs`'s periodic-checkpoint pattern; the
//! Checkpoint Store gives it a durable resume point across restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
use crate::reader::ResilientReader;
use crate::router::MessageHandler;

/// Where to start replaying a stream from.
#[derive(Debug, Clone)]
pub enum ReplayMode {
    /// Only messages published after the subscriber starts.
    New,
    /// Every message retained by the underlying store.
    All,
    StartSequence(u64),
    StartTime(DateTime<Utc>),
    /// Resume from this consumer's last saved checkpoint.
    LastAcked,
}

impl ReplayMode {
    fn as_str(&self) -> &'static str {
        match self {
            ReplayMode::New => "new",
            ReplayMode::All => "all",
            ReplayMode::StartSequence(_) => "start_sequence",
            ReplayMode::StartTime(_) => "start_time",
            ReplayMode::LastAcked => "last_acked",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayStopCondition {
    pub stop_sequence: Option<u64>,
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub consumer_name: String,
    pub stream_name: String,
    pub mode: ReplayMode,
    pub stop: ReplayStopCondition,
    pub checkpoint_interval: Duration,
    /// Skip the handler invocation and only advance bookkeeping; used to
    /// validate a replay's bounds before committing to it.
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ReplayStats {
    pub processed: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// Drives a [`ResilientReader`] over a bounded sequence range, saving
/// checkpoints periodically and on completion or cancellation.
pub struct ReplaySubscriber<R> {
    reader: Arc<R>,
    checkpoints: Arc<CheckpointStore>,
    config: ReplayConfig,
    processed: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
}

impl<R> ReplaySubscriber<R>
where
    R: ResilientReader,
{
    pub fn new(reader: Arc<R>, checkpoints: Arc<CheckpointStore>, config: ReplayConfig) -> Self {
        Self {
            reader,
            checkpoints,
            config,
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errored: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }

    async fn resolve_start_sequence(&self) -> crate::error::Result<u64> {
        match &self.config.mode {
            ReplayMode::New => self.reader.get_last_sequence().await,
            ReplayMode::All => Ok(0),
            ReplayMode::StartSequence(seq) => Ok(*seq),
            ReplayMode::StartTime(time) => self.reader.sequence_at_or_after(*time).await,
            ReplayMode::LastAcked => {
                let existing = self
                    .checkpoints
                    .get(&self.config.consumer_name, &self.config.stream_name)
                    .await?;
                Ok(existing.map(|c| c.last_sequence as u64 + 1).unwrap_or(0))
            }
        }
    }

    /// Drive replay from the configured start point through the stop
    /// condition (or the end of the stream), invoking `handler` for every
    /// surviving message unless `dry_run` is set. Saves a checkpoint every
    /// `checkpoint_interval` and once more on completion or cancellation.
    pub async fn run_replay(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> crate::error::Result<ReplayStats> {
        let mut sequence = self.resolve_start_sequence().await?;
        let started_at = std::time::Instant::now();
        let mut last_checkpoint = std::time::Instant::now();

        info!(
            consumer = %self.config.consumer_name,
            stream = %self.config.stream_name,
            mode = self.config.mode.as_str(),
            start_sequence = sequence,
            "starting replay"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(stop_seq) = self.config.stop.stop_sequence {
                if sequence > stop_seq {
                    break;
                }
            }

            let message = match self.reader.get_message(sequence).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    warn!(sequence, error = %err, "replay read failed, stopping");
                    self.errored.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            if let Some(stop_time) = self.config.stop.stop_time {
                if message.timestamp > stop_time {
                    break;
                }
            }

            if self.config.dry_run {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            } else {
                match handler.handle(&message.into_bus_message()).await {
                    Ok(()) => {
                        self.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(sequence, error = %err, "replay handler failed, counting and continuing");
                        self.errored.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            sequence += 1;

            if last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                self.save_checkpoint(sequence.saturating_sub(1), CheckpointStatus::Running).await;
                last_checkpoint = std::time::Instant::now();
            }
        }

        let final_status = if cancel.is_cancelled() {
            CheckpointStatus::Canceled
        } else {
            CheckpointStatus::Completed
        };
        self.save_checkpoint(sequence.saturating_sub(1), final_status).await;

        let elapsed = started_at.elapsed().as_secs_f64().max(0.001);
        let processed = self.processed.load(Ordering::Relaxed);
        info!(
            consumer = %self.config.consumer_name,
            processed,
            skipped = self.skipped.load(Ordering::Relaxed),
            errored = self.errored.load(Ordering::Relaxed),
            rate_per_sec = processed as f64 / elapsed,
            "replay finished"
        );

        Ok(self.stats())
    }

    async fn save_checkpoint(&self, last_sequence: u64, status: CheckpointStatus) {
        let now = Utc::now();
        let checkpoint = Checkpoint {
            id: 0,
            consumer_name: self.config.consumer_name.clone(),
            stream_name: self.config.stream_name.clone(),
            last_sequence: last_sequence as i64,
            last_timestamp: Some(now),
            processed_count: self.processed.load(Ordering::Relaxed) as i64,
            error_count: self.errored.load(Ordering::Relaxed) as i64,
            status,
            replay_mode: self.config.mode.as_str().to_string(),
            start_sequence: match self.config.mode {
                ReplayMode::StartSequence(s) => Some(s as i64),
                _ => None,
            },
            start_time: match self.config.mode {
                ReplayMode::StartTime(t) => Some(t),
                _ => None,
            },
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.checkpoints.upsert(&checkpoint).await {
            warn!(error = %err, "failed to persist replay checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::reader::{ReaderMessage, ReaderRange};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FixedReader {
        messages: Vec<ReaderMessage>,
    }

    #[async_trait::async_trait]
    impl ResilientReader for FixedReader {
        async fn query(&self, _range: ReaderRange) -> crate::error::Result<Vec<ReaderMessage>> {
            Ok(self.messages.clone())
        }

        async fn get_message(&self, seq: u64) -> crate::error::Result<Option<ReaderMessage>> {
            Ok(self.messages.iter().find(|m| m.sequence == seq).cloned())
        }

        async fn get_last_sequence(&self) -> crate::error::Result<u64> {
            Ok(self.messages.last().map(|m| m.sequence).unwrap_or(0))
        }

        async fn sequence_at_or_after(&self, time: DateTime<Utc>) -> crate::error::Result<u64> {
            Ok(self
                .messages
                .iter()
                .find(|m| m.timestamp >= time)
                .map(|m| m.sequence)
                .unwrap_or(0))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    struct RecordingHandler {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, msg: &BusMessage) -> crate::error::Result<()> {
            self.seen.lock().push(msg.payload.clone());
            Ok(())
        }
    }

    fn msg(sequence: u64, timestamp: DateTime<Utc>) -> ReaderMessage {
        ReaderMessage {
            sequence,
            timestamp,
            topic: "playback.plex.movie".to_string(),
            payload: format!("event-{sequence}").into_bytes(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reader_double_serves_messages_in_sequence_order() {
        // Exercises the reader double and the ReaderMessage -> BusMessage
        // conversion the replay loop relies on; the full ReplaySubscriber
        // additionally requires a live Postgres-backed CheckpointStore and
        // is covered by the integration suite instead.
        let now = Utc::now();
        let reader = FixedReader {
            messages: vec![msg(0, now), msg(1, now), msg(2, now)],
        };
        let handler = RecordingHandler { seen: Mutex::new(Vec::new()) };

        let mut seq = 0;
        while let Some(m) = reader.get_message(seq).await.unwrap() {
            handler.handle(&m.into_bus_message()).await.unwrap();
            seq += 1;
        }
        assert_eq!(handler.seen.lock().len(), 3);
        assert_eq!(reader.get_last_sequence().await.unwrap(), 2);
    }
}
