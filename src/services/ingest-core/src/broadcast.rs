//! WebSocket fan-out handler: stateless passthrough to the broadcaster.
//!
//! Grounded in `event-streaming/src/handlers.rs`'s thin axum handler style —
//! this is the thinnest handler in the pipeline by design. Broadcast
//! failures must never stop ingestion, so `handle` never returns an error.

use tracing::trace;

use crate::bus::BusMessage;
use crate::error::Result;
use crate::router::MessageHandler;

/// Fire-and-forget sink for raw message payloads, fanned out to connected
/// WebSocket clients. Implemented out-of-crate; treated here as an opaque
/// capability per the pipeline's external-interfaces boundary.
pub trait Broadcaster: Send + Sync {
    fn broadcast_raw(&self, payload: &[u8]);
}

pub struct BroadcastHandler<B: Broadcaster> {
    broadcaster: std::sync::Arc<B>,
}

impl<B: Broadcaster> BroadcastHandler<B> {
    pub fn new(broadcaster: std::sync::Arc<B>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait::async_trait]
impl<B: Broadcaster> MessageHandler for BroadcastHandler<B> {
    async fn handle(&self, msg: &BusMessage) -> Result<()> {
        trace!(uuid = %msg.uuid, "broadcasting raw payload");
        self.broadcaster.broadcast_raw(&msg.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct RecordingBroadcaster {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast_raw(&self, payload: &[u8]) {
            self.seen.lock().push(payload.to_vec());
        }
    }

    #[tokio::test]
    async fn handle_never_errors_and_forwards_raw_payload() {
        let broadcaster = Arc::new(RecordingBroadcaster { seen: Mutex::new(Vec::new()) });
        let handler = BroadcastHandler::new(broadcaster.clone());
        let msg = BusMessage::new("u1".into(), HashMap::new(), b"raw".to_vec());

        let result = handler.handle(&msg).await;
        assert!(result.is_ok());
        assert_eq!(broadcaster.seen.lock()[0], b"raw");
    }
}
