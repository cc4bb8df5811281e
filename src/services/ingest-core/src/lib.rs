//! # Ingest Core
//!
//! A durable, at-least-once playback-event ingestion pipeline that unifies
//! event streams from Plex, Tautulli, Jellyfin, and Emby into a single
//! normalized record, with:
//! - A resilient bus subscriber with dedup, retry, and a dead-letter queue
//! - A buffered, chunked appender into Postgres
//! - An outbox forwarder for at-least-once publication to downstream consumers
//! - A replay subscriber with checkpointing for reprocessing historical streams
//! - A circuit-breaking resilient reader with an in-memory fallback path
//! - Health aggregation and Prometheus metrics

pub mod appender;
pub mod broadcast;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod dlq_store;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod model;
pub mod outbox;
pub mod reader;
pub mod replay;
pub mod router;
pub mod serializer;
pub mod server;

pub use config::AppConfig;
pub use error::{ErrorCategory, IngestError, Result};
pub use model::{MediaEvent, Source};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "ingest-core";
