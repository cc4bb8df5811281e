//! Health & Stats aggregator.
//!
//! Grounded in `event-streaming/src/handlers.rs`'s `/health` endpoint shape
//! and `mcp-manager/src/load_balancer.rs`'s circuit-breaker status
//! reporting; generalized here into a component-registry aggregator that
//! probes every registered component concurrently under a shared timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::appender::{Appender, EventSink};
use crate::dlq::DeadLetterQueue;
use crate::handler::HandlerStats;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub degraded: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            healthy: true,
            degraded: false,
            message: None,
            error: None,
            details: HashMap::new(),
            last_check: Utc::now(),
        }
    }

    fn degraded(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            degraded: true,
            message: Some(message.into()),
            error: None,
            details: HashMap::new(),
            last_check: Utc::now(),
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            degraded: false,
            message: None,
            error: Some(error.into()),
            details: HashMap::new(),
            last_check: Utc::now(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> ComponentHealth;
}

#[derive(Debug, Clone, Serialize)]
pub enum Rollup {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealth {
    pub rollup: Rollup,
    pub components: HashMap<String, ComponentHealth>,
}

/// Probes every registered component concurrently under `probe_timeout`,
/// then rolls up: any unhealthy ⇒ unhealthy; any degraded (no unhealthy) ⇒
/// degraded; else healthy.
pub struct HealthAggregator {
    components: HashMap<String, Arc<dyn HealthCheck>>,
    probe_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { components: HashMap::new(), probe_timeout }
    }

    pub fn register(&mut self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        self.components.insert(name.into(), check);
    }

    pub async fn check(&self) -> AggregateHealth {
        let mut tasks = tokio::task::JoinSet::new();
        for (name, check) in &self.components {
            let name = name.clone();
            let check = check.clone();
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                let result = tokio::time::timeout(timeout, check.health_check()).await;
                let health = result.unwrap_or_else(|_| ComponentHealth::unhealthy("health probe timed out"));
                (name, health)
            });
        }

        let mut components = HashMap::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok((name, health)) = result {
                components.insert(name, health);
            }
        }

        let any_unhealthy = components.values().any(|h| !h.healthy);
        let any_degraded = components.values().any(|h| h.degraded);
        let rollup = if any_unhealthy {
            Rollup::Unhealthy
        } else if any_degraded {
            Rollup::Degraded
        } else {
            Rollup::Healthy
        };

        AggregateHealth { rollup, components }
    }
}

/// Degraded when parse-error rate exceeds 10% over at least 100 messages
/// received.
pub struct HandlerHealthCheck {
    stats: Arc<HandlerStats>,
}

impl HandlerHealthCheck {
    pub fn new(stats: Arc<HandlerStats>) -> Self {
        Self { stats }
    }
}

#[async_trait::async_trait]
impl HealthCheck for HandlerHealthCheck {
    async fn health_check(&self) -> ComponentHealth {
        use std::sync::atomic::Ordering;
        let received = self.stats.received.load(Ordering::Relaxed);
        let rate = self.stats.parse_error_rate();
        if received >= 100 && rate > 0.10 {
            ComponentHealth::degraded(format!("parse error rate {:.1}% over {received} messages", rate * 100.0))
                .with_detail("parse_error_rate", rate)
                .with_detail("received", received)
        } else {
            ComponentHealth::healthy().with_detail("received", received)
        }
    }
}

/// Degraded when flush-error rate exceeds 10% over at least 10 flushes, or
/// the buffer holds more than twice the configured batch size.
pub struct AppenderHealthCheck<S: EventSink> {
    appender: Arc<Appender<S>>,
    batch_size: usize,
}

impl<S: EventSink> AppenderHealthCheck<S> {
    pub fn new(appender: Arc<Appender<S>>, batch_size: usize) -> Self {
        Self { appender, batch_size }
    }
}

#[async_trait::async_trait]
impl<S: EventSink + 'static> HealthCheck for AppenderHealthCheck<S> {
    async fn health_check(&self) -> ComponentHealth {
        let appended = self.appender.appended_count();
        let failed = self.appender.failed_count();
        let total_flushes = appended + failed;
        let buffered = self.appender.buffered_len();

        if buffered > self.batch_size.saturating_mul(2) {
            return ComponentHealth::degraded(format!("buffer at {buffered}, over 2x batch size {}", self.batch_size))
                .with_detail("buffered", buffered);
        }
        if total_flushes >= 10 {
            let rate = failed as f64 / total_flushes as f64;
            if rate > 0.10 {
                return ComponentHealth::degraded(format!("flush error rate {:.1}% over {total_flushes} flushes", rate * 100.0))
                    .with_detail("flush_error_rate", rate);
            }
        }
        ComponentHealth::healthy().with_detail("buffered", buffered)
    }
}

/// Degraded when entries exceed half the configured capacity.
pub struct DlqHealthCheck {
    dlq: Arc<DeadLetterQueue>,
}

impl DlqHealthCheck {
    pub fn new(dlq: Arc<DeadLetterQueue>) -> Self {
        Self { dlq }
    }
}

#[async_trait::async_trait]
impl HealthCheck for DlqHealthCheck {
    async fn health_check(&self) -> ComponentHealth {
        let len = self.dlq.len();
        let half_capacity = self.dlq.max_entries / 2;
        if len > half_capacity {
            ComponentHealth::degraded(format!("dlq at {len} entries, over half of capacity {}", self.dlq.max_entries))
                .with_detail("entries", len)
        } else {
            ComponentHealth::healthy().with_detail("entries", len)
        }
    }
}

/// Degraded while the wrapped circuit breaker is in its half-open probing
/// state; unhealthy never applies here since the fallback always serves.
pub struct ResilientReaderHealthCheck<R> {
    reader: Arc<R>,
}

impl<R> ResilientReaderHealthCheck<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }
}

#[async_trait::async_trait]
impl<R> HealthCheck for ResilientReaderHealthCheck<R>
where
    R: crate::reader::ResilientReader + 'static,
{
    async fn health_check(&self) -> ComponentHealth {
        if self.reader.health().await {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded("primary reader unavailable, serving from fallback")
        }
    }
}
