//! Prometheus metrics for the ingestion pipeline.
//!
//! Grounded in `event-streaming/src/metrics.rs`'s `MetricsCollector`: a
//! `prometheus::Registry` with typed counters/gauges/histograms registered
//! up front, plus an `export_prometheus` text-encode method. Narrowed here
//! to the pipeline's own components instead of the teacher's Kafka/system
//! metric families.

use std::time::Duration;

use prometheus::{
    histogram_opts, opts, register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder,
};

use crate::error::{ErrorCategory, IngestError, Result};

#[derive(Clone)]
pub struct MetricsCollector {
    registry: Registry,

    events_received_total: IntCounter,
    events_processed_total: IntCounter,
    events_duplicate_total: IntCounter,
    events_parse_error_total: IntCounter,

    appender_flush_total: IntCounter,
    appender_flush_failed_total: IntCounter,
    appender_buffered: IntGauge,
    appender_flush_duration_seconds: Histogram,

    dlq_entries: IntGauge,
    dlq_retries_total: IntCounter,
    dlq_expired_total: IntCounter,

    outbox_pending: IntGauge,
    outbox_forwarded_total: IntCounter,
    outbox_forward_failed_total: IntCounter,

    router_dispatched_total: IntCounter,
    router_retried_total: IntCounter,
    router_poisoned_total: IntCounter,

    reader_fallback_served_total: IntCounter,
    reader_primary_available: IntGauge,

    replay_processed_total: IntCounter,
    replay_errored_total: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Self {
            events_received_total: register_int_counter_with_registry!(
                opts!("ingest_events_received_total", "Total events received by the store handler"),
                &registry
            )
            .map_err(registry_err)?,
            events_processed_total: register_int_counter_with_registry!(
                opts!("ingest_events_processed_total", "Total events appended to the sink"),
                &registry
            )
            .map_err(registry_err)?,
            events_duplicate_total: register_int_counter_with_registry!(
                opts!("ingest_events_duplicate_total", "Total events discarded as duplicates"),
                &registry
            )
            .map_err(registry_err)?,
            events_parse_error_total: register_int_counter_with_registry!(
                opts!("ingest_events_parse_error_total", "Total events rejected for failing to parse"),
                &registry
            )
            .map_err(registry_err)?,
            appender_flush_total: register_int_counter_with_registry!(
                opts!("ingest_appender_flush_total", "Total appender flush attempts"),
                &registry
            )
            .map_err(registry_err)?,
            appender_flush_failed_total: register_int_counter_with_registry!(
                opts!("ingest_appender_flush_failed_total", "Total failed appender flush chunks"),
                &registry
            )
            .map_err(registry_err)?,
            appender_buffered: register_int_gauge_with_registry!(
                opts!("ingest_appender_buffered", "Events currently buffered awaiting flush"),
                &registry
            )
            .map_err(registry_err)?,
            appender_flush_duration_seconds: register_histogram_with_registry!(
                histogram_opts!("ingest_appender_flush_duration_seconds", "Appender flush latency"),
                &registry
            )
            .map_err(registry_err)?,
            dlq_entries: register_int_gauge_with_registry!(
                opts!("ingest_dlq_entries", "Current dead-letter queue size"),
                &registry
            )
            .map_err(registry_err)?,
            dlq_retries_total: register_int_counter_with_registry!(
                opts!("ingest_dlq_retries_total", "Total DLQ retry attempts"),
                &registry
            )
            .map_err(registry_err)?,
            dlq_expired_total: register_int_counter_with_registry!(
                opts!("ingest_dlq_expired_total", "Total DLQ entries evicted at capacity"),
                &registry
            )
            .map_err(registry_err)?,
            outbox_pending: register_int_gauge_with_registry!(
                opts!("ingest_outbox_pending", "Outbox rows not yet published to the bus"),
                &registry
            )
            .map_err(registry_err)?,
            outbox_forwarded_total: register_int_counter_with_registry!(
                opts!("ingest_outbox_forwarded_total", "Total outbox rows published to the bus"),
                &registry
            )
            .map_err(registry_err)?,
            outbox_forward_failed_total: register_int_counter_with_registry!(
                opts!("ingest_outbox_forward_failed_total", "Total failed outbox publish attempts"),
                &registry
            )
            .map_err(registry_err)?,
            router_dispatched_total: register_int_counter_with_registry!(
                opts!("ingest_router_dispatched_total", "Total messages dispatched to a handler"),
                &registry
            )
            .map_err(registry_err)?,
            router_retried_total: register_int_counter_with_registry!(
                opts!("ingest_router_retried_total", "Total router retry attempts"),
                &registry
            )
            .map_err(registry_err)?,
            router_poisoned_total: register_int_counter_with_registry!(
                opts!("ingest_router_poisoned_total", "Total messages routed to the poison queue"),
                &registry
            )
            .map_err(registry_err)?,
            reader_fallback_served_total: register_int_counter_with_registry!(
                opts!("ingest_reader_fallback_served_total", "Total reads served by the fallback reader"),
                &registry
            )
            .map_err(registry_err)?,
            reader_primary_available: register_int_gauge_with_registry!(
                opts!("ingest_reader_primary_available", "1 if the primary reader is currently healthy"),
                &registry
            )
            .map_err(registry_err)?,
            replay_processed_total: register_int_counter_with_registry!(
                opts!("ingest_replay_processed_total", "Total messages processed by replay subscribers"),
                &registry
            )
            .map_err(registry_err)?,
            replay_errored_total: register_int_counter_with_registry!(
                opts!("ingest_replay_errored_total", "Total replay handler errors"),
                &registry
            )
            .map_err(registry_err)?,
            registry,
        };
        Ok(collector)
    }

    pub fn record_event_received(&self) {
        self.events_received_total.inc();
    }

    pub fn record_event_processed(&self) {
        self.events_processed_total.inc();
    }

    pub fn record_event_duplicate(&self) {
        self.events_duplicate_total.inc();
    }

    pub fn record_event_parse_error(&self, _category: ErrorCategory) {
        self.events_parse_error_total.inc();
    }

    pub fn record_appender_flush(&self, duration: Duration, buffered: usize, failed: bool) {
        self.appender_flush_total.inc();
        if failed {
            self.appender_flush_failed_total.inc();
        }
        self.appender_buffered.set(buffered as i64);
        self.appender_flush_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_dlq_entries(&self, count: usize) {
        self.dlq_entries.set(count as i64);
    }

    pub fn record_dlq_retry(&self) {
        self.dlq_retries_total.inc();
    }

    pub fn record_dlq_expired(&self) {
        self.dlq_expired_total.inc();
    }

    pub fn set_outbox_pending(&self, count: usize) {
        self.outbox_pending.set(count as i64);
    }

    pub fn record_outbox_forwarded(&self) {
        self.outbox_forwarded_total.inc();
    }

    pub fn record_outbox_forward_failed(&self) {
        self.outbox_forward_failed_total.inc();
    }

    pub fn record_router_dispatched(&self) {
        self.router_dispatched_total.inc();
    }

    pub fn record_router_retry(&self) {
        self.router_retried_total.inc();
    }

    pub fn record_router_poisoned(&self) {
        self.router_poisoned_total.inc();
    }

    pub fn record_reader_fallback_served(&self) {
        self.reader_fallback_served_total.inc();
    }

    pub fn set_reader_primary_available(&self, available: bool) {
        self.reader_primary_available.set(if available { 1 } else { 0 });
    }

    pub fn record_replay_processed(&self) {
        self.replay_processed_total.inc();
    }

    pub fn record_replay_errored(&self) {
        self.replay_errored_total.inc();
    }

    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            IngestError::retryable_with_category(
                format!("failed to encode metrics: {e}"),
                ErrorCategory::Unknown,
            )
        })?;
        String::from_utf8(buffer).map_err(|e| {
            IngestError::permanent_with_category(
                format!("metrics output was not valid utf-8: {e}"),
                ErrorCategory::Unknown,
            )
        })
    }
}

fn registry_err(e: prometheus::Error) -> IngestError {
    IngestError::permanent_with_category(format!("failed to register metric: {e}"), ErrorCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_registered_metric_names() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_event_received();
        collector.record_event_processed();
        collector.set_dlq_entries(3);

        let output = collector.export_prometheus().unwrap();
        assert!(output.contains("ingest_events_received_total"));
        assert!(output.contains("ingest_dlq_entries"));
    }
}
