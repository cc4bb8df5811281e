//! Layered configuration loading.
//!
//! Grounded in the teacher's `config` crate usage pattern (file + env
//! overlay) and `ingest-database::DatabaseConfig`'s nested-struct shape.
//! Centralizes the defaults already hardcoded in each component's own
//! `Default` impl so operators have one place to override them.

use std::time::Duration;

use config::{Config as RawConfig, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::appender::AppenderConfig;
use crate::handler::HandlerConfig;
use crate::reader::CircuitBreakerConfig;
use crate::router::RouterConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DlqSettings {
    pub max_retries: u32,
    pub max_entries: usize,
    pub retention_days: i64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    /// `0` means "use OS entropy"; any other value seeds the backoff RNG
    /// deterministically, which is useful for reproducible integration
    /// tests but unusual in production.
    pub random_seed: u64,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_entries: 10_000,
            retention_days: 7,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
            random_seed: 0,
        }
    }
}

impl DlqSettings {
    pub fn backoff_policy(&self) -> crate::dlq::BackoffPolicy {
        crate::dlq::BackoffPolicy {
            initial: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter,
            seed: if self.random_seed == 0 { None } else { Some(self.random_seed) },
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwarderSettings {
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub batch_size: usize,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            retry_delay_ms: 1_000,
            max_retries: 5,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    pub timeout_secs: u64,
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { timeout_secs: 5, interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusSettings {
    pub url: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0:8080".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub database: ingest_database::DatabaseConfig,
    pub appender: AppenderSettings,
    pub dlq: DlqSettings,
    pub router: RouterSettings,
    pub handler: HandlerSettings,
    pub forwarder: ForwarderSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub health: HealthSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            bus: BusSettings::default(),
            database: ingest_database::DatabaseConfig::default(),
            appender: AppenderSettings::default(),
            dlq: DlqSettings::default(),
            router: RouterSettings::default(),
            handler: HandlerSettings::default(),
            forwarder: ForwarderSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

/// Plain, serde-friendly mirror of [`AppenderConfig`] (which carries a
/// `Duration` that we want expressed in milliseconds on the wire).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppenderSettings {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub chunk_size: usize,
    pub table: String,
}

impl Default for AppenderSettings {
    fn default() -> Self {
        let defaults = AppenderConfig::default();
        Self {
            batch_size: defaults.max_buffer,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            chunk_size: defaults.chunk_size,
            table: defaults.table,
        }
    }
}

impl From<AppenderSettings> for AppenderConfig {
    fn from(s: AppenderSettings) -> Self {
        AppenderConfig {
            max_buffer: s.batch_size,
            flush_interval: Duration::from_millis(s.flush_interval_ms),
            chunk_size: s.chunk_size,
            table: s.table,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSettings {
    pub close_timeout_secs: u64,
    pub retry_max_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_multiplier: f64,
    pub throttle_per_second: u32,
    pub poison_queue_topic: String,
    pub dedup_enabled: bool,
    pub dedup_ttl_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let defaults = RouterConfig::default();
        Self {
            close_timeout_secs: defaults.close_timeout.as_secs(),
            retry_max_retries: defaults.retry_max_retries,
            retry_initial_ms: defaults.retry_initial.as_millis() as u64,
            retry_max_ms: defaults.retry_max.as_millis() as u64,
            retry_multiplier: defaults.retry_multiplier,
            throttle_per_second: defaults.throttle_per_second,
            poison_queue_topic: defaults.poison_queue_topic,
            dedup_enabled: defaults.dedup_enabled,
            dedup_ttl_secs: defaults.dedup_ttl.as_secs(),
        }
    }
}

impl From<RouterSettings> for RouterConfig {
    fn from(s: RouterSettings) -> Self {
        RouterConfig {
            close_timeout: Duration::from_secs(s.close_timeout_secs),
            retry_max_retries: s.retry_max_retries,
            retry_initial: Duration::from_millis(s.retry_initial_ms),
            retry_max: Duration::from_millis(s.retry_max_ms),
            retry_multiplier: s.retry_multiplier,
            throttle_per_second: s.throttle_per_second,
            poison_queue_topic: s.poison_queue_topic,
            dedup_enabled: s.dedup_enabled,
            dedup_ttl: Duration::from_secs(s.dedup_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerSettings {
    pub enable_cross_source_dedup: bool,
    pub dedup_window_secs: u64,
    pub max_dedup_entries: usize,
    pub enable_dedupe_audit: bool,
    pub store_raw_payload: bool,
    pub sync_flush: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        let defaults = HandlerConfig::default();
        Self {
            enable_cross_source_dedup: defaults.enable_cross_source_dedup,
            dedup_window_secs: defaults.dedup_window.as_secs(),
            max_dedup_entries: defaults.max_dedup_entries,
            enable_dedupe_audit: defaults.enable_dedupe_audit,
            store_raw_payload: defaults.store_raw_payload,
            sync_flush: defaults.sync_flush,
        }
    }
}

impl From<HandlerSettings> for HandlerConfig {
    fn from(s: HandlerSettings) -> Self {
        HandlerConfig {
            enable_cross_source_dedup: s.enable_cross_source_dedup,
            dedup_window: Duration::from_secs(s.dedup_window_secs),
            max_dedup_entries: s.max_dedup_entries,
            enable_dedupe_audit: s.enable_dedupe_audit,
            store_raw_payload: s.store_raw_payload,
            sync_flush: s.sync_flush,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    pub half_open_max_requests: u32,
    pub recovery_timeout_secs: u64,
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            half_open_max_requests: 3,
            recovery_timeout_secs: 10,
            failure_threshold: 5,
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            recovery_timeout: Duration::from_secs(s.recovery_timeout_secs),
            half_open_max_requests: s.half_open_max_requests,
        }
    }
}

impl AppConfig {
    /// Load from (in ascending priority) `config/default`, an optional
    /// `config/<env>` overlay selected by `INGEST_ENV`, and `INGEST_`-
    /// prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("INGEST_ENV").unwrap_or_else(|_| "development".to_string());

        let raw = RawConfig::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            .add_source(Environment::with_prefix("INGEST").separator("__"))
            .build()?;

        let config: AppConfig = raw.try_deserialize().unwrap_or_default();
        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    /// Reject configurations that would silently misbehave rather than
    /// fail fast: zero-sized buffers/batches, an inverted backoff range,
    /// and circuit breaker thresholds that can never trip or never close.
    pub fn validate(&self) -> Result<(), String> {
        if self.appender.batch_size == 0 {
            return Err("appender.batch_size must be greater than zero".to_string());
        }
        if self.appender.chunk_size == 0 {
            return Err("appender.chunk_size must be greater than zero".to_string());
        }
        if self.dlq.max_entries == 0 {
            return Err("dlq.max_entries must be greater than zero".to_string());
        }
        if self.dlq.initial_backoff_ms > self.dlq.max_backoff_ms {
            return Err("dlq.initial_backoff_ms must not exceed dlq.max_backoff_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.dlq.jitter) {
            return Err("dlq.jitter must be between 0.0 and 1.0".to_string());
        }
        if self.router.retry_initial_ms > self.router.retry_max_ms {
            return Err("router.retry_initial_ms must not exceed router.retry_max_ms".to_string());
        }
        if self.handler.max_dedup_entries == 0 {
            return Err("handler.max_dedup_entries must be greater than zero".to_string());
        }
        if self.forwarder.batch_size == 0 {
            return Err("forwarder.batch_size must be greater than zero".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be greater than zero".to_string());
        }
        if self.circuit_breaker.half_open_max_requests == 0 {
            return Err("circuit_breaker.half_open_max_requests must be greater than zero".to_string());
        }
        if self.health.timeout_secs == 0 {
            return Err("health.timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_backoff_range() {
        let mut config = AppConfig::default();
        config.dlq.initial_backoff_ms = 60_000;
        config.dlq.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.appender.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn appender_settings_round_trip_into_appender_config() {
        let settings = AppenderSettings::default();
        let config: AppenderConfig = settings.into();
        assert_eq!(config.max_buffer, 1000);
        assert_eq!(config.table, "playback_events");
    }
}
