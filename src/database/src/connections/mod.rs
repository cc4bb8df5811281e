//! Database connection management for the ingestion platform.
//!
//! This module handles the initialization, pooling, and lifecycle management
//! of the PostgreSQL connection used by the analytical store, DLQ mirror,
//! checkpoint store, and dedupe audit log.

pub mod postgresql;

use serde::{Deserialize, Serialize};

use super::DatabaseError;

pub use postgresql::{PoolStats, PostgresConnection};

/// Connection factory for creating database connections.
pub struct ConnectionFactory {
    postgres_config: Option<PostgresConfig>,
}

impl ConnectionFactory {
    /// Create new connection factory with PostgreSQL configuration.
    pub fn with_postgres(postgres_config: PostgresConfig) -> Self {
        Self {
            postgres_config: Some(postgres_config),
        }
    }

    /// Create PostgreSQL connection.
    pub async fn create_postgres(&self) -> Result<PostgresConnection, DatabaseError> {
        match &self.postgres_config {
            Some(config) => PostgresConnection::new(config.clone()).await,
            None => Err(DatabaseError::Connection(
                "PostgreSQL configuration not provided".to_string(),
            )),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/playback_events".to_string(),
            max_connections: 20,
            min_connections: 5,
            acquire_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            max_lifetime_seconds: 1800,
        }
    }
}

/// Monitoring configuration for the connection pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub metrics_interval_seconds: u64,
    pub slow_query_threshold_ms: u64,
    pub health_check_interval_seconds: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval_seconds: 60,
            slow_query_threshold_ms: 1000,
            health_check_interval_seconds: 30,
        }
    }
}

/// Health check result for connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
}
