//! Database layer for the playback-event ingestion pipeline.
//!
//! Provides a thin PostgreSQL connection-pool abstraction and health
//! monitoring shared by the analytical store, the DLQ mirror, the
//! checkpoint store, and the dedupe audit log. Schema objects for those
//! tables are created inline by their owning modules in `ingest-core` at
//! startup rather than tracked here as versioned migrations.

pub mod connections;
pub mod health;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;

pub use connections::{ConnectionFactory, ConnectionHealth, MonitoringConfig, PostgresConfig};
pub use health::*;

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub postgresql: PostgresConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgresql: PostgresConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Database manager owning the shared PostgreSQL pool.
#[derive(Clone)]
pub struct DatabaseManager {
    pub postgres: Arc<PgPool>,
    pub config: DatabaseConfig,
}

impl DatabaseManager {
    /// Initialize the database connection pool.
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        tracing::info!("Initializing database connections...");

        let postgres = Self::init_postgres(&config.postgresql)
            .await
            .context("Failed to initialize PostgreSQL connection")?;

        tracing::info!("Database connections initialized successfully");
        Ok(Self { postgres, config })
    }

    /// Initialize PostgreSQL connection pool.
    async fn init_postgres(config: &PostgresConfig) -> Result<Arc<PgPool>> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
            .connect(&config.url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        let row = sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("Failed to test PostgreSQL connection")?;

        let value: i32 = row.try_get(0)?;
        if value != 1 {
            return Err(anyhow::anyhow!("PostgreSQL connection test failed"));
        }

        Ok(Arc::new(pool))
    }

    /// Execute a PostgreSQL transaction, committing on success and rolling
    /// back on error.
    pub async fn execute_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'a> FnOnce(
                &'a mut sqlx::Transaction<'_, sqlx::Postgres>,
            )
                -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<R>> + Send + 'a>>
            + Send,
        R: Send,
    {
        let mut tx = self.postgres.begin().await?;

        match f(&mut tx).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Health check for the database connection.
    pub async fn health_check(&self) -> Result<health::HealthStatus> {
        let pg_health = self.check_postgres_health().await?;

        Ok(health::HealthStatus {
            postgres: health::PostgresHealth {
                healthy: pg_health.healthy,
                response_time_ms: pg_health.response_time_ms,
                connection_pool: health::PoolHealth {
                    total_connections: pg_health.connection_pool_size,
                    idle_connections: self.postgres.num_idle(),
                    active_connections: pg_health.active_connections,
                    pool_utilization_percent: if pg_health.connection_pool_size > 0 {
                        (pg_health.active_connections as f32
                            / pg_health.connection_pool_size as f32)
                            * 100.0
                    } else {
                        0.0
                    },
                },
                error_message: pg_health.error_message.clone(),
                last_successful_connection: if pg_health.healthy {
                    Some(chrono::Utc::now())
                } else {
                    None
                },
            },
            overall_healthy: pg_health.healthy,
            last_check: chrono::Utc::now(),
        })
    }

    async fn check_postgres_health(&self) -> Result<DatabaseHealthStatus> {
        let start_time = std::time::Instant::now();

        let result = sqlx::query("SELECT 1").fetch_one(&*self.postgres).await;

        let response_time = start_time.elapsed();

        match result {
            Ok(_) => Ok(DatabaseHealthStatus {
                healthy: true,
                response_time_ms: response_time.as_millis() as u64,
                error_message: None,
                connection_pool_size: self.postgres.size(),
                active_connections: self.postgres.size() - self.postgres.num_idle() as u32,
            }),
            Err(e) => Ok(DatabaseHealthStatus {
                healthy: false,
                response_time_ms: response_time.as_millis() as u64,
                error_message: Some(e.to_string()),
                connection_pool_size: self.postgres.size(),
                active_connections: 0,
            }),
        }
    }

    /// Graceful shutdown of the database connection pool.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down database connections...");
        self.postgres.close().await;
        tracing::info!("Database connections closed");
    }
}

/// Health status for an individual database connection.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealthStatus {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub connection_pool_size: u32,
    pub active_connections: u32,
}

/// Common database error type.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.postgresql.max_connections, 20);
        assert_eq!(config.postgresql.min_connections, 5);
        assert!(config.monitoring.enabled);
    }
}
