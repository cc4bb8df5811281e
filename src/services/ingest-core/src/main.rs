//! Ingest server binary entry point: loads configuration, wires every
//! component, and runs until a shutdown signal arrives.

use std::collections::HashMap;
use std::process;
use std::sync::Arc;

use clap::{Arg, Command};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingest_core::appender::{Appender, PostgresEventSink};
use ingest_core::bus::{Publisher, RedisBus};
use ingest_core::checkpoint::CheckpointStore;
use ingest_core::config::AppConfig;
use ingest_core::dlq::{AutoRetryWorker, BackoffPolicy, DeadLetterQueue, RetryHandler};
use ingest_core::dlq_store::DlqStore;
use ingest_core::handler::StoreHandler;
use ingest_core::health::{AppenderHealthCheck, DlqHealthCheck, HandlerHealthCheck, HealthAggregator};
use ingest_core::metrics::MetricsCollector;
use ingest_core::model::{MediaEvent, Source};
use ingest_core::outbox::{BusPublisher, OutboxForwarder, PostgresOutboxStore};
use ingest_core::router::{Router, RouterConfig};
use ingest_core::server::{build_router, AppState};
use ingest_core::{SERVICE_NAME, VERSION};

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = dotenvy::dotenv() {
        warn!("no .env file loaded: {}", e);
    }

    let matches = create_cli().get_matches();
    if matches.get_flag("validate-config") {
        match AppConfig::load() {
            Ok(_) => {
                info!("configuration is valid");
                process::exit(0);
            }
            Err(e) => {
                error!("configuration validation failed: {}", e);
                process::exit(1);
            }
        }
    }

    info!("starting {} version {}", SERVICE_NAME, VERSION);

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("service failed: {}", e);
        process::exit(1);
    }
    info!("service stopped gracefully");
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();
}

fn create_cli() -> Command {
    Command::new(SERVICE_NAME)
        .version(VERSION)
        .about("Durable, at-least-once playback-event ingestion pipeline")
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Adapts [`RedisBus`] to the outbox forwarder's [`BusPublisher`] trait,
/// topic-naming events the same way the router's own publishers do.
struct RedisOutboxPublisher {
    bus: Arc<RedisBus>,
}

#[async_trait::async_trait]
impl BusPublisher for RedisOutboxPublisher {
    async fn publish(&self, stream_name: &str, event: &MediaEvent) -> ingest_core::Result<()> {
        let payload = ingest_core::serializer::marshal(event)?;
        let mut metadata = HashMap::new();
        metadata.insert("event_id".to_string(), event.event_id.clone());
        self.bus.publish(stream_name, payload, metadata).await
    }
}

/// Retries a DLQ entry by re-publishing it back onto the bus topic its
/// source maps to, letting the router re-run the handler pipeline.
struct RepublishRetryHandler {
    bus: Arc<RedisBus>,
}

#[async_trait::async_trait]
impl RetryHandler for RepublishRetryHandler {
    async fn retry(&self, event: &MediaEvent) -> ingest_core::Result<()> {
        let topic = ingest_core::bus::derive_topic(event.source, event.media_type);
        let payload = ingest_core::serializer::marshal(event)?;
        let mut metadata = HashMap::new();
        metadata.insert("event_id".to_string(), event.event_id.clone());
        self.bus.publish(&topic, payload, metadata).await
    }
}

async fn run(config: AppConfig) -> ingest_core::Result<()> {
    let cancel = CancellationToken::new();

    let db = ingest_database::DatabaseManager::new(config.database.clone())
        .await
        .map_err(|e| ingest_core::IngestError::retryable(format!("failed to connect to database: {e}")))?;
    let pool = db.postgres.clone();

    let bus = Arc::new(RedisBus::connect(&config.bus.url).await?);

    let metrics = Arc::new(MetricsCollector::new()?);

    let appender_config: ingest_core::appender::AppenderConfig = config.appender.clone().into();
    let table = appender_config.table.clone();
    let sink = Arc::new(PostgresEventSink::new(pool.clone(), table).await?);
    let appender = Arc::new(Appender::new(sink, appender_config.clone()).with_metrics(metrics.clone()));

    let handler_config: ingest_core::handler::HandlerConfig = config.handler.clone().into();
    let store_handler = Arc::new(StoreHandler::new(appender.clone(), handler_config, None).with_metrics(metrics.clone()));
    let handler_stats = store_handler.stats();

    let dlq = Arc::new(
        DeadLetterQueue::new(
            config.dlq.max_entries,
            config.dlq.max_retries,
            config.dlq.retention(),
            config.dlq.backoff_policy(),
        )
        .with_metrics(metrics.clone()),
    );

    let router_config: RouterConfig = config.router.clone().into();
    let close_timeout = router_config.close_timeout;
    let router = Arc::new(
        Router::new(bus.clone(), bus.clone(), router_config)
            .with_dlq(dlq.clone())
            .with_metrics(metrics.clone()),
    );
    for source in Source::ALL {
        for media_type in [
            ingest_core::model::MediaType::Movie,
            ingest_core::model::MediaType::Episode,
            ingest_core::model::MediaType::Track,
        ] {
            let topic = ingest_core::bus::derive_topic(source, media_type);
            router.add_handler(format!("store-{topic}"), topic, None, store_handler.clone());
        }
    }

    let _dlq_store = DlqStore::new(pool.clone()).await?;
    let retry_worker = AutoRetryWorker::new(
        dlq.clone(),
        Arc::new(RepublishRetryHandler { bus: bus.clone() }),
        std::time::Duration::from_millis(config.forwarder.retry_delay_ms),
        4,
    )
    .with_metrics(metrics.clone());

    let outbox_store = Arc::new(PostgresOutboxStore::new(pool.clone()).await?);
    let outbox_publisher = Arc::new(RedisOutboxPublisher { bus: bus.clone() });
    let outbox_forwarder = OutboxForwarder::new(
        outbox_store,
        outbox_publisher,
        std::time::Duration::from_millis(config.forwarder.poll_interval_ms),
        config.forwarder.batch_size as i64,
        config.forwarder.max_retries,
    )
    .with_metrics(metrics.clone());

    let _checkpoints = Arc::new(CheckpointStore::new(pool.clone()).await?);

    let mut health = HealthAggregator::new(std::time::Duration::from_secs(config.health.timeout_secs));
    health.register("handler", Arc::new(HandlerHealthCheck::new(handler_stats.clone())));
    health.register(
        "appender",
        Arc::new(AppenderHealthCheck::new(appender.clone(), appender_config.max_buffer)),
    );
    health.register("dlq", Arc::new(DlqHealthCheck::new(dlq.clone())));
    let health = Arc::new(health);

    appender.start();

    let mut tasks = tokio::task::JoinSet::new();

    {
        let store_handler = store_handler.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { store_handler.run_cleanup_loop(cancel).await });
    }
    {
        let router = router.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { router.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { retry_worker.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { outbox_forwarder.run(cancel).await });
    }

    let state = AppState { health, metrics, handler_stats };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .map_err(|e| ingest_core::IngestError::permanent(format!("failed to bind {}: {e}", config.server.bind_address)))?;
    info!(address = %config.server.bind_address, "http server listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background tasks");
    cancel.cancel();

    router.close(close_timeout).await;
    appender.close(close_timeout).await;

    if let Err(e) = server.await {
        error!(error = %e, "http server task panicked");
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received ctrl-c"); },
        _ = terminate => { info!("received sigterm"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_name_matches_service_name() {
        let cli = create_cli();
        assert_eq!(cli.get_name(), SERVICE_NAME);
    }
}
