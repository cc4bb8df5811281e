//! Ambient HTTP surface: health, readiness, liveness, Prometheus metrics,
//! and a stats endpoint for operators.
//!
//! Grounded in `event-streaming/src/handlers.rs`'s handler shape
//! (`State`-extracted shared service, `Json` responses, a sanitized
//! error-response type) wired through a plain `axum::Router`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::debug;

use crate::handler::HandlerStats;
use crate::health::{HealthAggregator, Rollup};
use crate::metrics::MetricsCollector;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthAggregator>,
    pub metrics: Arc<MetricsCollector>,
    pub handler_stats: Arc<HandlerStats>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/live", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("handling health check request");
    let aggregate = state.health.check().await;
    let status_code = match aggregate.rollup {
        Rollup::Healthy => StatusCode::OK,
        Rollup::Degraded => StatusCode::OK,
        Rollup::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(aggregate))
}

async fn readiness_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ready", "timestamp": chrono::Utc::now() }))
}

async fn liveness_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive", "timestamp": chrono::Utc::now() }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.export_prometheus() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: "metrics_export_failed".to_string(), message: err.to_string() }),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    received: u64,
    parse_errors: u64,
    duplicates_skipped: u64,
    processed: u64,
    parse_error_rate: f64,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    use std::sync::atomic::Ordering;
    let stats = &state.handler_stats;
    Json(StatsResponse {
        received: stats.received.load(Ordering::Relaxed),
        parse_errors: stats.parse_errors.load(Ordering::Relaxed),
        duplicates_skipped: stats.duplicates_skipped.load(Ordering::Relaxed),
        processed: stats.processed.load(Ordering::Relaxed),
        parse_error_rate: stats.parse_error_rate(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            health: Arc::new(HealthAggregator::new(std::time::Duration::from_secs(1))),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
            handler_stats: Arc::new(HandlerStats::default()),
        }
    }

    #[tokio::test]
    async fn liveness_returns_alive() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_with_no_components_registered_is_healthy() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
