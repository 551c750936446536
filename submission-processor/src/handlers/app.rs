use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing, Router};
use health::{HealthRegistry, HealthStatus};
use metrics_exporter_prometheus::PrometheusHandle;

use submission_common::metrics;

use crate::topology::managed::ManagedStream;

#[derive(Clone)]
pub struct AppState {
    streams: Arc<Vec<Arc<ManagedStream>>>,
    health: Arc<HealthRegistry>,
}

impl AppState {
    pub fn new(streams: Vec<Arc<ManagedStream>>, health: HealthRegistry) -> Self {
        Self {
            streams: Arc::new(streams),
            health: Arc::new(health),
        }
    }
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/isalive", routing::get(is_alive))
        .route("/isready", routing::get(is_ready))
        .route("/health", routing::get(health))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

async fn is_alive(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.streams.iter().all(|stream| stream.is_healthy()) {
        (StatusCode::OK, "ALIVE")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEAD")
    }
}

async fn is_ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.streams.iter().all(|stream| stream.is_ready()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn health(State(state): State<AppState>) -> HealthStatus {
    state.health.get_status().await
}
