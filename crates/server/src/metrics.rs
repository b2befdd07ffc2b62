//! Prometheus metrics

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;
use crate::ServerError;

/// Install the global Prometheus recorder. Call once, before any metric is
/// recorded.
pub fn init_metrics() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Initialization(format!("Prometheus recorder: {}", e)))?;

    gauge!("parley_connections_active").set(0.0);
    Ok(handle)
}

pub fn record_active_connections(count: usize) {
    gauge!("parley_connections_active").set(count as f64);
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    record_active_connections(state.connections.len());

    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics are disabled".to_string(),
        ),
    }
}
