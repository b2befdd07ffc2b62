//! HTTP endpoints

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::{AppState, ConnectionInfo};
use crate::websocket::ws_handler;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let knowledge_base = state
        .config
        .retrieval
        .knowledge_base_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    let tts = state.config.generation.tts_endpoint.is_some();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": if knowledge_base { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "connections": state.connections.len(),
            "checks": {
                "knowledge_base": if knowledge_base { "configured" } else { "missing" },
                "tts": if tts { "configured" } else { "disabled" },
            }
        })),
    )
}

/// GET /api/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.connections.list())
}
