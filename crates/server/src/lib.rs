//! Parley server
//!
//! WebSocket endpoint for voice sessions plus HTTP health, session listing
//! and Prometheus metrics.

pub mod http;
pub mod metrics;
pub mod state;
pub mod websocket;

pub use http::create_router;
pub use metrics::init_metrics;
pub use state::{AppState, ConnectionInfo, ConnectionRegistry};

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Too many connections (limit {0})")]
    AtCapacity(usize),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::WebSocket(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::AtCapacity(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Initialization(_) | ServerError::Internal(_) => {
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<parley_agent::AgentError> for ServerError {
    fn from(err: parley_agent::AgentError) -> Self {
        ServerError::Initialization(err.to_string())
    }
}

impl From<parley_config::ConfigError> for ServerError {
    fn from(err: parley_config::ConfigError) -> Self {
        ServerError::Initialization(err.to_string())
    }
}

impl From<ServerError> for parley_core::Error {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::WebSocket(msg) => parley_core::Error::Transport(msg),
            other => parley_core::Error::Configuration(other.to_string()),
        }
    }
}
