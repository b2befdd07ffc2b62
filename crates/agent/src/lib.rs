//! Voice sessions
//!
//! One [`SessionOrchestrator`] per connection: it preloads knowledge, seeds
//! the context store, runs the voice pipeline and reacts to the transport's
//! lifecycle events until the connection closes.

pub mod assembly;
pub mod orchestrator;
pub mod services;
pub mod session;

pub use assembly::{build_voice_pipeline, VoicePipeline};
pub use orchestrator::{SessionConfig, SessionOrchestrator, SessionOutcome};
pub use services::{SessionServices, SharedServices};
pub use session::{Session, SessionStatus};

use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl From<parley_core::Error> for AgentError {
    fn from(err: parley_core::Error) -> Self {
        AgentError::Pipeline(err.to_string())
    }
}

impl From<parley_pipeline::PipelineError> for AgentError {
    fn from(err: parley_pipeline::PipelineError) -> Self {
        AgentError::Initialization(err.to_string())
    }
}

impl From<parley_llm::LlmError> for AgentError {
    fn from(err: parley_llm::LlmError) -> Self {
        AgentError::Initialization(format!("Generation service: {}", err))
    }
}

impl From<parley_rag::RagError> for AgentError {
    fn from(err: parley_rag::RagError) -> Self {
        AgentError::Initialization(format!("Retrieval: {}", err))
    }
}
