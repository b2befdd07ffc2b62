//! Knowledge retrieval
//!
//! Features:
//! - HTTP client for a retrieve-and-generate knowledge-base endpoint
//! - One-shot preloader that never blocks session start

pub mod preloader;
pub mod retriever;

pub use preloader::{Knowledge, RetrievalPreloader};
pub use retriever::HttpKnowledgeRetriever;

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Knowledge base error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Retrieval timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RagError::Timeout
        } else if err.is_decode() {
            RagError::InvalidResponse(err.to_string())
        } else {
            RagError::Connection(err.to_string())
        }
    }
}

impl From<RagError> for parley_core::Error {
    fn from(err: RagError) -> Self {
        parley_core::Error::Retrieval(err.to_string())
    }
}
