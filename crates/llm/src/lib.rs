//! Generation service for spoken replies
//!
//! Features:
//! - Streaming chat completion against an Ollama-compatible endpoint
//! - Sentence chunking of the token stream
//! - HTTP speech synthesis with a named voice
//! - `VoiceGenerationService`, the cancellable stream the pipeline consumes

pub mod backend;
pub mod sentence;
pub mod service;
pub mod speech;

pub use backend::{ChatBackend, ChatResult, FinishReason, LlmConfig, NdjsonLines, OllamaChatBackend};
pub use sentence::{SentenceChunker, SentenceChunkerConfig};
pub use service::VoiceGenerationService;
pub use speech::{HttpSpeechSynthesizer, SpeechSynthesizer, TtsConfig};

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for parley_core::Error {
    fn from(err: LlmError) -> Self {
        parley_core::Error::GenerationService(err.to_string())
    }
}
