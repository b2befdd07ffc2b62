//! Error types shared by every parley crate
//!
//! Each crate owns a narrower `thiserror` enum and converts into [`Error`]
//! at its boundary. The variants mirror how far an error is allowed to travel:
//! per-turn failures end a turn, lifecycle failures reach the session.

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport failed; the session closes gracefully
    #[error("Transport error: {0}")]
    Transport(String),

    /// Generation service failed; ends the current turn only
    #[error("Generation service error: {0}")]
    GenerationService(String),

    /// Knowledge retrieval failed; the session starts degraded
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Out-of-order or malformed control input; logged and ignored
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A stage did not unwind within its cancellation timeout
    #[error("Fatal scheduler error: {0}")]
    FatalScheduler(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Context store error: {0}")]
    Context(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    /// Whether the session can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::FatalScheduler(_))
    }

    /// Whether the error is scoped to a single turn
    pub fn is_turn_scoped(&self) -> bool {
        matches!(
            self,
            Error::GenerationService(_) | Error::Transcription(_) | Error::ProtocolViolation(_)
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::GenerationService(_) => "generation",
            Error::Retrieval(_) => "retrieval",
            Error::ProtocolViolation(_) => "protocol",
            Error::FatalScheduler(_) => "fatal_scheduler",
            Error::Transcription(_) => "transcription",
            Error::Context(_) => "context",
            Error::Configuration(_) => "configuration",
            Error::ChannelClosed(_) => "channel_closed",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed("receiver dropped".to_string())
    }
}
