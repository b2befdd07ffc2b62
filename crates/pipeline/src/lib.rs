//! Voice conversation pipeline
//!
//! This crate provides the session's processing core:
//! - Pipeline scheduler (`ProcessorChain`, `PipelineHandle`)
//! - Turn state machine with barge-in
//! - Context store and the user/assistant aggregators
//! - Energy-based voice activity detection
//! - HTTP speech-to-text
//! - Pipeline events for observers

pub mod context;
pub mod events;
pub mod processors;
pub mod stt;
pub mod turn_detection;
pub mod vad;

pub use context::{ContextStore, RoleWriter};
pub use events::{event_channel, PipelineEvent, EVENT_CHANNEL_CAPACITY};
pub use processors::{
    AssistantContextAggregator, GenerationProcessor, PipelineHandle, ProcessorChain,
    ProcessorChainBuilder, TranscriptionConfig, TranscriptionProcessor, TransportOutput,
    TurnProcessor, UserContextAggregator, VadProcessor,
};
pub use stt::HttpTranscriber;
pub use turn_detection::{TurnEffect, TurnLedger, TurnMonitor, TurnPhase, TurnStateMachine};
pub use vad::{EnergyVad, EnergyVadConfig};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("Stages [{stages}] did not stop within {timeout_ms}ms")]
    Unwind { stages: String, timeout_ms: u64 },
}

impl From<PipelineError> for parley_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Stt(msg) => parley_core::Error::Transcription(msg),
            err @ PipelineError::Unwind { .. } => {
                parley_core::Error::FatalScheduler(err.to_string())
            }
        }
    }
}
