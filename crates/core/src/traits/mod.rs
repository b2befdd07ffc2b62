//! Capability traits consumed by the pipeline
//!
//! - `pipeline` - frames and the `FrameProcessor` stage trait
//! - `generation` - cancellable streaming generation
//! - `retriever` - one-shot knowledge lookup
//! - `speech` - voice activity detection and speech-to-text
//! - `transport` - outbound audio sink

mod generation;
mod pipeline;
mod retriever;
mod speech;
mod transport;

pub use generation::{
    CancelHandle, CancelSignal, GenerationEvent, GenerationProducer, GenerationRequest,
    GenerationService, GenerationStream, DEFAULT_EVENT_BUFFER,
};
pub use pipeline::{
    ContextSnapshot, Frame, FrameDirection, FrameProcessor, Interruption, InterruptionReason,
    ProcessorContext, TranscriptDelta,
};
pub use retriever::KnowledgeRetriever;
pub use speech::{SpeechToText, VadEvent, VoiceActivityDetector};
pub use transport::AudioSink;
