//! Core traits and types for the parley voice agent
//!
//! This crate provides foundational types used across all other crates:
//! - Pipeline frames and the `FrameProcessor` stage trait
//! - Audio chunks (PCM16, little-endian)
//! - Messages, turns and the conversation record
//! - Capability traits for generation, retrieval, speech and transport
//! - Error types

pub mod audio;
pub mod conversation;
pub mod error;
pub mod traits;

pub use audio::{AudioChunk, SampleRate};
pub use conversation::{
    ConversationRecord, Message, RecordEntry, Role, Turn, TurnId, TurnOwner, TurnStatus,
};
pub use error::{Error, Result};

pub use traits::{
    AudioSink,
    CancelHandle,
    CancelSignal,
    ContextSnapshot,
    Frame,
    FrameDirection,
    // Pipeline
    FrameProcessor,
    GenerationEvent,
    GenerationProducer,
    GenerationRequest,
    // Generation
    GenerationService,
    GenerationStream,
    Interruption,
    InterruptionReason,
    // Retrieval
    KnowledgeRetriever,
    ProcessorContext,
    // Speech
    SpeechToText,
    TranscriptDelta,
    VadEvent,
    VoiceActivityDetector,
    DEFAULT_EVENT_BUFFER,
};
