//! Frame processors for the pipeline
//!
//! - `ProcessorChain` - channel-based chain and its runner
//! - `VadProcessor` - speech start/stop from inbound audio
//! - `TranscriptionProcessor` - utterance speech-to-text
//! - `TurnProcessor` - turn-taking and barge-in
//! - `UserContextAggregator`, `AssistantContextAggregator` - context commits
//! - `GenerationProcessor` - streaming generation
//! - `TransportOutput` - outbound audio

mod aggregators;
mod chain;
mod generation;
mod transcription;
mod transport_output;
mod turn_processor;
mod vad_processor;

pub use aggregators::{AssistantContextAggregator, UserContextAggregator};
pub use chain::{PipelineHandle, ProcessorChain, ProcessorChainBuilder};
pub use generation::GenerationProcessor;
pub use transcription::{TranscriptionConfig, TranscriptionProcessor};
pub use transport_output::TransportOutput;
pub use turn_processor::TurnProcessor;
pub use vad_processor::VadProcessor;
