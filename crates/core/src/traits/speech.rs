//! Speech processing traits

use async_trait::async_trait;

use crate::audio::AudioChunk;
use crate::Result;

/// Boundary events reported by a voice activity detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechStop,
}

/// Voice activity detector
///
/// Treated as a black-box classifier: it sees every inbound chunk in order and
/// reports a boundary when one is crossed. Most chunks produce `None`.
pub trait VoiceActivityDetector: Send + Sync + 'static {
    /// Classify the next chunk
    fn classify(&self, chunk: &AudioChunk) -> Option<VadEvent>;

    /// Forget any in-progress speech
    fn reset(&self);

    /// Whether the detector currently considers the user to be speaking
    fn is_speaking(&self) -> bool;
}

/// Speech-to-Text interface
///
/// Transcribes one complete utterance per call.
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Transcribe the utterance; an empty string means nothing was recognized
    async fn transcribe(&self, utterance: &AudioChunk) -> Result<String>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}
