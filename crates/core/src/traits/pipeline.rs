//! Pipeline frames and the frame processor trait

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::audio::AudioChunk;
use crate::conversation::{Message, Role, TurnId};
use crate::Result;

/// Direction a frame travels through the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    /// From transport-in toward transport-out
    Downstream,
    /// Control feedback toward the head of the chain
    Upstream,
}

impl FrameDirection {
    pub fn reverse(self) -> Self {
        match self {
            FrameDirection::Downstream => FrameDirection::Upstream,
            FrameDirection::Upstream => FrameDirection::Downstream,
        }
    }
}

/// Streamed transcript text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptDelta {
    /// `User` for recognized speech, `Assistant` for generation output
    pub role: Role,
    pub text: String,
    pub is_final: bool,
}

impl TranscriptDelta {
    pub fn user(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            is_final,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            is_final: false,
        }
    }

    /// Whether the delta carries any non-whitespace text
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Why a turn was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptionReason {
    /// User started speaking over the assistant
    BargeIn,
    /// The generation service reported an error
    GenerationFailed,
    /// A stage returned an error while processing a frame
    StageFailure,
    /// The session is shutting down
    Cancelled,
}

impl InterruptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptionReason::BargeIn => "barge_in",
            InterruptionReason::GenerationFailed => "generation_failed",
            InterruptionReason::StageFailure => "stage_failure",
            InterruptionReason::Cancelled => "cancelled",
        }
    }
}

/// Interruption control frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruption {
    /// Turn being interrupted, when known
    pub turn_id: Option<TurnId>,
    pub reason: InterruptionReason,
}

/// Committed context handed to the generation stage
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    /// Assistant turn the snapshot was taken for
    pub turn_id: TurnId,
    pub messages: Arc<[Message]>,
}

/// Frame types that flow through the pipeline
///
/// Frames are immutable once created. Each frame has exactly one consumer at a
/// time; stages forward, transform or drop what they receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// PCM audio, inbound before transcription and outbound after generation
    AudioChunk(AudioChunk),

    /// Transcript text for the user or the assistant
    TranscriptDelta(TranscriptDelta),

    /// VAD detected the start of speech
    SpeechStart,

    /// VAD detected the end of speech
    SpeechStop,

    /// Current turn was interrupted
    Interruption(Interruption),

    /// Open an assistant turn without waiting for user input
    TriggerResponse,

    /// Turn machine entered `AssistantGenerating`; aggregator must commit and snapshot
    GenerationRequest { turn_id: TurnId },

    /// Context to generate from
    ContextSnapshot(ContextSnapshot),

    /// Generation for the turn finished normally
    GenerationComplete { turn_id: TurnId },

    /// Upstream source closed
    EndOfStream,
}

impl Frame {
    /// Check if this is an end-of-stream frame
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::EndOfStream)
    }

    /// Control frames steer turn-taking; everything else is data
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Frame::SpeechStart
                | Frame::SpeechStop
                | Frame::Interruption(_)
                | Frame::TriggerResponse
                | Frame::GenerationRequest { .. }
                | Frame::GenerationComplete { .. }
                | Frame::EndOfStream
        )
    }

    /// Turn the frame belongs to, if it carries one
    pub fn turn_id(&self) -> Option<TurnId> {
        match self {
            Frame::Interruption(i) => i.turn_id,
            Frame::GenerationRequest { turn_id } | Frame::GenerationComplete { turn_id } => {
                Some(*turn_id)
            }
            Frame::ContextSnapshot(snapshot) => Some(snapshot.turn_id),
            _ => None,
        }
    }

    /// Short name for tracing
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::AudioChunk(_) => "audio_chunk",
            Frame::TranscriptDelta(_) => "transcript_delta",
            Frame::SpeechStart => "speech_start",
            Frame::SpeechStop => "speech_stop",
            Frame::Interruption(_) => "interruption",
            Frame::TriggerResponse => "trigger_response",
            Frame::GenerationRequest { .. } => "generation_request",
            Frame::ContextSnapshot(_) => "context_snapshot",
            Frame::GenerationComplete { .. } => "generation_complete",
            Frame::EndOfStream => "end_of_stream",
        }
    }

    pub fn interruption(turn_id: Option<TurnId>, reason: InterruptionReason) -> Self {
        Frame::Interruption(Interruption { turn_id, reason })
    }
}

/// Per-stage processing context
///
/// Each stage task owns its own context. Besides identifying the session it
/// carries the cancellation signal and a queue of frames the stage wants sent
/// in a direction other than the one its return value goes.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    /// Session ID
    pub session_id: String,
    cancel: Option<watch::Receiver<bool>>,
    pushed: Vec<(FrameDirection, Frame)>,
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ProcessorContext {
    /// Create a new context for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: None,
            pushed: Vec::new(),
        }
    }

    /// Attach the scheduler's cancellation signal
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Queue a frame to be sent after the current call returns
    pub fn push(&mut self, direction: FrameDirection, frame: Frame) {
        self.pushed.push((direction, frame));
    }

    /// Drain frames queued with [`push`](Self::push)
    pub fn take_pushed(&mut self) -> Vec<(FrameDirection, Frame)> {
        std::mem::take(&mut self.pushed)
    }

    /// Whether the scheduler has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolve once the scheduler is cancelled. Never resolves without a signal attached.
    pub async fn cancelled(&self) {
        match self.cancel.clone() {
            Some(mut rx) => {
                // A dropped sender means the scheduler is gone, which counts as cancelled.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Frame processor for pipeline stages
///
/// Each processor receives frames, processes them, and emits output frames in
/// the same direction. Processors run in separate tokio tasks, connected by
/// bounded channels.
///
/// # Example Implementation
///
/// ```ignore
/// struct DropAudio;
///
/// #[async_trait]
/// impl FrameProcessor for DropAudio {
///     async fn process(
///         &self,
///         frame: Frame,
///         _direction: FrameDirection,
///         _ctx: &mut ProcessorContext,
///     ) -> Result<Vec<Frame>> {
///         match frame {
///             Frame::AudioChunk(_) => Ok(vec![]),
///             other => Ok(vec![other]),
///         }
///     }
///
///     fn name(&self) -> &'static str {
///         "drop_audio"
///     }
/// }
/// ```
#[async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    /// Process a frame and emit zero or more frames in the same direction
    ///
    /// Frames for the opposite direction go through [`ProcessorContext::push`].
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>>;

    /// Get processor name for tracing
    fn name(&self) -> &'static str;

    /// Get processor description
    fn description(&self) -> &str {
        ""
    }

    /// Called when pipeline starts
    async fn on_start(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Called when pipeline stops
    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Wait for frames the processor produces on its own, such as a streaming
    /// service response. Output goes downstream.
    ///
    /// The runner drops this future whenever an input frame arrives first, so
    /// implementations must not mutate state before their last `.await`.
    async fn produce(&self, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        std::future::pending::<Result<Vec<Frame>>>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kinds() {
        assert_eq!(Frame::SpeechStart.kind(), "speech_start");
        assert_eq!(Frame::EndOfStream.kind(), "end_of_stream");
        assert_eq!(Frame::GenerationComplete { turn_id: 3 }.kind(), "generation_complete");
    }

    #[test]
    fn test_frame_predicates() {
        assert!(Frame::SpeechStop.is_control());
        assert!(!Frame::TranscriptDelta(TranscriptDelta::user("hi", true)).is_control());
        assert!(Frame::EndOfStream.is_end_of_stream());
        assert_eq!(Frame::GenerationRequest { turn_id: 7 }.turn_id(), Some(7));
        assert_eq!(
            Frame::interruption(None, InterruptionReason::StageFailure).turn_id(),
            None
        );
    }

    #[test]
    fn test_transcript_content() {
        assert!(!TranscriptDelta::user("   ", true).has_content());
        assert!(TranscriptDelta::user(" Alice ", true).has_content());
    }

    #[test]
    fn test_context_push_queue() {
        let mut ctx = ProcessorContext::new("session-123");
        assert_eq!(ctx.session_id, "session-123");

        ctx.push(FrameDirection::Upstream, Frame::GenerationComplete { turn_id: 1 });
        let pushed = ctx.take_pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, FrameDirection::Upstream);
        assert!(ctx.take_pushed().is_empty());
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let (tx, rx) = watch::channel(false);
        let ctx = ProcessorContext::new("s").with_cancellation(rx);
        assert!(!ctx.is_cancelled());

        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(FrameDirection::Downstream.reverse(), FrameDirection::Upstream);
    }
}
