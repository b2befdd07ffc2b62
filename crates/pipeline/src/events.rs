//! Pipeline events for observers
//!
//! Broadcast from the stages as things happen. Lossy for slow subscribers;
//! the Context Store and turn ledger stay the source of truth.

use tokio::sync::broadcast;

use parley_core::{InterruptionReason, Message, Turn, TurnId};

use crate::turn_detection::TurnPhase;

/// Default broadcast buffer
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Turn state machine moved between phases
    PhaseChanged { old: TurnPhase, new: TurnPhase },
    /// A turn was created or changed status
    TurnUpdated(Turn),
    /// An aggregator committed a message
    MessageCommitted(Message),
    /// A turn was interrupted
    Interrupted {
        turn_id: Option<TurnId>,
        reason: InterruptionReason,
    },
    /// The generation stage started a request
    GenerationStarted { turn_id: TurnId },
    /// The generation stage reported a service error
    GenerationFailed { turn_id: TurnId, message: String },
    /// A stage returned an error
    StageError { stage: &'static str, message: String },
    /// A control frame arrived out of order and was ignored
    ProtocolViolation { stage: &'static str, message: String },
}

/// Create an event channel
pub fn event_channel() -> (broadcast::Sender<PipelineEvent>, broadcast::Receiver<PipelineEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
