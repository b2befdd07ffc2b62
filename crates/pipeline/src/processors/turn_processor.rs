//! Turn-taking stage
//!
//! Feeds VAD, transcript and generation feedback into the [`TurnStateMachine`]
//! and turns its effects into frames. Phase changes are published on a watch
//! channel and every turn transition is recorded in the [`TurnLedger`].

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use parley_core::{
    Frame, FrameDirection, FrameProcessor, ProcessorContext, Result, Role, TurnStatus,
};

use crate::events::PipelineEvent;
use crate::turn_detection::{TurnEffect, TurnLedger, TurnMonitor, TurnPhase, TurnStateMachine};

pub struct TurnProcessor {
    machine: Mutex<TurnStateMachine>,
    phase_tx: watch::Sender<TurnPhase>,
    ledger: TurnLedger,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl TurnProcessor {
    pub fn new(allow_interruptions: bool) -> Self {
        let (phase_tx, _) = watch::channel(TurnPhase::Idle);
        Self {
            machine: Mutex::new(TurnStateMachine::new(allow_interruptions)),
            phase_tx,
            ledger: TurnLedger::new(),
            events: None,
        }
    }

    /// Record turns into a ledger owned by someone else
    pub fn with_ledger(mut self, ledger: TurnLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn monitor(&self) -> TurnMonitor {
        TurnMonitor::new(self.phase_tx.subscribe())
    }

    pub fn ledger(&self) -> TurnLedger {
        self.ledger.clone()
    }

    pub fn phase(&self) -> TurnPhase {
        self.machine.lock().phase()
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Apply effects and return the frames they produce, in effect order
    fn apply(
        &self,
        effects: Vec<TurnEffect>,
        input: Option<Frame>,
        context: &ProcessorContext,
    ) -> Vec<Frame> {
        let mut input = input;
        let mut out = Vec::new();

        for effect in effects {
            match effect {
                TurnEffect::ForwardSpeechStart => out.push(Frame::SpeechStart),
                TurnEffect::ForwardSpeechStop => out.push(Frame::SpeechStop),
                TurnEffect::ForwardTranscript => out.extend(input.take()),
                TurnEffect::RequestGeneration { turn_id } => {
                    out.push(Frame::GenerationRequest { turn_id })
                }
                TurnEffect::Interrupt { turn_id, reason } => {
                    metrics::counter!("parley_interruptions_total", "reason" => reason.as_str())
                        .increment(1);
                    tracing::info!(
                        session_id = %context.session_id,
                        turn_id,
                        reason = reason.as_str(),
                        "Turn interrupted"
                    );
                    self.publish(PipelineEvent::Interrupted {
                        turn_id: Some(turn_id),
                        reason,
                    });
                    out.push(Frame::interruption(Some(turn_id), reason));
                }
                TurnEffect::Phase { old, new } => {
                    tracing::debug!(
                        session_id = %context.session_id,
                        from = old.as_str(),
                        to = new.as_str(),
                        "Turn phase changed"
                    );
                    self.phase_tx.send_replace(new);
                    self.publish(PipelineEvent::PhaseChanged { old, new });
                }
                TurnEffect::TurnChanged(turn) => {
                    if turn.status == TurnStatus::Active {
                        metrics::counter!("parley_turns_total", "owner" => turn.owner.as_str())
                            .increment(1);
                    }
                    self.ledger.record(&turn);
                    self.publish(PipelineEvent::TurnUpdated(turn));
                }
                TurnEffect::Violation(message) => {
                    metrics::counter!("parley_protocol_violations_total").increment(1);
                    tracing::warn!(
                        session_id = %context.session_id,
                        violation = %message,
                        "Ignoring out-of-order frame"
                    );
                    self.publish(PipelineEvent::ProtocolViolation {
                        stage: self.name(),
                        message,
                    });
                }
            }
        }
        out
    }

    fn process_downstream(&self, frame: Frame, context: &ProcessorContext) -> Vec<Frame> {
        match frame {
            Frame::SpeechStart => {
                let effects = self.machine.lock().on_speech_start();
                self.apply(effects, None, context)
            }
            Frame::SpeechStop => {
                let effects = self.machine.lock().on_speech_stop();
                self.apply(effects, None, context)
            }
            Frame::TranscriptDelta(delta) if delta.role == Role::User => {
                let effects = self.machine.lock().on_user_transcript(delta.has_content());
                self.apply(effects, Some(Frame::TranscriptDelta(delta)), context)
            }
            Frame::TriggerResponse => {
                let effects = self.machine.lock().on_trigger_response();
                self.apply(effects, None, context)
            }
            // a stage ahead of this one failed
            Frame::Interruption(interruption) => {
                let effects = self
                    .machine
                    .lock()
                    .on_failure(interruption.turn_id, interruption.reason);
                let mut out = self.apply(effects, None, context);
                // the closed turn's own interruption replaces the anonymous one
                if !out.iter().any(|f| matches!(f, Frame::Interruption(_))) {
                    out.push(Frame::Interruption(interruption));
                }
                out
            }
            Frame::EndOfStream => {
                let effects = self.machine.lock().on_end_of_stream();
                let mut out = self.apply(effects, None, context);
                out.push(Frame::EndOfStream);
                out
            }
            other => vec![other],
        }
    }
}

#[async_trait]
impl FrameProcessor for TurnProcessor {
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if direction == FrameDirection::Downstream {
            return Ok(self.process_downstream(frame, context));
        }

        // Feedback from later stages ends here; anything it causes goes downstream.
        let effects = match frame {
            Frame::GenerationComplete { turn_id } => {
                self.machine.lock().on_generation_complete(turn_id)
            }
            Frame::Interruption(interruption) => {
                let effects = self
                    .machine
                    .lock()
                    .on_failure(interruption.turn_id, interruption.reason);
                if !effects.iter().any(|e| matches!(e, TurnEffect::Interrupt { .. })) {
                    self.publish(PipelineEvent::Interrupted {
                        turn_id: interruption.turn_id,
                        reason: interruption.reason,
                    });
                }
                effects
            }
            other => return Ok(vec![other]),
        };
        for frame in self.apply(effects, None, context) {
            context.push(FrameDirection::Downstream, frame);
        }
        Ok(vec![])
    }

    fn name(&self) -> &'static str {
        "turn"
    }

    fn description(&self) -> &str {
        "Turn-taking state machine"
    }
}
