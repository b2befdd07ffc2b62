//! Turn state machine
//!
//! Pure transition logic. Inputs are the control frames the turn stage sees;
//! outputs are [`TurnEffect`]s the stage turns into frames, ledger writes and
//! events. No I/O happens here, which keeps every transition unit-testable.
//!
//! ```text
//! Idle -> UserSpeaking -> UserTurnComplete -> AssistantGenerating -> AssistantTurnComplete -> Idle
//!                                                   |
//!                                                   +-- SpeechStart --> Interrupted -> UserSpeaking
//! ```

use serde::{Deserialize, Serialize};

use parley_core::{InterruptionReason, Turn, TurnId, TurnOwner, TurnStatus};

/// Whose turn it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    UserSpeaking,
    UserTurnComplete,
    AssistantGenerating,
    AssistantTurnComplete,
    Interrupted,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::UserSpeaking => "user_speaking",
            TurnPhase::UserTurnComplete => "user_turn_complete",
            TurnPhase::AssistantGenerating => "assistant_generating",
            TurnPhase::AssistantTurnComplete => "assistant_turn_complete",
            TurnPhase::Interrupted => "interrupted",
        }
    }
}

/// Result of applying one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEffect {
    /// Pass the speech start downstream
    ForwardSpeechStart,
    /// Pass the speech stop downstream
    ForwardSpeechStop,
    /// Pass the user transcript downstream
    ForwardTranscript,
    /// Cancel the given turn downstream
    Interrupt {
        turn_id: TurnId,
        reason: InterruptionReason,
    },
    /// Ask the aggregator to commit and snapshot for this assistant turn
    RequestGeneration { turn_id: TurnId },
    /// Phase changed
    Phase { old: TurnPhase, new: TurnPhase },
    /// Turn created or changed status
    TurnChanged(Turn),
    /// Input was out of order and ignored
    Violation(String),
}

/// Turn-taking state for one session
#[derive(Debug)]
pub struct TurnStateMachine {
    phase: TurnPhase,
    current: Option<Turn>,
    /// Assistant turn cut off by barge-in whose completion may still be in flight
    barged: Option<Turn>,
    next_turn_id: TurnId,
    user_has_content: bool,
    allow_interruptions: bool,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TurnStateMachine {
    pub fn new(allow_interruptions: bool) -> Self {
        Self {
            phase: TurnPhase::Idle,
            current: None,
            barged: None,
            next_turn_id: 1,
            user_has_content: false,
            allow_interruptions,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Turn currently open, if any
    pub fn current_turn(&self) -> Option<&Turn> {
        self.current.as_ref()
    }

    /// VAD reported speech start
    pub fn on_speech_start(&mut self) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        match self.phase {
            TurnPhase::Idle => {
                self.open_turn(TurnOwner::User, &mut effects);
                self.set_phase(TurnPhase::UserSpeaking, &mut effects);
                effects.push(TurnEffect::ForwardSpeechStart);
            }
            // Repeated start without a stop in between
            TurnPhase::UserSpeaking => {}
            TurnPhase::AssistantGenerating if self.allow_interruptions => {
                self.barged = self.current.clone();
                if let Some(turn_id) = self.close_turn(TurnStatus::Cancelled, &mut effects) {
                    self.set_phase(TurnPhase::Interrupted, &mut effects);
                    effects.push(TurnEffect::Interrupt {
                        turn_id,
                        reason: InterruptionReason::BargeIn,
                    });
                }
                self.open_turn(TurnOwner::User, &mut effects);
                self.set_phase(TurnPhase::UserSpeaking, &mut effects);
                effects.push(TurnEffect::ForwardSpeechStart);
            }
            TurnPhase::AssistantGenerating => {}
            other => effects.push(self.violation(format!("speech start while {}", other.as_str()))),
        }
        effects
    }

    /// Recognized user text arrived
    pub fn on_user_transcript(&mut self, has_content: bool) -> Vec<TurnEffect> {
        if self.phase != TurnPhase::UserSpeaking {
            return vec![self.violation(format!(
                "user transcript while {}",
                self.phase.as_str()
            ))];
        }
        if !has_content {
            return Vec::new();
        }
        self.user_has_content = true;
        vec![TurnEffect::ForwardTranscript]
    }

    /// VAD reported speech stop
    pub fn on_speech_stop(&mut self) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        match self.phase {
            TurnPhase::UserSpeaking if self.user_has_content => {
                self.set_turn_status(TurnStatus::Completing, &mut effects);
                self.close_turn(TurnStatus::Done, &mut effects);
                self.set_phase(TurnPhase::UserTurnComplete, &mut effects);
                effects.push(TurnEffect::ForwardSpeechStop);
                self.begin_assistant_turn(&mut effects);
            }
            TurnPhase::UserSpeaking => {
                // nothing was said; end the turn without committing
                self.close_turn(TurnStatus::Done, &mut effects);
                self.set_phase(TurnPhase::Idle, &mut effects);
                effects.push(TurnEffect::ForwardSpeechStop);
            }
            // speech the machine chose to ignore
            TurnPhase::AssistantGenerating if !self.allow_interruptions => {}
            other => effects.push(self.violation(format!("speech stop while {}", other.as_str()))),
        }
        effects
    }

    /// Open an assistant turn without user input
    pub fn on_trigger_response(&mut self) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        if self.phase == TurnPhase::Idle {
            self.begin_assistant_turn(&mut effects);
        } else {
            effects.push(self.violation(format!(
                "response trigger while {}",
                self.phase.as_str()
            )));
        }
        effects
    }

    /// Assistant output for `turn_id` was committed
    pub fn on_generation_complete(&mut self, turn_id: TurnId) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        if self.phase == TurnPhase::AssistantGenerating && self.is_current(turn_id) {
            self.set_turn_status(TurnStatus::Completing, &mut effects);
            self.close_turn(TurnStatus::Done, &mut effects);
            self.set_phase(TurnPhase::AssistantTurnComplete, &mut effects);
            self.set_phase(TurnPhase::Idle, &mut effects);
        } else if self.barged.as_ref().map(|t| t.id) == Some(turn_id) {
            // the reply was committed before the barge-in reached this stage
            if let Some(mut turn) = self.barged.take() {
                turn.status = TurnStatus::Done;
                effects.push(TurnEffect::TurnChanged(turn));
            }
        } else {
            effects.push(self.violation(format!(
                "generation complete for turn {} while {}",
                turn_id,
                self.phase.as_str()
            )));
        }
        effects
    }

    /// A stage or the generation service failed.
    ///
    /// `turn_id` of `None` applies to whatever turn is open. Unless the
    /// generation stage reported the failure itself, the closed turn is
    /// interrupted downstream so its stream and buffers are dropped.
    pub fn on_failure(
        &mut self,
        turn_id: Option<TurnId>,
        reason: InterruptionReason,
    ) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        let applies = match (turn_id, self.current.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(id), Some(turn)) => turn.id == id,
        };
        if applies {
            if let Some(closed) = self.close_turn(TurnStatus::Cancelled, &mut effects) {
                if reason != InterruptionReason::GenerationFailed {
                    effects.push(TurnEffect::Interrupt {
                        turn_id: closed,
                        reason,
                    });
                }
            }
            self.set_phase(TurnPhase::Idle, &mut effects);
        } else if let Some(id) = turn_id {
            effects.push(self.violation(format!("failure for stale turn {}", id)));
        }
        effects
    }

    /// Source closed; cancel whatever is open
    pub fn on_end_of_stream(&mut self) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        if self.close_turn(TurnStatus::Cancelled, &mut effects).is_some() {
            self.set_phase(TurnPhase::Idle, &mut effects);
        }
        effects
    }

    fn begin_assistant_turn(&mut self, effects: &mut Vec<TurnEffect>) {
        let turn_id = self.open_turn(TurnOwner::Assistant, effects);
        self.set_phase(TurnPhase::AssistantGenerating, effects);
        effects.push(TurnEffect::RequestGeneration { turn_id });
    }

    fn open_turn(&mut self, owner: TurnOwner, effects: &mut Vec<TurnEffect>) -> TurnId {
        if owner == TurnOwner::Assistant {
            self.barged = None;
        }
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        let turn = Turn::new(id, owner);
        effects.push(TurnEffect::TurnChanged(turn.clone()));
        self.current = Some(turn);
        self.user_has_content = false;
        id
    }

    fn set_turn_status(&mut self, status: TurnStatus, effects: &mut Vec<TurnEffect>) {
        if let Some(turn) = self.current.as_mut() {
            turn.status = status;
            effects.push(TurnEffect::TurnChanged(turn.clone()));
        }
    }

    fn close_turn(&mut self, status: TurnStatus, effects: &mut Vec<TurnEffect>) -> Option<TurnId> {
        let mut turn = self.current.take()?;
        turn.status = status;
        let id = turn.id;
        effects.push(TurnEffect::TurnChanged(turn));
        self.user_has_content = false;
        Some(id)
    }

    fn set_phase(&mut self, new: TurnPhase, effects: &mut Vec<TurnEffect>) {
        let old = std::mem::replace(&mut self.phase, new);
        if old != new {
            effects.push(TurnEffect::Phase { old, new });
        }
    }

    fn is_current(&self, turn_id: TurnId) -> bool {
        self.current.as_ref().map(|t| t.id) == Some(turn_id)
    }

    fn violation(&self, message: String) -> TurnEffect {
        TurnEffect::Violation(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_id(effects: &[TurnEffect]) -> Option<TurnId> {
        effects.iter().find_map(|e| match e {
            TurnEffect::RequestGeneration { turn_id } => Some(*turn_id),
            _ => None,
        })
    }

    fn has_violation(effects: &[TurnEffect]) -> bool {
        effects.iter().any(|e| matches!(e, TurnEffect::Violation(_)))
    }

    #[test]
    fn test_user_turn_then_generation() {
        let mut sm = TurnStateMachine::default();

        let effects = sm.on_speech_start();
        assert!(effects.contains(&TurnEffect::ForwardSpeechStart));
        assert_eq!(sm.phase(), TurnPhase::UserSpeaking);
        assert_eq!(sm.current_turn().unwrap().owner, TurnOwner::User);

        assert_eq!(sm.on_user_transcript(true), vec![TurnEffect::ForwardTranscript]);

        let effects = sm.on_speech_stop();
        assert!(effects.contains(&TurnEffect::ForwardSpeechStop));
        assert!(effects.contains(&TurnEffect::Phase {
            old: TurnPhase::UserSpeaking,
            new: TurnPhase::UserTurnComplete,
        }));
        let turn_id = request_id(&effects).unwrap();
        assert_eq!(turn_id, 2);
        assert_eq!(sm.phase(), TurnPhase::AssistantGenerating);

        let effects = sm.on_generation_complete(turn_id);
        assert!(!has_violation(&effects));
        assert!(effects.contains(&TurnEffect::Phase {
            old: TurnPhase::AssistantGenerating,
            new: TurnPhase::AssistantTurnComplete,
        }));
        assert_eq!(sm.phase(), TurnPhase::Idle);
        assert!(sm.current_turn().is_none());
    }

    #[test]
    fn test_speech_stop_without_transcript_is_noop() {
        let mut sm = TurnStateMachine::default();
        sm.on_speech_start();
        sm.on_user_transcript(false);

        let effects = sm.on_speech_stop();
        assert!(request_id(&effects).is_none());
        assert_eq!(sm.phase(), TurnPhase::Idle);
        assert!(effects.iter().any(|e| matches!(
            e,
            TurnEffect::TurnChanged(Turn { status: TurnStatus::Done, owner: TurnOwner::User, .. })
        )));
    }

    #[test]
    fn test_duplicate_speech_start_ignored() {
        let mut sm = TurnStateMachine::default();
        sm.on_speech_start();
        let id = sm.current_turn().unwrap().id;

        assert!(sm.on_speech_start().is_empty());
        assert_eq!(sm.current_turn().unwrap().id, id);
    }

    #[test]
    fn test_barge_in() {
        let mut sm = TurnStateMachine::default();
        let assistant = request_id(&sm.on_trigger_response()).unwrap();

        let effects = sm.on_speech_start();
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, TurnEffect::Interrupt { .. }))
                .count(),
            1
        );
        assert!(effects.contains(&TurnEffect::Interrupt {
            turn_id: assistant,
            reason: InterruptionReason::BargeIn,
        }));
        assert!(effects.contains(&TurnEffect::Phase {
            old: TurnPhase::AssistantGenerating,
            new: TurnPhase::Interrupted,
        }));
        assert_eq!(sm.phase(), TurnPhase::UserSpeaking);

        // stale completion for an unknown turn is ignored
        assert!(has_violation(&sm.on_generation_complete(assistant + 5)));
        assert_eq!(sm.phase(), TurnPhase::UserSpeaking);
    }

    #[test]
    fn test_completion_behind_barge_in_marks_turn_done() {
        let mut sm = TurnStateMachine::default();
        let assistant = request_id(&sm.on_trigger_response()).unwrap();
        sm.on_speech_start();
        let user = sm.current_turn().unwrap().id;

        let effects = sm.on_generation_complete(assistant);
        assert!(!has_violation(&effects));
        assert_eq!(
            effects,
            vec![TurnEffect::TurnChanged(Turn {
                id: assistant,
                owner: TurnOwner::Assistant,
                status: TurnStatus::Done,
            })]
        );
        // the user turn that barged in is untouched
        assert_eq!(sm.phase(), TurnPhase::UserSpeaking);
        assert_eq!(sm.current_turn().unwrap().id, user);

        // only once
        assert!(has_violation(&sm.on_generation_complete(assistant)));
    }

    #[test]
    fn test_interruptions_disabled() {
        let mut sm = TurnStateMachine::new(false);
        sm.on_trigger_response();

        assert!(sm.on_speech_start().is_empty());
        assert!(sm.on_speech_stop().is_empty());
        assert_eq!(sm.phase(), TurnPhase::AssistantGenerating);
    }

    #[test]
    fn test_failure_returns_to_idle() {
        let mut sm = TurnStateMachine::default();
        let id = request_id(&sm.on_trigger_response()).unwrap();

        let failed = InterruptionReason::GenerationFailed;
        assert!(has_violation(&sm.on_failure(Some(id + 10), failed)));
        assert_eq!(sm.phase(), TurnPhase::AssistantGenerating);

        // the generation stage already cancelled its own stream
        let effects = sm.on_failure(Some(id), failed);
        assert!(!effects.iter().any(|e| matches!(e, TurnEffect::Interrupt { .. })));
        assert_eq!(sm.phase(), TurnPhase::Idle);

        // nothing open: silently ignored
        assert!(sm.on_failure(None, InterruptionReason::StageFailure).is_empty());
    }

    #[test]
    fn test_later_stage_failure_interrupts_assistant_turn() {
        let mut sm = TurnStateMachine::default();
        let id = request_id(&sm.on_trigger_response()).unwrap();

        let effects = sm.on_failure(None, InterruptionReason::StageFailure);
        assert!(effects.contains(&TurnEffect::Interrupt {
            turn_id: id,
            reason: InterruptionReason::StageFailure,
        }));
        assert_eq!(sm.phase(), TurnPhase::Idle);
        assert!(sm.current_turn().is_none());
    }

    #[test]
    fn test_out_of_order_inputs_are_violations() {
        let mut sm = TurnStateMachine::default();
        assert!(has_violation(&sm.on_speech_stop()));
        assert!(has_violation(&sm.on_generation_complete(1)));
        assert!(has_violation(&sm.on_user_transcript(true)));
        assert_eq!(sm.phase(), TurnPhase::Idle);

        sm.on_speech_start();
        assert!(has_violation(&sm.on_trigger_response()));
    }

    #[test]
    fn test_turn_ids_monotonic() {
        let mut sm = TurnStateMachine::default();
        let mut seen = Vec::new();
        for _ in 0..3 {
            sm.on_speech_start();
            seen.push(sm.current_turn().unwrap().id);
            sm.on_user_transcript(true);
            let id = request_id(&sm.on_speech_stop()).unwrap();
            seen.push(id);
            sm.on_generation_complete(id);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_never_requests_generation_without_content() {
        // every start/stop interleaving with no transcript stays silent
        let inputs = [true, true, false, true, false, false, true, false];
        let mut sm = TurnStateMachine::default();
        for start in inputs {
            let effects = if start {
                sm.on_speech_start()
            } else {
                sm.on_speech_stop()
            };
            assert!(request_id(&effects).is_none());
        }
    }
}
