//! Context aggregators
//!
//! The user aggregator buffers recognized text for the open user turn and
//! commits it when the turn stage requests generation. The assistant
//! aggregator buffers generated text and commits it only when the turn
//! completes normally. Both write through their own [`RoleWriter`].

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use parley_core::{
    ContextSnapshot, Frame, FrameDirection, FrameProcessor, Message, ProcessorContext, Result,
    Role, TurnId,
};

use crate::context::{ContextStore, RoleWriter};
use crate::events::PipelineEvent;

fn append_text(buffer: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

/// Commits user messages and hands context snapshots to the generation stage
pub struct UserContextAggregator {
    store: ContextStore,
    writer: RoleWriter,
    buffer: Mutex<String>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl UserContextAggregator {
    /// Takes the store's user writer; fails if it was already taken
    pub fn new(store: &ContextStore) -> Result<Self> {
        Ok(Self {
            writer: store.writer(Role::User)?,
            store: store.clone(),
            buffer: Mutex::new(String::new()),
            events: None,
        })
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn commit_and_snapshot(&self, turn_id: TurnId, context: &ProcessorContext) -> Result<Frame> {
        let pending = std::mem::take(&mut *self.buffer.lock());
        if !pending.is_empty() {
            let message = self.writer.commit(&pending)?;
            tracing::debug!(
                session_id = %context.session_id,
                seq = message.seq,
                "Committed user message"
            );
            publish_commit(&self.events, message);
        }

        let messages = self.store.snapshot();
        tracing::debug!(
            session_id = %context.session_id,
            turn_id,
            messages = messages.len(),
            "Context snapshot for generation"
        );
        Ok(Frame::ContextSnapshot(ContextSnapshot { turn_id, messages }))
    }
}

#[async_trait]
impl FrameProcessor for UserContextAggregator {
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if direction == FrameDirection::Upstream {
            return Ok(vec![frame]);
        }

        match frame {
            Frame::TranscriptDelta(delta) if delta.role == Role::User => {
                append_text(&mut self.buffer.lock(), &delta.text);
                Ok(vec![])
            }
            Frame::GenerationRequest { turn_id } => {
                Ok(vec![self.commit_and_snapshot(turn_id, context)?])
            }
            Frame::Interruption(_) | Frame::EndOfStream => {
                self.buffer.lock().clear();
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "user_aggregator"
    }
}

#[derive(Default)]
struct AssistantBuffer {
    text: String,
    /// Output for the current reply has passed this stage
    open: bool,
    /// A later stage failed on the current reply
    failed: bool,
}

impl AssistantBuffer {
    fn reset(&mut self) -> String {
        self.open = false;
        self.failed = false;
        std::mem::take(&mut self.text)
    }
}

/// Commits assistant messages for turns that complete normally
pub struct AssistantContextAggregator {
    writer: RoleWriter,
    buffer: Mutex<AssistantBuffer>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl AssistantContextAggregator {
    /// Takes the store's assistant writer; fails if it was already taken
    pub fn new(store: &ContextStore) -> Result<Self> {
        Ok(Self {
            writer: store.writer(Role::Assistant)?,
            buffer: Mutex::new(AssistantBuffer::default()),
            events: None,
        })
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

#[async_trait]
impl FrameProcessor for AssistantContextAggregator {
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if direction == FrameDirection::Upstream {
            if let Frame::Interruption(_) = &frame {
                let mut buffer = self.buffer.lock();
                if buffer.open && !buffer.failed {
                    buffer.failed = true;
                    buffer.text.clear();
                    tracing::debug!(
                        session_id = %context.session_id,
                        "Later stage failed, dropping the rest of this reply"
                    );
                }
            }
            return Ok(vec![frame]);
        }

        match frame {
            Frame::TranscriptDelta(ref delta) if delta.role == Role::Assistant => {
                let mut buffer = self.buffer.lock();
                buffer.open = true;
                if !buffer.failed {
                    // deltas arrive token by token, so keep their spacing
                    buffer.text.push_str(&delta.text);
                }
                Ok(vec![frame])
            }
            // user audio ends at the transcription stage
            Frame::AudioChunk(_) => {
                self.buffer.lock().open = true;
                Ok(vec![frame])
            }
            Frame::GenerationComplete { turn_id } => {
                let (pending, failed) = {
                    let mut buffer = self.buffer.lock();
                    let failed = buffer.failed;
                    (buffer.reset(), failed)
                };
                if failed {
                    // the turn stage already ended this turn
                    tracing::debug!(
                        session_id = %context.session_id,
                        turn_id,
                        "Not committing reply of a failed turn"
                    );
                    return Ok(vec![frame]);
                }
                if pending.trim().is_empty() {
                    tracing::warn!(
                        session_id = %context.session_id,
                        turn_id,
                        "Generation completed without text"
                    );
                } else {
                    let message = self.writer.commit(&pending)?;
                    tracing::info!(
                        session_id = %context.session_id,
                        turn_id,
                        seq = message.seq,
                        text = %message.content,
                        "Assistant said"
                    );
                    publish_commit(&self.events, message);
                }
                context.push(FrameDirection::Upstream, Frame::GenerationComplete { turn_id });
                Ok(vec![frame])
            }
            Frame::Interruption(interruption) => {
                let discarded = self.buffer.lock().reset();
                if !discarded.is_empty() {
                    tracing::debug!(
                        session_id = %context.session_id,
                        turn_id = ?interruption.turn_id,
                        discarded_chars = discarded.len(),
                        "Discarded partial assistant message"
                    );
                }
                Ok(vec![frame])
            }
            Frame::EndOfStream => {
                self.buffer.lock().reset();
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "assistant_aggregator"
    }
}

fn publish_commit(events: &Option<broadcast::Sender<PipelineEvent>>, message: Message) {
    if let Some(events) = events {
        let _ = events.send(PipelineEvent::MessageCommitted(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{InterruptionReason, TranscriptDelta};

    fn seeded_store() -> ContextStore {
        let store = ContextStore::new();
        store
            .seed(
                "Knowledge base field definitions:\nField: date (required, ISO-8601).",
                &[(Role::User, "I want to create a DPR".to_string())],
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_user_commit_then_snapshot() {
        let store = seeded_store();
        let stage = UserContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        for text in ["My name", "is Alice"] {
            let out = stage
                .process(
                    Frame::TranscriptDelta(TranscriptDelta::user(text, true)),
                    FrameDirection::Downstream,
                    &mut ctx,
                )
                .await
                .unwrap();
            assert!(out.is_empty());
        }

        let out = stage
            .process(
                Frame::GenerationRequest { turn_id: 4 },
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();

        let Frame::ContextSnapshot(snapshot) = &out[0] else {
            panic!("expected snapshot, got {:?}", out);
        };
        assert_eq!(snapshot.turn_id, 4);
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.messages[2].content, "My name is Alice");
    }

    #[tokio::test]
    async fn test_trigger_snapshot_without_user_text() {
        let store = seeded_store();
        let stage = UserContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        let out = stage
            .process(
                Frame::GenerationRequest { turn_id: 1 },
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(matches!(&out[0], Frame::ContextSnapshot(s) if s.messages.len() == 2));
    }

    #[tokio::test]
    async fn test_assistant_commit_on_completion() {
        let store = seeded_store();
        let stage = AssistantContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        for text in ["What is", " today's date?"] {
            stage
                .process(
                    Frame::TranscriptDelta(TranscriptDelta::assistant(text)),
                    FrameDirection::Downstream,
                    &mut ctx,
                )
                .await
                .unwrap();
        }
        let out = stage
            .process(
                Frame::GenerationComplete { turn_id: 1 },
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();

        assert_eq!(out, vec![Frame::GenerationComplete { turn_id: 1 }]);
        assert_eq!(
            ctx.take_pushed(),
            vec![(FrameDirection::Upstream, Frame::GenerationComplete { turn_id: 1 })]
        );
        assert_eq!(store.last().unwrap().content, "What is today's date?");
        assert_eq!(store.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_assistant_interruption_discards() {
        let store = seeded_store();
        let stage = AssistantContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        stage
            .process(
                Frame::TranscriptDelta(TranscriptDelta::assistant("What is")),
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();
        stage
            .process(
                Frame::interruption(Some(1), InterruptionReason::BargeIn),
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();
        // a stale completion after the interruption commits nothing
        stage
            .process(
                Frame::GenerationComplete { turn_id: 1 },
                FrameDirection::Downstream,
                &mut ctx,
            )
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
    }

    async fn assistant_down(
        stage: &AssistantContextAggregator,
        ctx: &mut ProcessorContext,
        frame: Frame,
    ) {
        stage
            .process(frame, FrameDirection::Downstream, ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_behind_reply_commits_nothing() {
        let store = seeded_store();
        let stage = AssistantContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        let audio = parley_core::AudioChunk::from_samples(
            &[1; 160],
            parley_core::SampleRate::Hz16000,
            std::time::Duration::ZERO,
        );
        assistant_down(&stage, &mut ctx, Frame::AudioChunk(audio)).await;

        // transport-out could not write that audio
        let failure = Frame::interruption(None, InterruptionReason::StageFailure);
        let out = stage
            .process(failure.clone(), FrameDirection::Upstream, &mut ctx)
            .await
            .unwrap();
        assert_eq!(out, vec![failure]);

        assistant_down(
            &stage,
            &mut ctx,
            Frame::TranscriptDelta(TranscriptDelta::assistant("Hello there")),
        )
        .await;
        assistant_down(&stage, &mut ctx, Frame::GenerationComplete { turn_id: 1 }).await;

        assert_eq!(store.len(), 2);
        assert!(ctx.take_pushed().is_empty());

        // the next reply commits normally
        assistant_down(
            &stage,
            &mut ctx,
            Frame::TranscriptDelta(TranscriptDelta::assistant("What is the date?")),
        )
        .await;
        assistant_down(&stage, &mut ctx, Frame::GenerationComplete { turn_id: 2 }).await;
        assert_eq!(store.len(), 3);
        assert_eq!(store.last().unwrap().content, "What is the date?");
    }

    #[tokio::test]
    async fn test_failure_between_replies_is_not_sticky() {
        let store = seeded_store();
        let stage = AssistantContextAggregator::new(&store).unwrap();
        let mut ctx = ProcessorContext::new("s");

        stage
            .process(
                Frame::interruption(None, InterruptionReason::StageFailure),
                FrameDirection::Upstream,
                &mut ctx,
            )
            .await
            .unwrap();
        assistant_down(
            &stage,
            &mut ctx,
            Frame::TranscriptDelta(TranscriptDelta::assistant("Hi")),
        )
        .await;
        assistant_down(&stage, &mut ctx, Frame::GenerationComplete { turn_id: 1 }).await;

        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_aggregators_need_free_writers() {
        let store = seeded_store();
        let _user = UserContextAggregator::new(&store).unwrap();
        assert!(UserContextAggregator::new(&store).is_err());
    }
}
