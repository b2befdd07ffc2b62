//! Generation stage
//!
//! Starts one generation request per context snapshot and relays the stream's
//! events as frames. At most one stream is in flight; an interruption cancels
//! it and any events it had not delivered yet are never read.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};

use parley_core::{
    ContextSnapshot, Frame, FrameDirection, FrameProcessor, GenerationEvent, GenerationRequest,
    GenerationService, GenerationStream, InterruptionReason, ProcessorContext, Result,
    TranscriptDelta, TurnId,
};

use crate::events::PipelineEvent;

struct ActiveGeneration {
    stream: GenerationStream,
    started: Instant,
    first_delta: bool,
}

pub struct GenerationProcessor {
    service: Arc<dyn GenerationService>,
    active: Mutex<Option<ActiveGeneration>>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl GenerationProcessor {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            active: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Turn of the in-flight request, if any
    pub async fn active_turn(&self) -> Option<TurnId> {
        self.active.lock().await.as_ref().map(|a| a.stream.turn_id())
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn cancel_active(&self, active: &mut Option<ActiveGeneration>, why: &str) {
        if let Some(generation) = active.take() {
            tracing::debug!(
                turn_id = generation.stream.turn_id(),
                reason = why,
                "Cancelling in-flight generation"
            );
            self.service
                .cancel_generation(&generation.stream.cancel_handle());
        }
    }

    /// Interruption for a failed turn, sent both ways so the turn stage and
    /// the assistant aggregator both see it
    fn fail_turn(&self, turn_id: TurnId, message: String, context: &mut ProcessorContext) -> Frame {
        metrics::counter!("parley_generation_errors_total").increment(1);
        tracing::warn!(
            session_id = %context.session_id,
            turn_id,
            error = %message,
            "Generation failed, ending turn"
        );
        self.publish(PipelineEvent::GenerationFailed { turn_id, message });
        let interruption =
            Frame::interruption(Some(turn_id), InterruptionReason::GenerationFailed);
        context.push(FrameDirection::Upstream, interruption.clone());
        interruption
    }

    async fn start(
        &self,
        snapshot: ContextSnapshot,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        let turn_id = snapshot.turn_id;
        {
            let mut active = self.active.lock().await;
            self.cancel_active(&mut active, "superseded");
        }

        let request = GenerationRequest {
            turn_id,
            messages: snapshot.messages,
        };
        let started = tokio::select! {
            biased;
            _ = context.cancelled() => return Ok(vec![]),
            started = self.service.start_generation(request) => started,
        };

        match started {
            Ok(stream) => {
                tracing::debug!(
                    session_id = %context.session_id,
                    turn_id,
                    service = self.service.name(),
                    "Generation started"
                );
                self.publish(PipelineEvent::GenerationStarted { turn_id });
                *self.active.lock().await = Some(ActiveGeneration {
                    stream,
                    started: Instant::now(),
                    first_delta: false,
                });
                Ok(vec![])
            }
            Err(e) => Ok(vec![self.fail_turn(turn_id, e.to_string(), context)]),
        }
    }
}

#[async_trait]
impl FrameProcessor for GenerationProcessor {
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
            Frame::ContextSnapshot(snapshot) => self.start(snapshot, context).await,
            Frame::Interruption(interruption) => {
                let mut active = self.active.lock().await;
                let applies = match (interruption.turn_id, active.as_ref()) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(id), Some(generation)) => generation.stream.turn_id() == id,
                };
                if applies {
                    self.cancel_active(&mut active, interruption.reason.as_str());
                }
                Ok(vec![frame])
            }
            Frame::EndOfStream => {
                self.cancel_active(&mut *self.active.lock().await, "end_of_stream");
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    async fn produce(&self, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        let mut active = self.active.lock().await;
        let Some(generation) = active.as_mut() else {
            drop(active);
            return std::future::pending().await;
        };
        let event = generation.stream.next_event().await;

        // Nothing below awaits; dropping this future earlier loses no state.
        let turn_id = generation.stream.turn_id();
        match event {
            Some(GenerationEvent::TextDelta(text)) => {
                if text.is_empty() {
                    return Ok(vec![]);
                }
                if !generation.first_delta {
                    generation.first_delta = true;
                    metrics::histogram!("parley_generation_first_delta_seconds")
                        .record(generation.started.elapsed().as_secs_f64());
                }
                Ok(vec![Frame::TranscriptDelta(TranscriptDelta::assistant(text))])
            }
            Some(GenerationEvent::AudioDelta(chunk)) => Ok(vec![Frame::AudioChunk(chunk)]),
            Some(GenerationEvent::Complete) => {
                *active = None;
                tracing::debug!(session_id = %context.session_id, turn_id, "Generation complete");
                Ok(vec![Frame::GenerationComplete { turn_id }])
            }
            Some(GenerationEvent::Error(message)) => {
                *active = None;
                Ok(vec![self.fail_turn(turn_id, message, context)])
            }
            None => {
                *active = None;
                Ok(vec![self.fail_turn(
                    turn_id,
                    "generation stream ended without completing".to_string(),
                    context,
                )])
            }
        }
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        self.cancel_active(&mut *self.active.lock().await, "stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "generation"
    }

    fn description(&self) -> &str {
        "Streaming generation service adapter"
    }
}
