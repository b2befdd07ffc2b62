//! VAD stage
//!
//! Classifies inbound audio and emits `SpeechStart`/`SpeechStop` right after
//! the chunk that triggered them.

use async_trait::async_trait;
use std::sync::Arc;

use parley_core::{
    Frame, FrameDirection, FrameProcessor, ProcessorContext, Result, VadEvent,
    VoiceActivityDetector,
};

pub struct VadProcessor {
    vad: Arc<dyn VoiceActivityDetector>,
}

impl VadProcessor {
    pub fn new(vad: Arc<dyn VoiceActivityDetector>) -> Self {
        Self { vad }
    }
}

#[async_trait]
impl FrameProcessor for VadProcessor {
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
            Frame::AudioChunk(chunk) => {
                let event = self.vad.classify(&chunk);
                let mut out = vec![Frame::AudioChunk(chunk)];
                match event {
                    Some(VadEvent::SpeechStart) => {
                        tracing::debug!(session_id = %context.session_id, "Speech started");
                        out.push(Frame::SpeechStart);
                    }
                    Some(VadEvent::SpeechStop) => {
                        tracing::debug!(session_id = %context.session_id, "Speech stopped");
                        out.push(Frame::SpeechStop);
                    }
                    None => {}
                }
                Ok(out)
            }
            Frame::EndOfStream => {
                self.vad.reset();
                Ok(vec![Frame::EndOfStream])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "vad"
    }

    fn description(&self) -> &str {
        "Voice activity detection over inbound audio"
    }
}
