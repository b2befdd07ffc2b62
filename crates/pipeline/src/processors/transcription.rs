//! Transcription stage
//!
//! Buffers user audio between `SpeechStart` and `SpeechStop` and transcribes
//! each utterance in one call. A short pre-roll kept while idle covers the
//! VAD start delay so the first syllable is not clipped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::{
    AudioChunk, Frame, FrameDirection, FrameProcessor, ProcessorContext, Result, Role,
    SpeechToText, TranscriptDelta,
};

/// Transcription stage configuration
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Audio kept from before `SpeechStart`
    pub preroll: Duration,
    /// Utterances are truncated beyond this length
    pub max_utterance: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            preroll: Duration::from_millis(300),
            max_utterance: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct UtteranceState {
    in_utterance: bool,
    preroll: VecDeque<AudioChunk>,
    preroll_len: Duration,
    chunks: Vec<AudioChunk>,
    length: Duration,
}

impl UtteranceState {
    fn push_preroll(&mut self, chunk: AudioChunk, limit: Duration) {
        self.preroll_len += chunk.duration();
        self.preroll.push_back(chunk);
        while self.preroll_len > limit {
            match self.preroll.pop_front() {
                Some(old) => self.preroll_len = self.preroll_len.saturating_sub(old.duration()),
                None => break,
            }
        }
    }

    fn begin(&mut self) {
        self.in_utterance = true;
        self.length = self.preroll_len;
        self.chunks = self.preroll.drain(..).collect();
        self.preroll_len = Duration::ZERO;
    }

    fn take(&mut self) -> Option<AudioChunk> {
        self.in_utterance = false;
        self.length = Duration::ZERO;
        let chunks = std::mem::take(&mut self.chunks);
        let first = chunks.first()?;
        let (sample_rate, timestamp) = (first.sample_rate, first.timestamp);
        let mut pcm = Vec::with_capacity(chunks.iter().map(|c| c.pcm.len()).sum());
        for chunk in &chunks {
            pcm.extend_from_slice(&chunk.pcm);
        }
        Some(AudioChunk::new(pcm, sample_rate, timestamp))
    }
}

pub struct TranscriptionProcessor {
    stt: Arc<dyn SpeechToText>,
    config: TranscriptionConfig,
    state: Mutex<UtteranceState>,
}

impl TranscriptionProcessor {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self::with_config(stt, TranscriptionConfig::default())
    }

    pub fn with_config(stt: Arc<dyn SpeechToText>, config: TranscriptionConfig) -> Self {
        Self {
            stt,
            config,
            state: Mutex::new(UtteranceState::default()),
        }
    }

    fn buffer(&self, chunk: AudioChunk) {
        let mut state = self.state.lock();
        if !state.in_utterance {
            state.push_preroll(chunk, self.config.preroll);
            return;
        }
        if state.length >= self.config.max_utterance {
            return;
        }
        state.length += chunk.duration();
        state.chunks.push(chunk);
    }

    async fn finish_utterance(&self, context: &ProcessorContext) -> Result<Vec<Frame>> {
        let utterance = self.state.lock().take();
        let Some(utterance) = utterance else {
            return Ok(vec![Frame::SpeechStop]);
        };

        let started = Instant::now();
        let text = tokio::select! {
            biased;
            _ = context.cancelled() => return Ok(vec![]),
            text = self.stt.transcribe(&utterance) => text?,
        };
        metrics::histogram!("parley_stt_latency_seconds").record(started.elapsed().as_secs_f64());

        let mut out = Vec::with_capacity(2);
        let delta = TranscriptDelta::user(text, true);
        if delta.has_content() {
            tracing::info!(
                session_id = %context.session_id,
                audio_ms = utterance.duration().as_millis() as u64,
                text = %delta.text,
                "User said"
            );
            out.push(Frame::TranscriptDelta(delta));
        } else {
            tracing::debug!(session_id = %context.session_id, "Utterance had no recognizable speech");
        }
        out.push(Frame::SpeechStop);
        Ok(out)
    }
}

#[async_trait]
impl FrameProcessor for TranscriptionProcessor {
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
                self.buffer(chunk);
                Ok(vec![])
            }
            Frame::SpeechStart => {
                self.state.lock().begin();
                Ok(vec![Frame::SpeechStart])
            }
            Frame::SpeechStop => self.finish_utterance(context).await,
            // recognized text from this stage is the only user transcript
            Frame::TranscriptDelta(delta) if delta.role == Role::User => Ok(vec![]),
            Frame::EndOfStream => {
                *self.state.lock() = UtteranceState::default();
                Ok(vec![Frame::EndOfStream])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "transcription"
    }

    fn description(&self) -> &str {
        "Speech-to-text per utterance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{Error, SampleRate};

    struct FixedStt {
        text: &'static str,
        fail: bool,
        seen_samples: Mutex<usize>,
    }

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(&self, utterance: &AudioChunk) -> Result<String> {
            *self.seen_samples.lock() = utterance.sample_count();
            if self.fail {
                return Err(Error::Transcription("model unavailable".into()));
            }
            Ok(self.text.to_string())
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn stt(text: &'static str, fail: bool) -> Arc<FixedStt> {
        Arc::new(FixedStt {
            text,
            fail,
            seen_samples: Mutex::new(0),
        })
    }

    fn chunk() -> Frame {
        // 20ms
        Frame::AudioChunk(AudioChunk::from_samples(
            &[100; 320],
            SampleRate::Hz16000,
            Duration::ZERO,
        ))
    }

    async fn feed(stage: &TranscriptionProcessor, frames: Vec<Frame>) -> Vec<Frame> {
        let mut ctx = ProcessorContext::new("s");
        let mut out = Vec::new();
        for frame in frames {
            out.extend(
                stage
                    .process(frame, FrameDirection::Downstream, &mut ctx)
                    .await
                    .unwrap(),
            );
        }
        out
    }

    #[tokio::test]
    async fn test_transcript_precedes_speech_stop() {
        let stage = TranscriptionProcessor::new(stt("My name is Alice", false));
        let out = feed(
            &stage,
            vec![Frame::SpeechStart, chunk(), chunk(), Frame::SpeechStop],
        )
        .await;

        assert_eq!(
            out,
            vec![
                Frame::SpeechStart,
                Frame::TranscriptDelta(TranscriptDelta::user("My name is Alice", true)),
                Frame::SpeechStop,
            ]
        );
    }

    #[tokio::test]
    async fn test_preroll_is_included() {
        let fixed = stt("hi", false);
        let stage = TranscriptionProcessor::with_config(
            fixed.clone(),
            TranscriptionConfig {
                preroll: Duration::from_millis(40),
                max_utterance: Duration::from_secs(1),
            },
        );
        // three idle chunks; only two fit in the pre-roll
        feed(
            &stage,
            vec![chunk(), chunk(), chunk(), Frame::SpeechStart, chunk(), Frame::SpeechStop],
        )
        .await;

        assert_eq!(*fixed.seen_samples.lock(), 320 * 3);
    }

    #[tokio::test]
    async fn test_blank_transcript_forwards_only_stop() {
        let stage = TranscriptionProcessor::new(stt("  ", false));
        let out = feed(&stage, vec![Frame::SpeechStart, chunk(), Frame::SpeechStop]).await;
        assert_eq!(out, vec![Frame::SpeechStart, Frame::SpeechStop]);
    }

    #[tokio::test]
    async fn test_stt_failure_is_stage_error() {
        let stage = TranscriptionProcessor::new(stt("", true));
        let mut ctx = ProcessorContext::new("s");
        for frame in [Frame::SpeechStart, chunk()] {
            stage.process(frame, FrameDirection::Downstream, &mut ctx).await.unwrap();
        }
        let result = stage
            .process(Frame::SpeechStop, FrameDirection::Downstream, &mut ctx)
            .await;
        assert!(matches!(result, Err(Error::Transcription(_))));
    }
}
