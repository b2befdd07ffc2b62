//! Generation service used by the pipeline
//!
//! Each request runs in its own task: tokens stream from the chat backend,
//! are forwarded as text deltas, and are chunked into sentences for speech
//! synthesis. The task checks the cancel signal at every suspension point
//! and exits without sending anything further once it fires.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use parley_config::GenerationConfig;
use parley_core::{
    CancelSignal, GenerationEvent, GenerationProducer, GenerationRequest, GenerationService,
    GenerationStream, Result, DEFAULT_EVENT_BUFFER,
};

use crate::backend::{ChatBackend, ChatResult, LlmConfig, OllamaChatBackend};
use crate::sentence::{SentenceChunker, SentenceChunkerConfig};
use crate::speech::{HttpSpeechSynthesizer, SpeechSynthesizer, TtsConfig};
use crate::LlmError;

const TOKEN_BUFFER: usize = 64;

pub struct VoiceGenerationService {
    backend: Arc<dyn ChatBackend>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    chunker: SentenceChunkerConfig,
    timeout: Duration,
}

impl VoiceGenerationService {
    pub fn new(backend: Arc<dyn ChatBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            synthesizer: None,
            chunker: SentenceChunkerConfig::default(),
            timeout,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_chunker(mut self, config: SentenceChunkerConfig) -> Self {
        self.chunker = config;
        self
    }

    /// Ollama chat plus HTTP speech synthesis when an endpoint is configured
    pub fn from_config(config: &GenerationConfig) -> std::result::Result<Self, LlmError> {
        let backend = OllamaChatBackend::new(LlmConfig::from(config))?;
        let mut service = Self::new(Arc::new(backend), config.timeout());

        match TtsConfig::from_generation(config)? {
            Some(tts) => {
                if !config.is_known_voice() {
                    tracing::warn!(
                        voice_id = %config.voice_id,
                        "Voice is not one the synthesis endpoint is known to offer"
                    );
                }
                service = service.with_synthesizer(Arc::new(HttpSpeechSynthesizer::new(tts)?));
            }
            None => tracing::info!("No TTS endpoint configured, replies are text only"),
        }
        Ok(service)
    }
}

#[async_trait]
impl GenerationService for VoiceGenerationService {
    async fn start_generation(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let (producer, stream) = GenerationStream::channel(request.turn_id, DEFAULT_EVENT_BUFFER);
        metrics::counter!("parley_generation_requests_total").increment(1);

        let run = GenerationRun {
            backend: self.backend.clone(),
            synthesizer: self.synthesizer.clone(),
            chunker: SentenceChunker::new(self.chunker.clone()),
            deadline: Instant::now() + self.timeout,
            signal: producer.signal(),
            producer,
            audio_offset: Duration::ZERO,
        };
        tokio::spawn(run.execute(request));

        Ok(stream)
    }

    fn name(&self) -> &str {
        "voice_generation"
    }
}

/// Whether the run may keep sending
type Flow = std::result::Result<(), Stop>;

enum Stop {
    /// Caller cancelled or went away
    Cancelled,
    Failed(LlmError),
}

struct GenerationRun {
    backend: Arc<dyn ChatBackend>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    chunker: SentenceChunker,
    deadline: Instant,
    signal: CancelSignal,
    producer: GenerationProducer,
    audio_offset: Duration,
}

impl GenerationRun {
    async fn execute(mut self, request: GenerationRequest) {
        let turn_id = request.turn_id;
        match self.stream(request).await {
            Ok(()) => {
                self.producer.send(GenerationEvent::Complete).await;
            }
            Err(Stop::Cancelled) => {
                tracing::debug!(turn_id, "Generation cancelled");
            }
            Err(Stop::Failed(e)) => {
                tracing::warn!(turn_id, error = %e, "Generation failed");
                self.producer.send(GenerationEvent::Error(e.to_string())).await;
            }
        }
    }

    async fn stream(&mut self, request: GenerationRequest) -> Flow {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let backend = self.backend.clone();
        let messages = request.messages.clone();
        let chat = async move { backend.stream_chat(&messages, token_tx).await };
        tokio::pin!(chat);

        let mut finished: Option<std::result::Result<ChatResult, LlmError>> = None;
        loop {
            tokio::select! {
                biased;
                _ = self.signal.cancelled() => return Err(Stop::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(Stop::Failed(LlmError::Timeout));
                }
                result = &mut chat, if finished.is_none() => finished = Some(result),
                token = token_rx.recv() => match token {
                    Some(token) => self.relay(token).await?,
                    // the backend future dropped its sender
                    None => break,
                },
            }
        }

        let result = match finished {
            Some(result) => result,
            None => chat.await,
        };
        let result = result.map_err(Stop::Failed)?;
        tracing::debug!(
            turn_id = request.turn_id,
            tokens = result.tokens,
            ttft_ms = result.time_to_first_token_ms,
            total_ms = result.total_time_ms,
            "Chat stream finished"
        );

        if let Some(rest) = self.chunker.flush() {
            self.speak(&rest).await?;
        }
        Ok(())
    }

    async fn relay(&mut self, token: String) -> Flow {
        let sentences = self.chunker.push(&token);
        self.send(GenerationEvent::TextDelta(token)).await?;
        for sentence in sentences {
            self.speak(&sentence).await?;
        }
        Ok(())
    }

    async fn speak(&mut self, sentence: &str) -> Flow {
        let Some(synthesizer) = self.synthesizer.clone() else {
            return Ok(());
        };

        let audio = tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(Stop::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                return Err(Stop::Failed(LlmError::Timeout));
            }
            audio = synthesizer.synthesize(sentence) => audio.map_err(Stop::Failed)?,
        };

        let mut chunk = audio;
        chunk.timestamp = self.audio_offset;
        self.audio_offset += chunk.duration();
        self.send(GenerationEvent::AudioDelta(chunk)).await
    }

    async fn send(&mut self, event: GenerationEvent) -> Flow {
        if self.producer.send(event).await {
            Ok(())
        } else {
            Err(Stop::Cancelled)
        }
    }
}
