//! Speech synthesis
//!
//! One HTTP request per sentence against an OpenAI-style `audio/speech`
//! endpoint. Raw PCM is preferred; WAV bodies are decoded as well since some
//! servers ignore `response_format`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use std::io::Cursor;
use std::time::{Duration, Instant};

use parley_config::GenerationConfig;
use parley_core::{AudioChunk, SampleRate};

use crate::LlmError;

/// Text to speech for one sentence at a time
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    async fn synthesize(&self, text: &str) -> Result<AudioChunk, LlmError>;

    fn voice(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub endpoint: String,
    pub model: String,
    pub voice_id: String,
    pub sample_rate: SampleRate,
    pub timeout: Duration,
}

impl TtsConfig {
    /// `None` when no synthesis endpoint is configured
    pub fn from_generation(config: &GenerationConfig) -> Result<Option<Self>, LlmError> {
        let Some(endpoint) = config.tts_endpoint.clone() else {
            return Ok(None);
        };
        let sample_rate = SampleRate::from_u32(config.output_sample_rate).ok_or_else(|| {
            LlmError::Configuration(format!(
                "unsupported output sample rate {}",
                config.output_sample_rate
            ))
        })?;
        Ok(Some(Self {
            endpoint,
            model: "tts-1".to_string(),
            voice_id: config.voice_id.clone(),
            sample_rate,
            timeout: config.timeout(),
        }))
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    sample_rate: u32,
}

pub struct HttpSpeechSynthesizer {
    client: Client,
    config: TtsConfig,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioChunk, LlmError> {
        let start = Instant::now();
        let request = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice_id,
            response_format: "pcm",
            sample_rate: self.config.sample_rate.as_u32(),
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }

        let body = response.bytes().await?;
        let chunk = decode_speech(body, self.config.sample_rate)?;
        metrics::histogram!("parley_tts_duration_seconds").record(start.elapsed().as_secs_f64());
        tracing::trace!(
            voice = %self.config.voice_id,
            chars = text.len(),
            audio_ms = chunk.duration().as_millis() as u64,
            "Synthesized sentence"
        );
        Ok(chunk)
    }

    fn voice(&self) -> &str {
        &self.config.voice_id
    }
}

/// Raw PCM16 at `expected`, or a RIFF/WAV container
pub(crate) fn decode_speech(body: Bytes, expected: SampleRate) -> Result<AudioChunk, LlmError> {
    if !body.starts_with(b"RIFF") {
        return Ok(AudioChunk::new(body, expected, Duration::ZERO));
    }

    let mut reader = hound::WavReader::new(Cursor::new(body))
        .map_err(|e| LlmError::Synthesis(format!("invalid WAV body: {}", e)))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(LlmError::Synthesis(format!(
            "expected mono PCM16, got {} channel(s) at {} bits",
            spec.channels, spec.bits_per_sample
        )));
    }
    let rate = SampleRate::from_u32(spec.sample_rate).ok_or_else(|| {
        LlmError::Synthesis(format!("unsupported sample rate {}", spec.sample_rate))
    })?;
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LlmError::Synthesis(e.to_string()))?;

    Ok(AudioChunk::from_samples(&samples, rate, Duration::ZERO))
}
