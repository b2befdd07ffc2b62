//! HTTP speech-to-text client
//!
//! Sends one utterance as a 16-bit mono WAV to a Whisper-compatible
//! `/audio/transcriptions` endpoint and returns the recognized text.

use async_trait::async_trait;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Instant;

use parley_config::SttConfig;
use parley_core::{AudioChunk, Error, Result, SpeechToText};

use crate::PipelineError;

/// Utterances shorter than this are not worth a request
const MIN_UTTERANCE_MS: u128 = 100;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Whisper-compatible HTTP transcriber
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: SttConfig,
}

impl HttpTranscriber {
    pub fn new(config: SttConfig) -> std::result::Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| PipelineError::Stt(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

/// Encode the chunk as an in-memory WAV file
pub fn encode_wav(chunk: &AudioChunk) -> std::result::Result<Vec<u8>, PipelineError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: chunk.sample_rate.as_u32(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(chunk.pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| PipelineError::Stt(format!("WAV header: {}", e)))?;
        for sample in chunk.samples() {
            writer
                .write_sample(sample)
                .map_err(|e| PipelineError::Stt(format!("WAV write: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Stt(format!("WAV finalize: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl SpeechToText for HttpTranscriber {
    async fn transcribe(&self, utterance: &AudioChunk) -> Result<String> {
        if utterance.duration().as_millis() < MIN_UTTERANCE_MS {
            return Ok(String::new());
        }

        let start = Instant::now();
        let wav = encode_wav(utterance)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Transcription(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transcription(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transcription(format!("STT API error {}: {}", status, body)));
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Transcription(format!("Invalid STT response: {}", e)))?;

        metrics::histogram!("parley_stt_duration_seconds").record(start.elapsed().as_secs_f64());
        tracing::debug!(
            model = %self.config.model,
            audio_ms = utterance.duration().as_millis() as u64,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Transcribed utterance"
        );

        Ok(body.text.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
