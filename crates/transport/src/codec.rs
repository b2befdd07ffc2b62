//! Wire codec
//!
//! Audio travels as raw mono PCM16 little-endian binary messages. Control
//! messages travel as tagged JSON text.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use parley_core::{AudioChunk, SampleRate};

use crate::TransportError;

/// Decodes inbound binary messages and encodes outbound audio
#[derive(Debug, Clone)]
pub struct Pcm16Codec {
    sample_rate: SampleRate,
    /// Media time of the next decoded chunk
    position: Duration,
}

impl Pcm16Codec {
    pub fn new(sample_rate: SampleRate) -> Self {
        Self {
            sample_rate,
            position: Duration::ZERO,
        }
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Decode one binary message, stamping it with the running media time
    pub fn decode(&mut self, payload: Bytes) -> Result<AudioChunk, TransportError> {
        if payload.len() % 2 != 0 {
            return Err(TransportError::Codec(format!(
                "PCM16 payload has odd length {}",
                payload.len()
            )));
        }
        let chunk = AudioChunk::new(payload, self.sample_rate, self.position);
        self.position += chunk.duration();
        Ok(chunk)
    }

    /// Encode outbound audio at the wire rate
    pub fn encode(&self, chunk: &AudioChunk) -> Bytes {
        if chunk.sample_rate == self.sample_rate {
            return chunk.pcm.clone();
        }
        let resampler = Resampler::new(chunk.sample_rate.as_u32(), self.sample_rate.as_u32());
        let samples = resampler.resample(&chunk.samples());
        AudioChunk::from_samples(&samples, self.sample_rate, chunk.timestamp).pcm
    }

    pub fn reset(&mut self) {
        self.position = Duration::ZERO;
    }
}

/// Linear-interpolation resampler for speech audio
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self { from_rate, to_rate }
    }

    pub fn resample(&self, input: &[i16]) -> Vec<i16> {
        if self.from_rate == self.to_rate || input.is_empty() {
            return input.to_vec();
        }

        let ratio = self.to_rate as f64 / self.from_rate as f64;
        let output_len = (input.len() as f64 * ratio).ceil() as usize;
        let last = input.len() - 1;

        (0..output_len)
            .map(|i| {
                let src = i as f64 / ratio;
                let floor = (src.floor() as usize).min(last);
                let ceil = (floor + 1).min(last);
                let frac = src - floor as f64;
                let sample = input[floor] as f64 * (1.0 - frac) + input[ceil] as f64 * frac;
                sample.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
            })
            .collect()
    }
}

/// JSON control messages exchanged over the text channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Server → client once the session is active
    SessionStarted {
        connection_id: String,
        sample_rate: u32,
        degraded: bool,
    },
    /// Server → client: drop any queued playback
    Interrupted,
    /// Server → client: final conversation summary
    SessionEnded { reason: String },
    /// Client → server: end the session
    Close,
    /// Either direction
    Error { message: String },
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        // tagged enums of plain fields always serialize
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text)
            .map_err(|e| TransportError::Codec(format!("invalid control message: {}", e)))
    }
}
