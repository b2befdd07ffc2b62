//! Audio chunk types and PCM helpers

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Microphone input and speech recognition
    #[default]
    Hz16000,
    /// 22.05kHz - Common TTS output
    Hz22050,
    /// 24kHz - Speech synthesis output
    Hz24000,
    /// 48kHz - WebRTC native rate
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Map a raw rate onto a supported one
    pub fn from_u32(hz: u32) -> Option<Self> {
        match hz {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            22050 => Some(SampleRate::Hz22050),
            24000 => Some(SampleRate::Hz24000),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }

    /// Get frame size for 20ms chunk
    pub fn frame_size_20ms(&self) -> usize {
        (self.as_u32() as usize * 20) / 1000
    }
}

/// A chunk of mono PCM16 little-endian audio
///
/// The payload is reference counted, so cloning a chunk never copies samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Raw PCM16 LE bytes
    pub pcm: Bytes,
    /// Sample rate of `pcm`
    pub sample_rate: SampleRate,
    /// Media time of the first sample, relative to the start of the stream
    pub timestamp: Duration,
}

impl AudioChunk {
    /// Create from raw PCM16 LE bytes
    pub fn new(pcm: impl Into<Bytes>, sample_rate: SampleRate, timestamp: Duration) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
            timestamp,
        }
    }

    /// Create from i16 samples
    pub fn from_samples(samples: &[i16], sample_rate: SampleRate, timestamp: Duration) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(pcm, sample_rate, timestamp)
    }

    /// Decode samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Number of samples in the chunk
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Playback duration
    pub fn duration(&self) -> Duration {
        let rate = self.sample_rate.as_u32() as u64;
        Duration::from_micros(self.sample_count() as u64 * 1_000_000 / rate)
    }

    /// Check if chunk is empty
    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// RMS level in dBFS; silence yields `f32::NEG_INFINITY`
    pub fn rms_dbfs(&self) -> f32 {
        let samples = self.samples();
        if samples.is_empty() {
            return f32::NEG_INFINITY;
        }
        let sum: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        let rms = (sum / samples.len() as f64).sqrt();
        if rms <= 0.0 {
            f32::NEG_INFINITY
        } else {
            (20.0 * rms.log10()) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_roundtrip() {
        assert_eq!(SampleRate::from_u32(16000), Some(SampleRate::Hz16000));
        assert_eq!(SampleRate::from_u32(44100), None);
        assert_eq!(SampleRate::Hz16000.frame_size_20ms(), 320);
    }

    #[test]
    fn test_samples_are_little_endian() {
        let chunk = AudioChunk::new(vec![0x01, 0x00, 0xff, 0xff], SampleRate::Hz16000, Duration::ZERO);
        assert_eq!(chunk.samples(), vec![1, -1]);
    }

    #[test]
    fn test_duration() {
        let chunk = AudioChunk::from_samples(&[0; 320], SampleRate::Hz16000, Duration::ZERO);
        assert_eq!(chunk.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_rms_levels() {
        let silent = AudioChunk::from_samples(&[0; 160], SampleRate::Hz16000, Duration::ZERO);
        assert!(silent.rms_dbfs().is_infinite());

        let loud = AudioChunk::from_samples(&[i16::MAX; 160], SampleRate::Hz16000, Duration::ZERO);
        assert!(loud.rms_dbfs().abs() < 0.01);
    }
}
