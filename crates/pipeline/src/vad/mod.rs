//! Voice Activity Detection
//!
//! Energy-gated detector: a chunk is voiced when its RMS level crosses the
//! threshold. Speech starts after `start_secs` of voiced audio and stops after
//! `stop_secs` of trailing silence, so short pauses inside a sentence do not
//! end the user's turn.

use parking_lot::Mutex;
use std::time::Duration;

use parley_config::VadConfig;
use parley_core::{AudioChunk, VadEvent, VoiceActivityDetector};

/// Energy VAD configuration
#[derive(Debug, Clone)]
pub struct EnergyVadConfig {
    /// RMS level in dBFS at or above which a chunk counts as speech
    pub threshold_db: f32,
    /// Voiced audio needed before reporting speech start
    pub start: Duration,
    /// Trailing silence needed before reporting speech stop
    pub stop: Duration,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self::from(&VadConfig::default())
    }
}

impl From<&VadConfig> for EnergyVadConfig {
    fn from(config: &VadConfig) -> Self {
        Self {
            threshold_db: config.threshold_db,
            start: Duration::from_secs_f32(config.start_secs),
            stop: Duration::from_secs_f32(config.stop_secs),
        }
    }
}

#[derive(Debug, Default)]
struct VadState {
    speaking: bool,
    voiced_run: Duration,
    silence_run: Duration,
}

/// Energy-based voice activity detector
pub struct EnergyVad {
    config: EnergyVadConfig,
    state: Mutex<VadState>,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            state: Mutex::new(VadState::default()),
        }
    }

    pub fn config(&self) -> &EnergyVadConfig {
        &self.config
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&self, chunk: &AudioChunk) -> Option<VadEvent> {
        let duration = chunk.duration();
        let voiced = chunk.rms_dbfs() >= self.config.threshold_db;
        let mut state = self.state.lock();

        if !state.speaking {
            if !voiced {
                state.voiced_run = Duration::ZERO;
                return None;
            }
            state.voiced_run += duration;
            if state.voiced_run >= self.config.start {
                state.speaking = true;
                state.silence_run = Duration::ZERO;
                return Some(VadEvent::SpeechStart);
            }
            return None;
        }

        if voiced {
            state.silence_run = Duration::ZERO;
            return None;
        }
        state.silence_run += duration;
        if state.silence_run >= self.config.stop {
            state.speaking = false;
            state.voiced_run = Duration::ZERO;
            state.silence_run = Duration::ZERO;
            return Some(VadEvent::SpeechStop);
        }
        None
    }

    fn reset(&self) {
        *self.state.lock() = VadState::default();
    }

    fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::SampleRate;

    fn chunk(level: i16) -> AudioChunk {
        // 20ms at 16kHz
        AudioChunk::from_samples(&[level; 320], SampleRate::Hz16000, Duration::ZERO)
    }

    fn vad(stop_ms: u64) -> EnergyVad {
        EnergyVad::new(EnergyVadConfig {
            threshold_db: -40.0,
            start: Duration::from_millis(60),
            stop: Duration::from_millis(stop_ms),
        })
    }

    #[test]
    fn test_speech_start_after_min_duration() {
        let vad = vad(800);
        assert_eq!(vad.classify(&chunk(8000)), None);
        assert_eq!(vad.classify(&chunk(8000)), None);
        assert_eq!(vad.classify(&chunk(8000)), Some(VadEvent::SpeechStart));
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_short_noise_does_not_start() {
        let vad = vad(800);
        vad.classify(&chunk(8000));
        vad.classify(&chunk(0));
        vad.classify(&chunk(8000));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_stop_after_trailing_silence() {
        let vad = vad(100);
        for _ in 0..3 {
            vad.classify(&chunk(8000));
        }
        // 80ms of silence is a pause, not a stop
        for _ in 0..4 {
            assert_eq!(vad.classify(&chunk(0)), None);
        }
        assert_eq!(vad.classify(&chunk(0)), Some(VadEvent::SpeechStop));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_pause_resets_silence_run() {
        let vad = vad(100);
        for _ in 0..3 {
            vad.classify(&chunk(8000));
        }
        for _ in 0..4 {
            vad.classify(&chunk(0));
        }
        vad.classify(&chunk(8000));
        for _ in 0..4 {
            assert_eq!(vad.classify(&chunk(0)), None);
        }
    }

    #[test]
    fn test_default_uses_configured_stop() {
        let vad = EnergyVad::new(EnergyVadConfig::default());
        assert_eq!(vad.config().stop, Duration::from_secs_f32(0.8));
        vad.reset();
        assert!(!vad.is_speaking());
    }
}
