//! Default values shared across crates
//!
//! Single source of truth for timing, audio and endpoint defaults. Settings
//! defaults and crate-level `Default` impls both read from here.

/// Audio format of the transport boundary
pub mod audio {
    /// Inbound microphone audio (mono PCM16 LE)
    pub const INPUT_SAMPLE_RATE: u32 = 16_000;

    /// Synthesized speech returned by the TTS endpoint
    pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
}

/// Voice activity detection
pub mod vad {
    /// Trailing silence before speech is considered finished
    pub const STOP_SECS: f32 = 0.8;

    /// Continuous speech required before speech is considered started
    pub const START_SECS: f32 = 0.2;

    /// RMS level separating speech from background noise
    pub const THRESHOLD_DB: f32 = -40.0;
}

/// Pipeline scheduling
pub mod pipeline {
    /// Bounded hand-off channel between stages
    pub const CHANNEL_CAPACITY: usize = 64;

    /// Upper bound for `cancel()` to return
    pub const CANCEL_TIMEOUT_MS: u64 = 2_000;

    /// Best-effort flush of frames already queued for transport-out
    pub const DRAIN_TIMEOUT_MS: u64 = 250;

    /// A send blocked this long is treated as a fatal stall
    pub const STALL_TIMEOUT_MS: u64 = 10_000;
}

/// External service endpoints
pub mod endpoints {
    pub const LLM_DEFAULT: &str = "http://localhost:11434";
    pub const TTS_DEFAULT: &str = "http://localhost:8880/v1/audio/speech";
    pub const STT_DEFAULT: &str = "http://localhost:8881/v1/audio/transcriptions";
    pub const RETRIEVAL_DEFAULT: &str = "http://localhost:8882/retrieveAndGenerate";
}

/// Generation defaults
pub mod generation {
    pub const MODEL: &str = "qwen2.5:3b-instruct";

    /// Voice used for synthesized replies
    pub const VOICE_ID: &str = "tiffany";

    /// Voices the synthesis endpoint is known to offer
    pub const KNOWN_VOICES: &[&str] = &["matthew", "tiffany", "amy"];

    pub const TIMEOUT_MS: u64 = 30_000;
}

/// Knowledge retrieval defaults
pub mod retrieval {
    pub const QUERY: &str = "List all fields and definitions to create a Daily Progress Report";
    pub const MODEL_ARN: &str =
        "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-3-sonnet-20240229-v1:0";
    pub const TIMEOUT_MS: u64 = 8_000;
}
