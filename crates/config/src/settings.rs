//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{audio, endpoints, generation, pipeline, retrieval, vad};
use crate::{ConfigError, PromptConfig};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Pipeline scheduling
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadConfig,

    /// Generation service and voice
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Speech-to-text service
    #[serde(default)]
    pub stt: SttConfig,

    /// Knowledge retrieval
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Prompt templates
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_pipeline()?;
        self.validate_vad()?;
        self.validate_generation()?;
        self.validate_retrieval()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "Port must be non-zero"));
        }
        if self.server.max_connections == 0 {
            return Err(invalid("server.max_connections", "Must allow at least one connection"));
        }
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;

        if p.channel_capacity == 0 {
            return Err(invalid("pipeline.channel_capacity", "Channel capacity must be at least 1"));
        }

        if p.cancel_timeout_ms < 10 {
            return Err(invalid(
                "pipeline.cancel_timeout_ms",
                "Cancel timeout too low (minimum 10ms)",
            ));
        }

        if p.drain_timeout_ms >= p.cancel_timeout_ms {
            return Err(invalid(
                "pipeline.drain_timeout_ms",
                format!(
                    "Drain timeout ({}ms) must be shorter than cancel timeout ({}ms)",
                    p.drain_timeout_ms, p.cancel_timeout_ms
                ),
            ));
        }

        if p.stall_timeout_ms == 0 {
            return Err(invalid("pipeline.stall_timeout_ms", "Stall timeout must be non-zero"));
        }

        Ok(())
    }

    fn validate_vad(&self) -> Result<(), ConfigError> {
        let v = &self.vad;

        if !(v.stop_secs > 0.0 && v.stop_secs <= 5.0) {
            return Err(invalid(
                "vad.stop_secs",
                format!("Must be in (0.0, 5.0], got {}", v.stop_secs),
            ));
        }

        if !(0.0..=2.0).contains(&v.start_secs) {
            return Err(invalid(
                "vad.start_secs",
                format!("Must be between 0.0 and 2.0, got {}", v.start_secs),
            ));
        }

        if v.threshold_db > 0.0 {
            return Err(invalid(
                "vad.threshold_db",
                format!("dBFS threshold must be <= 0, got {}", v.threshold_db),
            ));
        }

        if !matches!(v.sample_rate, 8000 | 16000 | 22050 | 24000 | 48000) {
            return Err(invalid(
                "vad.sample_rate",
                format!("Unsupported sample rate {}", v.sample_rate),
            ));
        }

        Ok(())
    }

    fn validate_generation(&self) -> Result<(), ConfigError> {
        let g = &self.generation;

        if g.voice_id.trim().is_empty() {
            return Err(ConfigError::MissingField("generation.voice_id".to_string()));
        }

        if !(0.0..=2.0).contains(&g.temperature) {
            return Err(invalid(
                "generation.temperature",
                format!("Must be between 0.0 and 2.0, got {}", g.temperature),
            ));
        }

        if !matches!(g.output_sample_rate, 8000 | 16000 | 22050 | 24000 | 48000) {
            return Err(invalid(
                "generation.output_sample_rate",
                format!("Unsupported sample rate {}", g.output_sample_rate),
            ));
        }

        Ok(())
    }

    fn validate_retrieval(&self) -> Result<(), ConfigError> {
        if self.retrieval.timeout_ms == 0 {
            return Err(invalid("retrieval.timeout_ms", "Timeout must be non-zero"));
        }
        if self.retrieval.query.trim().is_empty() {
            return Err(ConfigError::MissingField("retrieval.query".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent WebSocket sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    100
}

/// Pipeline scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each bounded hand-off channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound on `cancel()`
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    /// Time given to transport-out to flush queued frames on cancel
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// A send blocked for longer than this tears the session down
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Let user speech interrupt the assistant
    #[serde(default = "default_true")]
    pub allow_interruptions: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            allow_interruptions: true,
        }
    }
}

impl PipelineConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

fn default_channel_capacity() -> usize {
    pipeline::CHANNEL_CAPACITY
}

fn default_cancel_timeout_ms() -> u64 {
    pipeline::CANCEL_TIMEOUT_MS
}

fn default_drain_timeout_ms() -> u64 {
    pipeline::DRAIN_TIMEOUT_MS
}

fn default_stall_timeout_ms() -> u64 {
    pipeline::STALL_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Trailing silence before speech stop. Longer values tolerate natural
    /// pauses at the cost of response latency.
    #[serde(default = "default_stop_secs")]
    pub stop_secs: f32,

    /// Speech needed before speech start
    #[serde(default = "default_start_secs")]
    pub start_secs: f32,

    /// RMS energy threshold in dBFS
    #[serde(default = "default_threshold_db")]
    pub threshold_db: f32,

    /// Inbound sample rate
    #[serde(default = "default_input_sample_rate")]
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            stop_secs: default_stop_secs(),
            start_secs: default_start_secs(),
            threshold_db: default_threshold_db(),
            sample_rate: default_input_sample_rate(),
        }
    }
}

fn default_stop_secs() -> f32 {
    vad::STOP_SECS
}

fn default_start_secs() -> f32 {
    vad::START_SECS
}

fn default_threshold_db() -> f32 {
    vad::THRESHOLD_DB
}

fn default_input_sample_rate() -> u32 {
    audio::INPUT_SAMPLE_RATE
}

/// Generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Chat endpoint base URL (Ollama compatible)
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Speech synthesis endpoint; text-only replies when unset
    #[serde(default = "default_tts_endpoint")]
    pub tts_endpoint: Option<String>,

    /// Named voice for synthesized replies
    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,

    /// Sample rate of synthesized PCM
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_model(),
            tts_endpoint: default_tts_endpoint(),
            voice_id: default_voice_id(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_generation_timeout_ms(),
            output_sample_rate: default_output_sample_rate(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the voice is one the synthesis endpoint is known to offer
    pub fn is_known_voice(&self) -> bool {
        generation::KNOWN_VOICES.contains(&self.voice_id.as_str())
    }
}

fn default_llm_endpoint() -> String {
    endpoints::LLM_DEFAULT.to_string()
}

fn default_model() -> String {
    generation::MODEL.to_string()
}

fn default_tts_endpoint() -> Option<String> {
    Some(endpoints::TTS_DEFAULT.to_string())
}

fn default_voice_id() -> String {
    generation::VOICE_ID.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    256
}

fn default_generation_timeout_ms() -> u64 {
    generation::TIMEOUT_MS
}

fn default_output_sample_rate() -> u32 {
    audio::OUTPUT_SAMPLE_RATE
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Whisper-compatible transcription endpoint
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_stt_model")]
    pub model: String,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_stt_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: default_stt_endpoint(),
            model: default_stt_model(),
            language: None,
            timeout_ms: default_stt_timeout_ms(),
        }
    }
}

impl SttConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_stt_endpoint() -> String {
    endpoints::STT_DEFAULT.to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_stt_timeout_ms() -> u64 {
    10_000
}

/// Knowledge retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Knowledge source to query. Sessions start degraded when unset.
    #[serde(default)]
    pub knowledge_base_id: Option<String>,

    #[serde(default = "default_retrieval_endpoint")]
    pub endpoint: String,

    /// Query sent once per session
    #[serde(default = "default_retrieval_query")]
    pub query: String,

    /// Model used to generate the answer from retrieved passages
    #[serde(default = "default_model_arn")]
    pub model_arn: String,

    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_base_id: None,
            endpoint: default_retrieval_endpoint(),
            query: default_retrieval_query(),
            model_arn: default_model_arn(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_retrieval_endpoint() -> String {
    endpoints::RETRIEVAL_DEFAULT.to_string()
}

fn default_retrieval_query() -> String {
    retrieval::QUERY.to_string()
}

fn default_model_arn() -> String {
    retrieval::MODEL_ARN.to_string()
}

fn default_retrieval_timeout_ms() -> u64 {
    retrieval::TIMEOUT_MS
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Expose Prometheus metrics at /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load settings from `config/` and the environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (PARLEY_ prefix, e.g. `PARLEY__VAD__STOP_SECS=1.2`)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from(Path::new("config"), env)
}

/// Load settings from an explicit configuration directory
pub fn load_settings_from(dir: &Path, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = dir.join("default");
    builder = builder.add_source(File::with_name(&default_path.to_string_lossy()).required(false));

    if let Some(env_name) = env {
        let env_path = dir.join(env_name);
        builder = builder.add_source(File::with_name(&env_path.to_string_lossy()).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("PARLEY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.vad.stop_secs, 0.8);
        assert_eq!(settings.vad.sample_rate, 16000);
        assert_eq!(settings.generation.voice_id, "tiffany");
        assert!(settings.generation.is_known_voice());
        assert!(settings.pipeline.allow_interruptions);
        assert!(settings.retrieval.knowledge_base_id.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pipeline_validation() {
        let mut settings = Settings::default();
        settings.pipeline.channel_capacity = 0;
        assert!(settings.validate().is_err());

        settings.pipeline.channel_capacity = 8;
        settings.pipeline.drain_timeout_ms = settings.pipeline.cancel_timeout_ms;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "pipeline.drain_timeout_ms"));
    }

    #[test]
    fn test_vad_validation() {
        let mut settings = Settings::default();
        settings.vad.stop_secs = 0.0;
        assert!(settings.validate().is_err());

        settings.vad.stop_secs = 1.5;
        assert!(settings.validate().is_ok());

        settings.vad.sample_rate = 44100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_generation_validation() {
        let mut settings = Settings::default();
        settings.generation.voice_id = "  ".into();
        assert!(matches!(settings.validate(), Err(ConfigError::MissingField(_))));

        settings.generation.voice_id = "matthew".into();
        settings.generation.temperature = 3.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.yaml"),
            "vad:\n  stop_secs: 1.2\ngeneration:\n  voice_id: amy\nretrieval:\n  knowledge_base_id: KB123\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("staging.yaml"), "server:\n  port: 9000\n").unwrap();

        let settings = load_settings_from(dir.path(), Some("staging")).unwrap();
        assert_eq!(settings.vad.stop_secs, 1.2);
        assert_eq!(settings.generation.voice_id, "amy");
        assert_eq!(settings.retrieval.knowledge_base_id.as_deref(), Some("KB123"));
        assert_eq!(settings.server.port, 9000);
        // untouched sections keep defaults
        assert_eq!(settings.pipeline.channel_capacity, 64);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.yaml"), "pipeline:\n  channel_capacity: 0\n").unwrap();

        assert!(load_settings_from(dir.path(), None).is_err());
    }
}
