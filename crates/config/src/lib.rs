//! Configuration management for the parley voice agent
//!
//! Supports loading configuration from:
//! - YAML/TOML files under `config/`
//! - Environment variables (PARLEY_ prefix, `__` separator)
//!
//! Every field has a serde default, so an empty source yields a runnable
//! development configuration.

pub mod constants;
pub mod prompts;
pub mod settings;

pub use prompts::PromptConfig;
pub use settings::{
    load_settings, load_settings_from, GenerationConfig, ObservabilityConfig, PipelineConfig,
    RetrievalConfig, ServerConfig, Settings, SttConfig, VadConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ConfigError::MissingField(key),
            other => ConfigError::ParseError(other.to_string()),
        }
    }
}
