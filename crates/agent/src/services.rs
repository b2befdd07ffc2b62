//! Service wiring
//!
//! Stateless clients are built once and shared by every connection. VAD keeps
//! per-stream state, so each connection gets a fresh detector.

use std::sync::Arc;

use parley_config::Settings;
use parley_core::{AudioSink, GenerationService, SpeechToText, VoiceActivityDetector};
use parley_llm::VoiceGenerationService;
use parley_pipeline::{EnergyVad, EnergyVadConfig, HttpTranscriber};
use parley_rag::RetrievalPreloader;

use crate::AgentError;

/// Builds one voice activity detector per connection
pub type VadFactory = Arc<dyn Fn() -> Arc<dyn VoiceActivityDetector> + Send + Sync>;

/// Clients shared across connections
#[derive(Clone)]
pub struct SharedServices {
    stt: Arc<dyn SpeechToText>,
    generation: Arc<dyn GenerationService>,
    preloader: Arc<RetrievalPreloader>,
    vad: VadFactory,
}

impl SharedServices {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        generation: Arc<dyn GenerationService>,
        preloader: RetrievalPreloader,
    ) -> Self {
        Self {
            stt,
            generation,
            preloader: Arc::new(preloader),
            vad: energy_vad(EnergyVadConfig::default()),
        }
    }

    pub fn with_vad_factory(mut self, vad: VadFactory) -> Self {
        self.vad = vad;
        self
    }

    /// Build every client from settings
    pub fn from_settings(settings: &Settings) -> Result<Self, AgentError> {
        let stt = HttpTranscriber::new(settings.stt.clone())?;
        let generation = VoiceGenerationService::from_config(&settings.generation)?;
        let preloader = RetrievalPreloader::from_config(&settings.retrieval)?;
        if !preloader.is_enabled() {
            tracing::warn!("No knowledge base configured, sessions will start degraded");
        }

        Ok(Self::new(Arc::new(stt), Arc::new(generation), preloader)
            .with_vad_factory(energy_vad(EnergyVadConfig::from(&settings.vad))))
    }

    /// Services for one connection writing audio into `sink`
    pub fn for_connection(&self, sink: Arc<dyn AudioSink>) -> SessionServices {
        SessionServices {
            vad: (self.vad)(),
            stt: Arc::clone(&self.stt),
            generation: Arc::clone(&self.generation),
            preloader: Arc::clone(&self.preloader),
            sink,
        }
    }
}

fn energy_vad(config: EnergyVadConfig) -> VadFactory {
    Arc::new(move || Arc::new(EnergyVad::new(config.clone())) as Arc<dyn VoiceActivityDetector>)
}

/// Everything one session's pipeline talks to
#[derive(Clone)]
pub struct SessionServices {
    pub vad: Arc<dyn VoiceActivityDetector>,
    pub stt: Arc<dyn SpeechToText>,
    pub generation: Arc<dyn GenerationService>,
    pub preloader: Arc<RetrievalPreloader>,
    pub sink: Arc<dyn AudioSink>,
}
