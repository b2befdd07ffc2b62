//! Voice pipeline assembly
//!
//! Stage order:
//!
//! ```text
//! audio in -> vad -> transcription -> turn -> user_aggregator
//!          -> generation -> assistant_aggregator -> transport_output
//! ```
//!
//! The aggregators sit on either side of generation so the user aggregator
//! snapshots context before a request and the assistant aggregator sees the
//! stream's text and completion after it.

use std::sync::Arc;
use tokio::sync::broadcast;

use parley_config::PipelineConfig;
use parley_pipeline::{
    AssistantContextAggregator, GenerationProcessor, PipelineEvent, ProcessorChain,
    TranscriptionProcessor, TransportOutput, TurnMonitor, TurnProcessor, UserContextAggregator,
    VadProcessor,
};

use crate::services::SessionServices;
use crate::session::Session;
use crate::AgentError;

/// A built chain and the read side of its turn stage
pub struct VoicePipeline {
    pub chain: ProcessorChain,
    pub monitor: TurnMonitor,
}

/// Build the voice pipeline for `session`.
///
/// Takes the session store's user and assistant writers, so it can only
/// succeed once per session.
pub fn build_voice_pipeline(
    session: &Session,
    services: &SessionServices,
    config: &PipelineConfig,
    events: broadcast::Sender<PipelineEvent>,
) -> Result<VoicePipeline, AgentError> {
    let turn = TurnProcessor::new(config.allow_interruptions)
        .with_ledger(session.ledger().clone())
        .with_events(events.clone());
    let monitor = turn.monitor();

    let user = UserContextAggregator::new(session.store())?.with_events(events.clone());
    let assistant = AssistantContextAggregator::new(session.store())?.with_events(events.clone());

    let chain = ProcessorChain::builder(format!("session-{}", session.connection_id()))
        .processor(VadProcessor::new(Arc::clone(&services.vad)))
        .processor(TranscriptionProcessor::new(Arc::clone(&services.stt)))
        .processor(turn)
        .processor(user)
        .processor(GenerationProcessor::new(Arc::clone(&services.generation)).with_events(events))
        .processor(assistant)
        .processor(TransportOutput::new(Arc::clone(&services.sink)))
        .with_config(config)
        .build();

    Ok(VoicePipeline { chain, monitor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{
        AudioChunk, AudioSink, GenerationRequest, GenerationService, GenerationStream, Result,
        Role, SpeechToText,
    };
    use parley_pipeline::{event_channel, EnergyVad, EnergyVadConfig};
    use parley_rag::RetrievalPreloader;

    struct NoStt;

    #[async_trait]
    impl SpeechToText for NoStt {
        async fn transcribe(&self, _utterance: &AudioChunk) -> Result<String> {
            Ok(String::new())
        }

        fn model_name(&self) -> &str {
            "none"
        }
    }

    struct NoGeneration;

    #[async_trait]
    impl GenerationService for NoGeneration {
        async fn start_generation(&self, request: GenerationRequest) -> Result<GenerationStream> {
            Ok(GenerationStream::channel(request.turn_id, 1).1)
        }

        fn name(&self) -> &str {
            "none"
        }
    }

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn send_audio(&self, _chunk: AudioChunk) -> Result<()> {
            Ok(())
        }
    }

    fn services() -> SessionServices {
        SessionServices {
            vad: Arc::new(EnergyVad::new(EnergyVadConfig::default())),
            stt: Arc::new(NoStt),
            generation: Arc::new(NoGeneration),
            preloader: Arc::new(RetrievalPreloader::disabled()),
            sink: Arc::new(NullSink),
        }
    }

    #[test]
    fn test_stage_order() {
        let session = Session::new("c1");
        let (events, _rx) = event_channel();
        let pipeline =
            build_voice_pipeline(&session, &services(), &PipelineConfig::default(), events)
                .unwrap();

        assert_eq!(
            pipeline.chain.stage_names(),
            vec![
                "vad",
                "transcription",
                "turn",
                "user_aggregator",
                "generation",
                "assistant_aggregator",
                "transport_output",
            ]
        );
    }

    #[test]
    fn test_builds_once_per_session() {
        let session = Session::new("c1");
        let (events, _rx) = event_channel();
        let config = PipelineConfig::default();
        build_voice_pipeline(&session, &services(), &config, events.clone()).unwrap();

        assert!(build_voice_pipeline(&session, &services(), &config, events).is_err());
        // the store keeps its writers' role checks
        assert!(session.store().writer(Role::System).is_err());
    }
}
