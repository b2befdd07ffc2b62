//! Session orchestrator
//!
//! Drives one connection from `Connected` to close. On connect it preloads
//! knowledge, seeds the context store and starts the voice pipeline with a
//! response trigger so the assistant speaks first. Inbound audio is fed to
//! the pipeline without blocking the event loop.
//!
//! Close paths:
//! - `Closed` or the event channel ending: cancel the pipeline
//! - transport `Error`: end the input and let queued frames drain, bounded
//!   by the cancel timeout
//! - fatal scheduler error: cancel and report the error

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};

use parley_config::{PipelineConfig, PromptConfig, Settings};
use parley_core::{
    AudioChunk, ConversationRecord, Error, Frame, ProcessorContext, Result, Role, Turn,
};
use parley_pipeline::{event_channel, PipelineEvent, PipelineHandle};
use parley_transport::TransportEvent;

use crate::assembly::build_voice_pipeline;
use crate::services::SessionServices;
use crate::session::{Session, SessionStatus};

/// Per-session settings
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub pipeline: PipelineConfig,
    pub prompts: PromptConfig,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pipeline: settings.pipeline.clone(),
            prompts: settings.prompts.clone(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub record: ConversationRecord,
    pub status: SessionStatus,
    /// Why the session closed, when it was not a normal close
    pub error: Option<Error>,
    pub degraded: bool,
    pub turns: Vec<Turn>,
}

struct Running {
    handle: PipelineHandle,
    audio_tx: Option<mpsc::Sender<Frame>>,
}

pub struct SessionOrchestrator {
    session: Arc<Session>,
    services: SessionServices,
    config: SessionConfig,
    events: broadcast::Sender<PipelineEvent>,
    running: Option<Running>,
}

impl SessionOrchestrator {
    pub fn new(
        connection_id: impl Into<String>,
        services: SessionServices,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = event_channel();
        Self {
            session: Arc::new(Session::new(connection_id)),
            services,
            config,
            events,
            running: None,
        }
    }

    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Pipeline events of this session
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Handle transport events until the session closes
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) -> SessionOutcome {
        let started = Instant::now();
        let mut fatal: Option<watch::Receiver<Option<Error>>> = None;

        let error = loop {
            tokio::select! {
                biased;
                err = wait_fatal(fatal.as_mut()) => break Some(self.abort(err).await),
                event = events.recv() => match event {
                    Some(TransportEvent::Connected { remote_addr, .. }) => {
                        match self.start(remote_addr.as_deref()).await {
                            Ok(Some(rx)) => fatal = Some(rx),
                            Ok(None) => {}
                            Err(err) => break Some(self.abort(err).await),
                        }
                    }
                    Some(TransportEvent::AudioReceived(chunk)) => self.forward_audio(chunk),
                    Some(TransportEvent::Disconnected { reason }) => {
                        tracing::info!(
                            connection_id = %self.session.connection_id(),
                            reason = %reason,
                            "Client disconnected"
                        );
                    }
                    Some(TransportEvent::Error { message }) => {
                        break Some(self.drain_after_error(message).await)
                    }
                    Some(TransportEvent::Closed { reason }) => break self.close(&reason).await.err(),
                    None => break self.close("transport gone").await.err(),
                },
            }
        };

        metrics::histogram!("parley_session_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        self.finish(error)
    }

    /// Start the pipeline. Returns its fatal-error watch, or `None` when it
    /// was already running.
    async fn start(
        &mut self,
        remote_addr: Option<&str>,
    ) -> Result<Option<watch::Receiver<Option<Error>>>> {
        let connection_id = self.session.connection_id().to_string();
        if self.running.is_some() || self.session.status() != SessionStatus::Connecting {
            metrics::counter!("parley_protocol_violations_total").increment(1);
            tracing::warn!(connection_id = %connection_id, "Ignoring repeated connect");
            return Ok(None);
        }
        tracing::info!(
            connection_id = %connection_id,
            remote_addr = remote_addr.unwrap_or("unknown"),
            "Session connecting"
        );
        metrics::counter!("parley_sessions_total").increment(1);

        let knowledge = self.services.preloader.preload(&connection_id).await;
        self.session.set_degraded(knowledge.degraded);
        let system = if knowledge.degraded {
            self.config.prompts.fallback_system_message()
        } else {
            self.config.prompts.system_message(&knowledge.text)
        };
        let seed: Vec<(Role, String)> = self
            .config
            .prompts
            .seed_user()
            .map(|text| vec![(Role::User, text.to_string())])
            .unwrap_or_default();
        self.session.store().seed(system, &seed)?;

        let pipeline = build_voice_pipeline(
            &self.session,
            &self.services,
            &self.config.pipeline,
            self.events.clone(),
        )
        .map_err(|e| Error::Context(e.to_string()))?;
        self.session.set_turn_monitor(pipeline.monitor);

        let (audio_tx, audio_rx) = mpsc::channel(self.config.pipeline.channel_capacity.max(1));
        let handle = pipeline.chain.run(
            ProcessorContext::new(connection_id.clone()),
            vec![Frame::TriggerResponse],
            audio_rx,
        );
        let fatal = handle.fatal();
        self.running = Some(Running {
            handle,
            audio_tx: Some(audio_tx),
        });
        self.session.advance(SessionStatus::Active);
        tracing::info!(
            connection_id = %connection_id,
            degraded = knowledge.degraded,
            "Session active"
        );
        Ok(Some(fatal))
    }

    fn forward_audio(&self, chunk: AudioChunk) {
        let tx = self
            .running
            .as_ref()
            .and_then(|running| running.audio_tx.as_ref())
            .filter(|_| self.session.status() == SessionStatus::Active);
        let Some(tx) = tx else {
            metrics::counter!("parley_audio_chunks_dropped_total", "reason" => "inactive")
                .increment(1);
            return;
        };

        match tx.try_send(Frame::AudioChunk(chunk)) {
            Ok(()) => metrics::counter!("parley_audio_chunks_in_total").increment(1),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("parley_audio_chunks_dropped_total", "reason" => "backpressure")
                    .increment(1);
                tracing::debug!(
                    connection_id = %self.session.connection_id(),
                    "Pipeline busy, dropped inbound audio"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!("parley_audio_chunks_dropped_total", "reason" => "closed")
                    .increment(1);
            }
        }
    }

    /// Normal close: cancel the pipeline
    async fn close(&mut self, reason: &str) -> Result<()> {
        self.session.advance(SessionStatus::Closing);
        tracing::info!(
            connection_id = %self.session.connection_id(),
            reason = %reason,
            "Closing session"
        );
        let result = match self.running.take() {
            Some(mut running) => {
                running.audio_tx = None;
                running.handle.cancel().await
            }
            None => Ok(()),
        };
        self.session.advance(SessionStatus::Closed);
        result
    }

    /// Transport failure: stop reading, let the pipeline drain on its own
    async fn drain_after_error(&mut self, message: String) -> Error {
        self.session.advance(SessionStatus::Closing);
        tracing::warn!(
            connection_id = %self.session.connection_id(),
            error = %message,
            "Transport error, closing session"
        );

        if let Some(mut running) = self.running.take() {
            // the source closing sends EndOfStream through the chain
            running.audio_tx = None;
            let timeout = self.config.pipeline.cancel_timeout();
            match tokio::time::timeout(timeout, running.handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "Pipeline ended with error"),
                Err(_) => {
                    if let Err(err) = running.handle.cancel().await {
                        tracing::error!(error = %err, "Pipeline did not drain");
                    }
                }
            }
        }
        self.session.advance(SessionStatus::Closed);
        Error::Transport(message)
    }

    /// Fatal error: tear everything down
    async fn abort(&mut self, err: Error) -> Error {
        metrics::counter!("parley_session_errors_total", "kind" => err.kind()).increment(1);
        tracing::error!(
            connection_id = %self.session.connection_id(),
            error = %err,
            "Session failed, tearing down"
        );
        self.session.advance(SessionStatus::Closing);
        if let Some(mut running) = self.running.take() {
            running.audio_tx = None;
            if let Err(cancel_err) = running.handle.cancel().await {
                tracing::error!(error = %cancel_err, "Pipeline did not unwind");
            }
        }
        self.session.advance(SessionStatus::Closed);
        err
    }

    fn finish(self, error: Option<Error>) -> SessionOutcome {
        let record = self.session.record();
        match serde_json::to_string(&record) {
            Ok(json) => tracing::info!(
                connection_id = %record.connection_id,
                messages = record.messages.len(),
                record = %json,
                "Conversation record"
            ),
            Err(err) => tracing::warn!(error = %err, "Could not serialize conversation record"),
        }

        SessionOutcome {
            record,
            status: self.session.status(),
            error,
            degraded: self.session.is_degraded(),
            turns: self.session.turns(),
        }
    }
}

/// Resolves with the first fatal error; pending while there is no pipeline
async fn wait_fatal(rx: Option<&mut watch::Receiver<Option<Error>>>) -> Error {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if let Some(err) = rx.borrow_and_update().clone() {
            return err;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
