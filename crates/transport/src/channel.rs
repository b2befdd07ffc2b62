//! In-memory transport
//!
//! Drives a session through plain channels: the peer side calls
//! `connect`/`send_audio`/`close` and reads outbound audio from the sink's
//! receiver. The WebSocket bridge uses the same event shape.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use parley_core::{AudioChunk, AudioSink, Error, Result};

use crate::{TransportError, TransportEvent};

/// Connection lifecycle as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Outbound audio sink backed by a bounded channel
///
/// `send_audio` waits for capacity, so a slow reader back-pressures the
/// pipeline.
#[derive(Clone)]
pub struct ChannelAudioSink {
    tx: mpsc::Sender<AudioChunk>,
}

impl ChannelAudioSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AudioChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AudioSink for ChannelAudioSink {
    async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| Error::from(TransportError::SessionClosed))
    }
}

/// Peer side of an in-memory connection
pub struct ChannelTransport {
    connection_id: String,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<ConnectionState>,
    sink: Arc<ChannelAudioSink>,
    outbound: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
}

impl ChannelTransport {
    /// Create a transport and the event receiver its session consumes
    pub fn new(
        connection_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let (sink, outbound) = ChannelAudioSink::new(capacity);
        let transport = Self {
            connection_id: connection_id.into(),
            events,
            state: Mutex::new(ConnectionState::New),
            sink: Arc::new(sink),
            outbound: Mutex::new(Some(outbound)),
        };
        (transport, rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Sink the session writes assistant audio into
    pub fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    /// Receiver of assistant audio; can be taken once
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<AudioChunk>> {
        self.outbound.lock().take()
    }

    pub async fn connect(
        &self,
        remote_addr: Option<String>,
    ) -> std::result::Result<(), TransportError> {
        self.transition(&[ConnectionState::New], ConnectionState::Connected)?;
        self.emit(TransportEvent::Connected {
            connection_id: self.connection_id.clone(),
            remote_addr,
        })
        .await
    }

    pub async fn send_audio(
        &self,
        chunk: AudioChunk,
    ) -> std::result::Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::InvalidState {
                expected: ConnectionState::Connected.as_str(),
                actual: state.as_str(),
            });
        }
        self.emit(TransportEvent::AudioReceived(chunk)).await
    }

    pub async fn disconnect(
        &self,
        reason: impl Into<String>,
    ) -> std::result::Result<(), TransportError> {
        self.transition(&[ConnectionState::Connected], ConnectionState::Disconnected)?;
        self.emit(TransportEvent::Disconnected {
            reason: reason.into(),
        })
        .await
    }

    /// Close the connection; closing twice is a no-op
    pub async fn close(
        &self,
        reason: impl Into<String>,
    ) -> std::result::Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }
        tracing::debug!(connection_id = %self.connection_id, "Transport closed");
        self.emit(TransportEvent::Closed {
            reason: reason.into(),
        })
        .await
    }

    fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(TransportError::InvalidState {
                expected: from.first().map(|s| s.as_str()).unwrap_or("any"),
                actual: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    async fn emit(&self, event: TransportEvent) -> std::result::Result<(), TransportError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::SampleRate;
    use std::time::Duration;

    fn chunk() -> AudioChunk {
        AudioChunk::from_samples(&[1; 320], SampleRate::Hz16000, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let (transport, mut events) = ChannelTransport::new("c1", 8);
        transport.connect(Some("127.0.0.1:5000".into())).await.unwrap();
        transport.send_audio(chunk()).await.unwrap();
        transport.disconnect("network").await.unwrap();
        transport.close("bye").await.unwrap();

        let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["connected", "audio", "disconnected", "closed"]);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_audio_before_connect_rejected() {
        let (transport, _events) = ChannelTransport::new("c1", 8);
        assert!(matches!(
            transport.send_audio(chunk()).await,
            Err(TransportError::InvalidState { actual: "new", .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, mut events) = ChannelTransport::new("c1", 8);
        transport.close("first").await.unwrap();
        transport.close("second").await.unwrap();
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_backpressure_and_close() {
        let (sink, mut rx) = ChannelAudioSink::new(1);
        sink.send_audio(chunk()).await.unwrap();

        // full: the second send waits until the reader catches up
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sink.send_audio(chunk())).await;
        assert!(blocked.is_err());

        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(matches!(sink.send_audio(chunk()).await, Err(Error::Transport(_))));
    }
}
