//! Transport lifecycle events

use parley_core::AudioChunk;

/// What a transport reports to the session that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Peer connected; the session may start
    Connected {
        connection_id: String,
        remote_addr: Option<String>,
    },
    /// Inbound PCM16 audio from the peer
    AudioReceived(AudioChunk),
    /// Peer dropped off; the session drains rather than tearing down
    Disconnected { reason: String },
    /// Connection is gone for good; the session tears down
    Closed { reason: String },
    /// Transport failed; the session drains the pipeline and closes
    Error { message: String },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::AudioReceived(_) => "audio",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::Closed { .. } => "closed",
            TransportEvent::Error { .. } => "error",
        }
    }
}
