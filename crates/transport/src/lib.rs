//! Transport layer
//!
//! Provides:
//! - Lifecycle events a transport reports to its session
//! - An in-memory channel transport (tests, embedding)
//! - The PCM16 wire codec and control messages used over WebSocket

pub mod channel;
pub mod codec;
pub mod events;

pub use channel::{ChannelAudioSink, ChannelTransport, ConnectionState};
pub use codec::{ControlMessage, Pcm16Codec, Resampler};
pub use events::TransportEvent;

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for parley_core::Error {
    fn from(err: TransportError) -> Self {
        parley_core::Error::Transport(err.to_string())
    }
}
