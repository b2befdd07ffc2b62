//! Outbound transport capability

use async_trait::async_trait;

use crate::audio::AudioChunk;
use crate::Result;

/// Accepts outbound audio for the remote peer
///
/// `send_audio` may wait for capacity; that wait is the back-pressure the
/// pipeline propagates toward the generation stage.
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    async fn send_audio(&self, chunk: AudioChunk) -> Result<()>;

    /// Flush anything the sink buffers internally
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
