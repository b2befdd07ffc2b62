//! Transport-out stage
//!
//! Writes assistant audio to the connection's [`AudioSink`]. Sends wait for
//! the sink, so a slow client pushes back on the generation stage.

use async_trait::async_trait;
use std::sync::Arc;

use parley_core::{AudioSink, Frame, FrameDirection, FrameProcessor, ProcessorContext, Result};

pub struct TransportOutput {
    sink: Arc<dyn AudioSink>,
}

impl TransportOutput {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameProcessor for TransportOutput {
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if direction == FrameDirection::Upstream {
            return Ok(vec![frame]);
        }

        if let Frame::AudioChunk(chunk) = &frame {
            if context.is_cancelled() {
                // flushing what was queued before cancellation
                self.sink.send_audio(chunk.clone()).await?;
            } else {
                tokio::select! {
                    biased;
                    _ = context.cancelled() => return Ok(vec![]),
                    sent = self.sink.send_audio(chunk.clone()) => sent?,
                }
            }
            metrics::counter!("parley_audio_chunks_out_total").increment(1);
        }
        Ok(vec![frame])
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        self.sink.flush().await
    }

    fn name(&self) -> &'static str {
        "transport_output"
    }

    fn description(&self) -> &str {
        "Outbound audio to the client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{AudioChunk, Error, SampleRate};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<usize>,
        broken: bool,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn send_audio(&self, _chunk: AudioChunk) -> Result<()> {
            if self.broken {
                return Err(Error::Transport("peer gone".into()));
            }
            *self.sent.lock() += 1;
            Ok(())
        }
    }

    fn audio() -> Frame {
        Frame::AudioChunk(AudioChunk::from_samples(&[1; 480], SampleRate::Hz24000, Duration::ZERO))
    }

    #[tokio::test]
    async fn test_writes_audio_and_forwards() {
        let sink = Arc::new(RecordingSink::default());
        let stage = TransportOutput::new(sink.clone());
        let mut ctx = ProcessorContext::new("s");

        let out = stage.process(audio(), FrameDirection::Downstream, &mut ctx).await.unwrap();
        stage
            .process(Frame::SpeechStart, FrameDirection::Downstream, &mut ctx)
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(*sink.sent.lock(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_error() {
        let stage = TransportOutput::new(Arc::new(RecordingSink {
            broken: true,
            ..Default::default()
        }));
        let mut ctx = ProcessorContext::new("s");
        let result = stage.process(audio(), FrameDirection::Downstream, &mut ctx).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
