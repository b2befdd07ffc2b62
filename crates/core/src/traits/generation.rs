//! Generation service interface
//!
//! A generation is a cancellable stream: the caller holds a [`GenerationStream`]
//! and the producer holds the matching [`GenerationProducer`]. Cancelling sends
//! a signal the producer observes at its next suspension point; nothing is
//! forcibly aborted.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::audio::AudioChunk;
use crate::conversation::{Message, TurnId};
use crate::Result;

/// Default buffer between a producer and its consumer
pub const DEFAULT_EVENT_BUFFER: usize = 32;

/// Request for one assistant turn
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub turn_id: TurnId,
    /// Committed context, system message first
    pub messages: Arc<[Message]>,
}

/// Events yielded by a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    AudioDelta(AudioChunk),
    Complete,
    Error(String),
}

impl GenerationEvent {
    /// Complete and Error end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationEvent::Complete | GenerationEvent::Error(_))
    }
}

/// Caller side of the cancel signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Create a handle and the signal its producer observes
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    /// Ask the producer to stop
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Producer side of the cancel signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation was requested or the caller went away
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Producer half handed to the task that talks to the backend
pub struct GenerationProducer {
    tx: mpsc::Sender<GenerationEvent>,
    signal: CancelSignal,
}

impl GenerationProducer {
    /// Send an event, waiting for buffer space.
    ///
    /// Returns `false` when the stream was cancelled or dropped; the producer
    /// should stop at that point.
    pub async fn send(&mut self, event: GenerationEvent) -> bool {
        if self.signal.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled() || self.tx.is_closed()
    }

    /// Signal for use in the producer's own `select!`
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }
}

/// Consumer half of a running generation
pub struct GenerationStream {
    turn_id: TurnId,
    events: mpsc::Receiver<GenerationEvent>,
    cancel: CancelHandle,
}

impl GenerationStream {
    /// Create a linked stream/producer pair
    pub fn channel(turn_id: TurnId, buffer: usize) -> (GenerationProducer, GenerationStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel, signal) = CancelHandle::new();
        (
            GenerationProducer { tx, signal },
            GenerationStream {
                turn_id,
                events: rx,
                cancel,
            },
        )
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Next event; `None` once the producer is gone. Cancel safe.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Streaming generation backend
#[async_trait]
pub trait GenerationService: Send + Sync + 'static {
    /// Start generating a response for the given context
    async fn start_generation(&self, request: GenerationRequest) -> Result<GenerationStream>;

    /// Stop a running generation
    fn cancel_generation(&self, handle: &CancelHandle) {
        handle.cancel();
    }

    /// Name for logging
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let (mut producer, mut stream) = GenerationStream::channel(1, 4);
        tokio::spawn(async move {
            producer.send(GenerationEvent::TextDelta("Hello".into())).await;
            producer.send(GenerationEvent::Complete).await;
        });

        assert_eq!(
            stream.next_event().await,
            Some(GenerationEvent::TextDelta("Hello".into()))
        );
        assert_eq!(stream.next_event().await, Some(GenerationEvent::Complete));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_producer() {
        let (mut producer, stream) = GenerationStream::channel(1, 1);
        assert!(producer.send(GenerationEvent::TextDelta("a".into())).await);

        let handle = stream.cancel_handle();
        let blocked = tokio::spawn(async move {
            producer.send(GenerationEvent::TextDelta("b".into())).await
        });

        handle.cancel();
        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .expect("producer should unblock")
            .unwrap();
        assert!(!sent);
        drop(stream);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (producer, stream) = GenerationStream::channel(9, 4);
        let signal = producer.signal();
        drop(stream);
        assert!(signal.is_cancelled());
        assert!(producer.is_cancelled());
    }

    #[test]
    fn test_terminal_events() {
        assert!(GenerationEvent::Complete.is_terminal());
        assert!(GenerationEvent::Error("boom".into()).is_terminal());
        assert!(!GenerationEvent::TextDelta("x".into()).is_terminal());
    }
}
