//! Scheduler behaviour: stage failures, upstream control, back-pressure and cancellation

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use parley_core::{
    AudioChunk, AudioSink, Error, Frame, FrameDirection, FrameProcessor, GenerationEvent,
    GenerationProducer, GenerationRequest, GenerationService, GenerationStream,
    InterruptionReason, ProcessorContext, Result, Role, SampleRate, TurnStatus,
};
use parley_pipeline::{
    AssistantContextAggregator, ContextStore, GenerationProcessor, ProcessorChain,
    TransportOutput, TurnPhase, TurnProcessor, UserContextAggregator,
};

/// Forwards every frame untouched
struct Relay(&'static str);

#[async_trait]
impl FrameProcessor for Relay {
    async fn process(
        &self,
        frame: Frame,
        _direction: FrameDirection,
        _context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        Ok(vec![frame])
    }

    fn name(&self) -> &'static str {
        self.0
    }
}

/// Fails on `SpeechStop`, passes everything else
struct FailOnStop;

#[async_trait]
impl FrameProcessor for FailOnStop {
    async fn process(
        &self,
        frame: Frame,
        _direction: FrameDirection,
        _context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        match frame {
            Frame::SpeechStop => Err(Error::Context("boom".into())),
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "fail_on_stop"
    }
}

/// Records frames arriving from later stages
#[derive(Default, Clone)]
struct UpstreamRecorder {
    seen: Arc<Mutex<Vec<Frame>>>,
}

impl UpstreamRecorder {
    async fn wait_for(&self, count: usize) -> Vec<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.seen.lock().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for upstream frames");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.seen.lock().clone()
    }
}

#[async_trait]
impl FrameProcessor for UpstreamRecorder {
    async fn process(
        &self,
        frame: Frame,
        direction: FrameDirection,
        _context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if direction == FrameDirection::Upstream {
            self.seen.lock().push(frame.clone());
        }
        Ok(vec![frame])
    }

    fn name(&self) -> &'static str {
        "upstream_recorder"
    }
}

/// Answers `TriggerResponse` with an upstream `GenerationComplete`
struct CompleteOnTrigger;

#[async_trait]
impl FrameProcessor for CompleteOnTrigger {
    async fn process(
        &self,
        frame: Frame,
        _direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if frame == Frame::TriggerResponse {
            context.push(FrameDirection::Upstream, Frame::GenerationComplete { turn_id: 1 });
        }
        Ok(vec![frame])
    }

    fn name(&self) -> &'static str {
        "complete_on_trigger"
    }
}

/// Blocks on audio, either until cancelled or forever
struct Blocking {
    honours_cancel: bool,
}

#[async_trait]
impl FrameProcessor for Blocking {
    async fn process(
        &self,
        frame: Frame,
        _direction: FrameDirection,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        if matches!(frame, Frame::AudioChunk(_)) {
            if self.honours_cancel {
                tokio::select! {
                    _ = context.cancelled() => return Ok(vec![]),
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
            } else {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        Ok(vec![frame])
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}

/// Emits whatever arrives on its own channel
struct Producer {
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
}

#[async_trait]
impl FrameProcessor for Producer {
    async fn process(
        &self,
        frame: Frame,
        _direction: FrameDirection,
        _context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        Ok(vec![frame])
    }

    async fn produce(&self, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match self.rx.lock().await.recv().await {
            Some(frame) => Ok(vec![frame]),
            None => std::future::pending().await,
        }
    }

    fn name(&self) -> &'static str {
        "producer"
    }
}

/// Sink whose peer is gone
struct BrokenSink;

#[async_trait]
impl AudioSink for BrokenSink {
    async fn send_audio(&self, _chunk: AudioChunk) -> Result<()> {
        Err(Error::Transport("peer gone".into()))
    }
}

/// Hands each stream's producer to the test
#[derive(Default, Clone)]
struct ScriptedGeneration {
    producers: Arc<Mutex<Vec<GenerationProducer>>>,
}

impl ScriptedGeneration {
    async fn next_producer(&self) -> GenerationProducer {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(producer) = self.producers.lock().pop() {
                return producer;
            }
            assert!(Instant::now() < deadline, "generation never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn start_generation(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let (producer, stream) = GenerationStream::channel(request.turn_id, 8);
        self.producers.lock().push(producer);
        Ok(stream)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn chunk() -> AudioChunk {
    AudioChunk::from_samples(&[0; 320], SampleRate::Hz16000, Duration::ZERO)
}

fn audio() -> Frame {
    Frame::AudioChunk(chunk())
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for output")
        .expect("output closed")
}

#[tokio::test]
async fn test_stage_error_becomes_interruption() {
    let chain = ProcessorChain::builder("errors")
        .processor(FailOnStop)
        .processor(Relay("tail"))
        .build();
    let (tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);
    let mut output = handle.take_output().unwrap();

    tx.send(Frame::SpeechStop).await.unwrap();
    tx.send(Frame::SpeechStart).await.unwrap();

    assert_eq!(
        next_frame(&mut output).await,
        Frame::interruption(None, InterruptionReason::StageFailure)
    );
    // the scheduler keeps running after the failure
    assert_eq!(next_frame(&mut output).await, Frame::SpeechStart);

    handle.cancel().await.unwrap();
}

#[tokio::test]
async fn test_stage_error_travels_upstream() {
    let recorder = UpstreamRecorder::default();
    let chain = ProcessorChain::builder("errors_up")
        .processor(recorder.clone())
        .processor(FailOnStop)
        .build();
    let (tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);

    tx.send(Frame::SpeechStop).await.unwrap();

    assert_eq!(
        recorder.wait_for(1).await,
        vec![Frame::interruption(None, InterruptionReason::StageFailure)]
    );
    handle.cancel().await.unwrap();
}

#[tokio::test]
async fn test_pushed_frames_reach_earlier_stage() {
    let recorder = UpstreamRecorder::default();
    let chain = ProcessorChain::builder("feedback")
        .processor(recorder.clone())
        .processor(Relay("middle"))
        .processor(CompleteOnTrigger)
        .build();
    let (_tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![Frame::TriggerResponse], rx);
    let mut output = handle.take_output().unwrap();

    assert_eq!(next_frame(&mut output).await, Frame::TriggerResponse);
    assert_eq!(
        recorder.wait_for(1).await,
        vec![Frame::GenerationComplete { turn_id: 1 }]
    );
    handle.cancel().await.unwrap();
}

#[tokio::test]
async fn test_produced_frames_flow_downstream() {
    let (produce_tx, produce_rx) = mpsc::channel(4);
    let chain = ProcessorChain::builder("produce")
        .processor(Producer {
            rx: tokio::sync::Mutex::new(produce_rx),
        })
        .processor(Relay("tail"))
        .build();
    let (_tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);
    let mut output = handle.take_output().unwrap();

    produce_tx.send(Frame::SpeechStart).await.unwrap();
    produce_tx.send(Frame::SpeechStop).await.unwrap();

    assert_eq!(next_frame(&mut output).await, Frame::SpeechStart);
    assert_eq!(next_frame(&mut output).await, Frame::SpeechStop);
    handle.cancel().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unblocks_cooperative_stage() {
    let chain = ProcessorChain::builder("cooperative")
        .processor(Blocking {
            honours_cancel: true,
        })
        .cancel_timeout(Duration::from_millis(500))
        .build();
    let (tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);

    tx.send(audio()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    handle.cancel().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(handle.is_finished());
}

#[tokio::test]
async fn test_cancel_is_bounded_when_stage_hangs() {
    let chain = ProcessorChain::builder("stuck")
        .processor(Relay("head"))
        .processor(Blocking {
            honours_cancel: false,
        })
        .cancel_timeout(Duration::from_millis(100))
        .build();
    let (tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);

    tx.send(audio()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let result = handle.cancel().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    match result {
        Err(Error::FatalScheduler(message)) => assert!(message.contains("blocking")),
        other => panic!("expected fatal scheduler error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_prolonged_stall_is_fatal() {
    let chain = ProcessorChain::builder("stall")
        .processor(Relay("head"))
        .processor(Blocking {
            honours_cancel: true,
        })
        .channel_capacity(1)
        .stall_timeout(Duration::from_millis(100))
        .build();
    let (tx, rx) = mpsc::channel(16);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![], rx);
    let mut fatal = handle.fatal();

    for _ in 0..6 {
        tx.send(audio()).await.unwrap();
    }

    let reported = tokio::time::timeout(Duration::from_secs(2), fatal.wait_for(|f| f.is_some()))
        .await
        .expect("no stall reported")
        .map(|f| f.clone())
        .unwrap();
    assert!(matches!(reported, Some(Error::FatalScheduler(_))));

    handle.cancel().await.unwrap();
}

#[tokio::test]
async fn test_output_failure_silences_the_reply() {
    let store = ContextStore::new();
    store
        .seed("sys", &[(Role::User, "I want to create a DPR".to_string())])
        .unwrap();
    let generation = ScriptedGeneration::default();
    let turn = TurnProcessor::new(true);
    let mut monitor = turn.monitor();
    let ledger = turn.ledger();

    let chain = ProcessorChain::builder("broken_output")
        .processor(turn)
        .processor(UserContextAggregator::new(&store).unwrap())
        .processor(GenerationProcessor::new(Arc::new(generation.clone())))
        .processor(AssistantContextAggregator::new(&store).unwrap())
        .processor(TransportOutput::new(Arc::new(BrokenSink)))
        .build();
    let (_tx, rx) = mpsc::channel(8);
    let mut handle = chain.run(ProcessorContext::new("s"), vec![Frame::TriggerResponse], rx);

    let mut producer = generation.next_producer().await;
    assert!(producer.send(GenerationEvent::AudioDelta(chunk())).await);

    // the failed write ends the turn and cancels the stream behind it
    assert!(monitor.wait_for(TurnPhase::Idle, Duration::from_secs(2)).await);
    let deadline = Instant::now() + Duration::from_secs(2);
    while !producer.is_cancelled() {
        assert!(Instant::now() < deadline, "stream was not cancelled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    producer
        .send(GenerationEvent::TextDelta("Hello there".into()))
        .await;
    producer.send(GenerationEvent::Complete).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel().await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.last().unwrap().role, Role::User);
    assert_eq!(ledger.get(1).unwrap().status, TurnStatus::Cancelled);
}
