//! Channel-based processor chain
//!
//! Connects FrameProcessors with bounded tokio channels. Every stage gets a
//! downstream data channel from its predecessor and an upstream control channel
//! from its successor. Upstream input is always served first, so control
//! feedback such as `GenerationComplete` overtakes queued data.

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use parley_config::constants::pipeline as defaults;
use parley_config::PipelineConfig;
use parley_core::{
    Error, Frame, FrameDirection, FrameProcessor, InterruptionReason, ProcessorContext, Result,
};

use crate::PipelineError;

/// A chain of frame processors connected by channels
pub struct ProcessorChain {
    name: String,
    processors: Vec<Arc<dyn FrameProcessor>>,
    channel_capacity: usize,
    cancel_timeout: Duration,
    drain_timeout: Duration,
    stall_timeout: Duration,
}

impl ProcessorChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processors: Vec::new(),
            channel_capacity: defaults::CHANNEL_CAPACITY,
            cancel_timeout: Duration::from_millis(defaults::CANCEL_TIMEOUT_MS),
            drain_timeout: Duration::from_millis(defaults::DRAIN_TIMEOUT_MS),
            stall_timeout: Duration::from_millis(defaults::STALL_TIMEOUT_MS),
        }
    }

    pub fn builder(name: impl Into<String>) -> ProcessorChainBuilder {
        ProcessorChainBuilder::new(name)
    }

    pub fn add<P: FrameProcessor>(&mut self, processor: P) -> &mut Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn add_boxed(&mut self, processor: Arc<dyn FrameProcessor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Stage names in chain order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Pass one downstream frame through every stage in order.
    ///
    /// Each stage's output is fully consumed by the next stage before the
    /// following input is looked at. Frames the stages push in the other
    /// direction stay queued on `context`.
    pub async fn process_one(
        &self,
        frame: Frame,
        context: &mut ProcessorContext,
    ) -> Result<Vec<Frame>> {
        let mut frames = vec![frame];

        for processor in &self.processors {
            let mut next_frames = Vec::new();
            for f in frames {
                let output = processor
                    .process(f, FrameDirection::Downstream, context)
                    .await?;
                next_frames.extend(output);
            }
            frames = next_frames;
        }

        Ok(frames)
    }

    /// Start the chain.
    ///
    /// Spawns one task per stage plus a pump that feeds `initial_frames` and
    /// then everything from `source` into the head of the chain. When `source`
    /// closes, an `EndOfStream` drains the chain and the stage tasks exit.
    pub fn run(
        &self,
        context: ProcessorContext,
        initial_frames: Vec<Frame>,
        source: mpsc::Receiver<Frame>,
    ) -> PipelineHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let fatal_tx = Arc::new(fatal_tx);
        let (output_tx, output_rx) = mpsc::channel(self.channel_capacity);

        let link = |tx: Output, from: &'static str| Link {
            tx,
            from,
            cancel: cancel_rx.clone(),
            stall_timeout: self.stall_timeout,
            fatal: Arc::clone(&fatal_tx),
        };

        let mut tasks = Vec::with_capacity(self.processors.len() + 1);

        if self.processors.is_empty() {
            let pump = link(Output::Tap(output_tx), "source");
            tasks.push((
                "source",
                tokio::spawn(pump_source(pump, initial_frames, source, cancel_rx.clone())),
            ));
        } else {
            let count = self.processors.len();
            let mut down_txs = Vec::with_capacity(count);
            let mut down_rxs = Vec::with_capacity(count);
            let mut up_txs = Vec::with_capacity(count);
            let mut up_rxs = Vec::with_capacity(count);
            for _ in 0..count {
                let (tx, rx) = mpsc::channel::<Frame>(self.channel_capacity);
                down_txs.push(Some(tx));
                down_rxs.push(Some(rx));
                let (tx, rx) = mpsc::channel::<Frame>(self.channel_capacity);
                up_txs.push(Some(tx));
                up_rxs.push(Some(rx));
            }

            // down channel i feeds stage i; up channel i feeds stage i from stage i + 1
            let head_tx = down_txs[0].take();
            if let Some(tx) = head_tx {
                let pump = link(Output::Stage(tx), "source");
                tasks.push((
                    "source",
                    tokio::spawn(pump_source(pump, initial_frames, source, cancel_rx.clone())),
                ));
            }

            let mut output_tx = Some(output_tx);
            for (index, processor) in self.processors.iter().enumerate() {
                let name = processor.name();
                let is_last = index + 1 == count;

                let down_out = if is_last {
                    output_tx.take().map(Output::Tap)
                } else {
                    down_txs[index + 1].take().map(Output::Stage)
                };
                let up_out = if index == 0 {
                    None
                } else {
                    up_txs[index - 1].take().map(|tx| link(Output::Stage(tx), name))
                };
                // The last stage has no successor to feed it control frames.
                let up_in = if is_last {
                    up_txs[index].take();
                    None
                } else {
                    up_rxs[index].take()
                };

                let (Some(down_in), Some(down_out)) = (down_rxs[index].take(), down_out) else {
                    continue;
                };

                let runner = StageRunner {
                    processor: Arc::clone(processor),
                    context: context.clone().with_cancellation(cancel_rx.clone()),
                    down_in,
                    up_in,
                    down_out: link(down_out, name),
                    up_out,
                    cancel: cancel_rx.clone(),
                    drain_timeout: is_last.then_some(self.drain_timeout),
                };
                tasks.push((name, tokio::spawn(runner.run())));
            }
        }

        tracing::debug!(
            chain = %self.name,
            session_id = %context.session_id,
            stages = ?self.stage_names(),
            "Pipeline started"
        );

        PipelineHandle {
            name: self.name.clone(),
            cancel_tx,
            fatal_rx,
            output: Some(output_rx),
            tasks,
            cancel_timeout: self.cancel_timeout,
        }
    }
}

/// Builder for ProcessorChain
pub struct ProcessorChainBuilder {
    chain: ProcessorChain,
}

impl ProcessorChainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            chain: ProcessorChain::new(name),
        }
    }

    pub fn processor<P: FrameProcessor>(mut self, processor: P) -> Self {
        self.chain.add(processor);
        self
    }

    pub fn processor_boxed(mut self, processor: Arc<dyn FrameProcessor>) -> Self {
        self.chain.add_boxed(processor);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.chain.channel_capacity = capacity.max(1);
        self
    }

    /// Bound on how long `cancel()` waits for stage tasks to unwind
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.chain.cancel_timeout = timeout;
        self
    }

    /// Time the last stage gets to flush queued frames after cancellation
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.chain.drain_timeout = timeout;
        self
    }

    /// A send blocked on back-pressure longer than this is fatal
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.chain.stall_timeout = timeout;
        self
    }

    /// Apply every timeout and capacity from the pipeline settings
    pub fn with_config(self, config: &PipelineConfig) -> Self {
        self.channel_capacity(config.channel_capacity)
            .cancel_timeout(config.cancel_timeout())
            .drain_timeout(config.drain_timeout())
            .stall_timeout(config.stall_timeout())
    }

    pub fn build(self) -> ProcessorChain {
        self.chain
    }
}

/// Handle to a running chain
pub struct PipelineHandle {
    name: String,
    cancel_tx: watch::Sender<bool>,
    fatal_rx: watch::Receiver<Option<Error>>,
    output: Option<mpsc::Receiver<Frame>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    cancel_timeout: Duration,
}

impl PipelineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames leaving the last stage.
    ///
    /// This is an observation tap: frames are dropped when the receiver lags
    /// or is gone, and never block the chain.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.output.take()
    }

    /// Fatal scheduler errors, such as a stage stalled on back-pressure
    pub fn fatal(&self) -> watch::Receiver<Option<Error>> {
        self.fatal_rx.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Whether every stage task has exited
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, t)| t.is_finished())
    }

    /// Wait for the chain to stop on its own, after the source closed
    pub async fn join(&mut self) -> Result<()> {
        let results = join_all(self.tasks.iter_mut().map(|(_, t)| t)).await;
        self.tasks.clear();
        log_panics(&self.name, results);

        match self.fatal_rx.borrow().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the chain.
    ///
    /// Stops the source pump, signals every stage, lets the last stage flush
    /// queued frames and waits for all tasks. Tasks still running after the
    /// cancel timeout are aborted and reported as a fatal scheduler error.
    pub async fn cancel(&mut self) -> Result<()> {
        let started = Instant::now();
        self.cancel_tx.send_replace(true);

        let joined = tokio::time::timeout(
            self.cancel_timeout,
            join_all(self.tasks.iter_mut().map(|(_, t)| t)),
        )
        .await;
        match joined {
            Ok(results) => {
                self.tasks.clear();
                log_panics(&self.name, results);
                tracing::debug!(
                    chain = %self.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Pipeline cancelled"
                );
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<&str> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| !t.is_finished())
                    .map(|(name, _)| *name)
                    .collect();
                for (_, task) in &self.tasks {
                    task.abort();
                }
                self.tasks.clear();
                metrics::counter!("parley_pipeline_fatal_total", "cause" => "cancel_timeout")
                    .increment(1);
                tracing::error!(
                    chain = %self.name,
                    stuck = ?stuck,
                    timeout_ms = self.cancel_timeout.as_millis() as u64,
                    "Stages did not unwind after cancellation"
                );
                Err(PipelineError::Unwind {
                    stages: stuck.join(", "),
                    timeout_ms: self.cancel_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel_tx.send_replace(true);
    }
}

fn log_panics(chain: &str, results: Vec<std::result::Result<(), tokio::task::JoinError>>) {
    for err in results.into_iter().filter_map(|r| r.err()) {
        if err.is_panic() {
            tracing::error!(chain = %chain, error = %err, "Stage task panicked");
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Output {
    /// Next stage; sends wait for capacity
    Stage(mpsc::Sender<Frame>),
    /// Observation tap after the last stage; never blocks
    Tap(mpsc::Sender<Frame>),
}

/// Sending half of one hop in the chain
struct Link {
    tx: Output,
    from: &'static str,
    cancel: watch::Receiver<bool>,
    stall_timeout: Duration,
    fatal: Arc<watch::Sender<Option<Error>>>,
}

impl Link {
    async fn send(&self, frame: Frame) -> Flow {
        let tx = match &self.tx {
            Output::Tap(tx) => {
                let _ = tx.try_send(frame);
                return Flow::Continue;
            }
            Output::Stage(tx) => tx,
        };

        let kind = frame.kind();
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Flow::Stop,
            sent = tx.send_timeout(frame, self.stall_timeout) => match sent {
                Ok(()) => Flow::Continue,
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Flow::Stop,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    metrics::counter!("parley_pipeline_fatal_total", "cause" => "stall")
                        .increment(1);
                    tracing::error!(
                        stage = self.from,
                        frame = kind,
                        stall_ms = self.stall_timeout.as_millis() as u64,
                        "Send stalled on back-pressure"
                    );
                    let err = Error::FatalScheduler(format!(
                        "{} stalled for {:?} sending {}",
                        self.from, self.stall_timeout, kind
                    ));
                    self.fatal.send_if_modified(|slot| {
                        if slot.is_none() {
                            *slot = Some(err);
                            true
                        } else {
                            false
                        }
                    });
                    Flow::Stop
                }
            },
        }
    }
}

async fn pump_source(
    link: Link,
    initial_frames: Vec<Frame>,
    mut source: mpsc::Receiver<Frame>,
    mut cancel: watch::Receiver<bool>,
) {
    for frame in initial_frames {
        if link.send(frame).await == Flow::Stop {
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            frame = source.recv() => match frame {
                Some(frame) => {
                    if link.send(frame).await == Flow::Stop {
                        return;
                    }
                }
                None => {
                    link.send(Frame::EndOfStream).await;
                    return;
                }
            },
        }
    }
}

enum Step {
    Cancelled,
    Input(Frame, FrameDirection),
    InputClosed,
    UpstreamClosed,
    Produced(Result<Vec<Frame>>),
}

struct StageRunner {
    processor: Arc<dyn FrameProcessor>,
    context: ProcessorContext,
    down_in: mpsc::Receiver<Frame>,
    up_in: Option<mpsc::Receiver<Frame>>,
    down_out: Link,
    /// None at the head of the chain
    up_out: Option<Link>,
    cancel: watch::Receiver<bool>,
    /// Set only on the last stage
    drain_timeout: Option<Duration>,
}

async fn recv_optional(rx: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl StageRunner {
    async fn run(mut self) {
        let name = self.processor.name();
        if let Err(e) = self.processor.on_start(&mut self.context).await {
            tracing::error!(stage = name, error = %e, "Processor on_start failed");
        }

        let mut cancel = self.cancel.clone();
        loop {
            let step = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Step::Cancelled,
                frame = recv_optional(&mut self.up_in) => match frame {
                    Some(frame) => Step::Input(frame, FrameDirection::Upstream),
                    None => Step::UpstreamClosed,
                },
                frame = self.down_in.recv() => match frame {
                    Some(frame) => Step::Input(frame, FrameDirection::Downstream),
                    None => Step::InputClosed,
                },
                produced = self.processor.produce(&mut self.context) => Step::Produced(produced),
            };

            match step {
                Step::Cancelled => {
                    if let Some(timeout) = self.drain_timeout {
                        self.drain(timeout).await;
                    }
                    break;
                }
                Step::UpstreamClosed => self.up_in = None,
                Step::InputClosed => break,
                Step::Input(frame, direction) => {
                    let end_of_stream =
                        direction == FrameDirection::Downstream && frame.is_end_of_stream();
                    let result = self.processor.process(frame, direction, &mut self.context).await;
                    let flow = self.emit(result, direction, end_of_stream).await;
                    if flow == Flow::Stop || end_of_stream {
                        break;
                    }
                }
                Step::Produced(result) => {
                    if self.emit(result, FrameDirection::Downstream, false).await == Flow::Stop {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.processor.on_stop(&mut self.context).await {
            tracing::error!(stage = name, error = %e, "Processor on_stop failed");
        }
        tracing::debug!(stage = name, session_id = %self.context.session_id, "Stage exiting");
    }

    /// Send a stage's output in `direction` and its pushed frames wherever
    /// they were pushed. A failed call becomes a stage-failure interruption
    /// travelling both ways.
    async fn emit(
        &mut self,
        result: Result<Vec<Frame>>,
        direction: FrameDirection,
        end_of_stream: bool,
    ) -> Flow {
        let mut frames = match result {
            Ok(frames) => frames,
            Err(err) => {
                let stage = self.processor.name();
                metrics::counter!("parley_stage_errors_total", "stage" => stage).increment(1);
                tracing::error!(
                    stage,
                    session_id = %self.context.session_id,
                    error = %err,
                    "Stage failed, interrupting current turn"
                );
                let interruption = Frame::interruption(None, InterruptionReason::StageFailure);
                self.context.push(direction.reverse(), interruption.clone());
                vec![interruption]
            }
        };
        if end_of_stream && !frames.iter().any(Frame::is_end_of_stream) {
            frames.push(Frame::EndOfStream);
        }

        let pushed = self.context.take_pushed();
        for frame in frames {
            if self.send(direction, frame).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        for (direction, frame) in pushed {
            if self.send(direction, frame).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn send(&self, direction: FrameDirection, frame: Frame) -> Flow {
        match direction {
            FrameDirection::Downstream => self.down_out.send(frame).await,
            FrameDirection::Upstream => match &self.up_out {
                // the predecessor may already have stopped
                Some(link) => {
                    link.send(frame).await;
                    Flow::Continue
                }
                None => {
                    tracing::trace!(
                        stage = self.processor.name(),
                        frame = frame.kind(),
                        "Upstream frame reached head of chain"
                    );
                    Flow::Continue
                }
            },
        }
    }

    /// Flush frames already queued for the last stage after cancellation
    async fn drain(&mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = 0usize;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.down_in.recv()).await {
                Ok(Some(frame)) => frame,
                _ => break,
            };
            let processed = tokio::time::timeout_at(
                deadline,
                self.processor
                    .process(frame, FrameDirection::Downstream, &mut self.context),
            )
            .await;
            let Ok(Ok(frames)) = processed else {
                break;
            };
            self.context.take_pushed();
            for frame in frames {
                self.down_out.send(frame).await;
            }
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(stage = self.processor.name(), drained, "Drained queued frames");
        }
    }
}
