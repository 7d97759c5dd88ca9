//! The capture → transport → encode → sink pipeline.
//!
//! Capture and framing run on a dedicated OS thread (NOT a tokio task) so the
//! capture path is never scheduled behind network or codec work. Everything
//! after the transport runs as one tokio task that handles a frame at a time.
//!
//! Resources are acquired in the order capture handle, transport, encoder,
//! sink, and released in reverse on [`Pipeline::stop`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task;

use crate::audio::{
    AudioFrame, CaptureError, CaptureSource, EncoderError, FrameEncoder, Framer,
};
use crate::sink::{MonitorSink, SinkError, SinkState, VoiceSink};
use crate::transport::{
    FrameInbox, TransportChannel, TransportConsumer, TransportError, TransportServer,
};

/// How long `stop` waits for the capture thread before detaching it.
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("voice connection failed before becoming ready")]
    VoiceNotReady,
    #[error("sink disconnected")]
    SinkDisconnected,
    #[error("{0} stage panicked")]
    StagePanicked(&'static str),
}

/// Capture side of the boundary: an opened source plus a bound transport.
pub struct Upstream {
    pub capture: Box<dyn CaptureSource>,
    pub server: TransportServer,
    pub channel: TransportChannel,
}

/// What happens to frames after the transport.
pub enum Downstream {
    /// Raw frames straight to local playback.
    Monitor(MonitorSink),
    /// Frames encoded to Opus and sent to a voice connection.
    Voice {
        encoder: Box<dyn FrameEncoder>,
        sink: VoiceSink,
    },
}

impl Downstream {
    /// Bring the sink up. A voice sink is given up to `ready_timeout` to
    /// become ready; past that, frames are dropped until it is.
    async fn prepare(&mut self, ready_timeout: Duration) -> Result<(), PipelineError> {
        let Downstream::Voice { sink, .. } = self else {
            return Ok(());
        };

        sink.connect();
        if ready_timeout.is_zero() {
            return Ok(());
        }
        match tokio::time::timeout(ready_timeout, sink.wait_ready()).await {
            Ok(SinkState::Ready) => Ok(()),
            Ok(_) => Err(PipelineError::VoiceNotReady),
            Err(_) => {
                log::warn!(
                    "Voice connection not ready after {:?}; dropping frames until it is",
                    ready_timeout
                );
                Ok(())
            }
        }
    }

    async fn process(&mut self, frame: AudioFrame) -> Result<(), PipelineError> {
        match self {
            Downstream::Monitor(sink) => sink
                .deliver(frame)
                .await
                .map_err(|_| PipelineError::SinkDisconnected)?,
            Downstream::Voice { encoder, sink } => {
                let packet = encoder.encode(&frame)?;
                // A failed send and a lost-signal are the same terminal condition.
                sink.deliver(packet)
                    .await
                    .map_err(|_| PipelineError::SinkDisconnected)?;
                if sink.state() == SinkState::Disconnected {
                    return Err(PipelineError::SinkDisconnected);
                }
            }
        }
        Ok(())
    }

    /// Sink first, then the encoder session.
    async fn release(self) {
        match self {
            Downstream::Monitor(mut sink) => sink.close().await,
            Downstream::Voice { encoder, mut sink } => {
                sink.close().await;
                log::info!("Encoder session released after {} frames", encoder.frames_encoded());
                drop(encoder);
            }
        }
    }
}

// ======================== Capture stage ========================

struct CaptureStage {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    done: Option<oneshot::Receiver<Result<u64, PipelineError>>>,
}

impl CaptureStage {
    fn spawn(
        capture: Box<dyn CaptureSource>,
        channel: TransportChannel,
    ) -> Result<Self, PipelineError> {
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = oneshot::channel();

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    let result = capture_loop(capture, channel, &running);
                    let _ = done_tx.send(result);
                })
                .map_err(|e| CaptureError::Unavailable {
                    id: "capture thread".into(),
                    reason: e.to_string(),
                })?
        };

        Ok(Self {
            running,
            handle: Some(handle),
            done: Some(done_rx),
        })
    }

    async fn finished(&mut self) -> Result<u64, PipelineError> {
        let result = match self.done.as_mut() {
            Some(done) => done.await,
            None => return Ok(0),
        };
        self.done = None;
        result.unwrap_or(Err(PipelineError::StagePanicked("capture")))
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the thread to exit, which releases the capture handle.
    async fn join(mut self) -> Result<(), PipelineError> {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + CAPTURE_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Capture thread still blocked in read; detaching it");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if handle.join().is_err() {
            return Err(PipelineError::StagePanicked("capture"));
        }

        match self.done.take().map(|mut rx| rx.try_recv()) {
            // The transport is already gone by the time capture is joined.
            Some(Ok(Err(PipelineError::Transport(TransportError::Closed)))) => Ok(()),
            Some(Ok(result)) => result.map(|_| ()),
            _ => Ok(()),
        }
    }
}

fn capture_loop(
    mut capture: Box<dyn CaptureSource>,
    channel: TransportChannel,
    running: &AtomicBool,
) -> Result<u64, PipelineError> {
    let mut framer = Framer::new();
    let mut buf = vec![0u8; capture.chunk_size()];
    let mut sent: u64 = 0;

    log::info!("Capture started: chunk={} bytes", buf.len());

    while running.load(Ordering::Relaxed) {
        let n = capture.read(&mut buf)?;
        if n == 0 {
            log::info!("Capture source ended");
            break;
        }
        for frame in framer.push(&buf[..n]) {
            channel.blocking_send(frame)?;
            sent += 1;
        }
    }

    // A trailing partial frame is never sent.
    framer.reset();
    log::info!("Capture stopped after {} frames", sent);
    Ok(sent)
}

// ======================== Downstream stage ========================

type Parts = (Box<dyn FrameInbox>, Downstream);

struct DownstreamStage {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<task::JoinHandle<(Parts, Result<u64, PipelineError>)>>,
    parts: Option<Parts>,
}

impl DownstreamStage {
    fn spawn(inbox: Box<dyn FrameInbox>, downstream: Downstream) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(downstream_loop(inbox, downstream, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
            parts: None,
        }
    }

    async fn finished(&mut self) -> Result<u64, PipelineError> {
        let joined = match self.task.as_mut() {
            Some(task) => task.await,
            None => return Ok(0),
        };
        self.task = None;
        match joined {
            Ok((parts, result)) => {
                self.parts = Some(parts);
                result
            }
            Err(_) => Err(PipelineError::StagePanicked("encode")),
        }
    }

    /// Stop the loop, then release the sink, encoder, and transport consumer
    /// in that order. Reports the loop's result if `finished` never did.
    async fn stop(mut self) -> Result<(), PipelineError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let result = if self.task.is_some() {
            self.finished().await.map(|_| ())
        } else {
            Ok(())
        };

        if let Some((inbox, downstream)) = self.parts.take() {
            downstream.release().await;
            drop(inbox);
        }
        result
    }
}

async fn downstream_loop(
    mut inbox: Box<dyn FrameInbox>,
    mut downstream: Downstream,
    mut stop: oneshot::Receiver<()>,
) -> (Parts, Result<u64, PipelineError>) {
    let mut frames: u64 = 0;
    let result = loop {
        let next = tokio::select! {
            _ = &mut stop => break Ok(frames),
            next = inbox.recv() => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Transport ended after {} frames", frames);
                break Ok(frames);
            }
            Err(e) => break Err(e.into()),
        };
        // A stalled sink must not keep stop from completing.
        let processed = tokio::select! {
            _ = &mut stop => {
                log::info!("Stop requested with a frame in flight, dropping it");
                break Ok(frames);
            }
            processed = downstream.process(frame) => processed,
        };
        if let Err(e) = processed {
            log::error!("Downstream failed after {} frames: {}", frames, e);
            break Err(e);
        }
        frames += 1;
    };
    ((inbox, downstream), result)
}

// ======================== Pipeline ========================

pub struct Pipeline {
    capture: Option<CaptureStage>,
    server: Option<TransportServer>,
    downstream: Option<DownstreamStage>,
}

/// Spawn the downstream stage, then the capture thread. If capture cannot
/// start, the already running downstream stage is stopped and released.
async fn launch(
    inbox: Box<dyn FrameInbox>,
    downstream: Downstream,
    capture: Box<dyn CaptureSource>,
    channel: TransportChannel,
) -> Result<(DownstreamStage, CaptureStage), PipelineError> {
    let stage = DownstreamStage::spawn(inbox, downstream);
    match CaptureStage::spawn(capture, channel) {
        Ok(capture) => Ok((stage, capture)),
        Err(e) => {
            if let Err(release_err) = stage.stop().await {
                log::warn!("Release after failed start: {}", release_err);
            }
            Err(e)
        }
    }
}

impl Pipeline {
    /// Both halves in one process, joined over the loopback transport.
    pub async fn full(
        upstream: Upstream,
        mut downstream: Downstream,
        ready_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let Upstream {
            capture,
            mut server,
            channel,
        } = upstream;

        let attached = async {
            let consumer = TransportConsumer::connect(server.local_addr()).await?;
            server.wait_for_consumer().await?;
            downstream.prepare(ready_timeout).await?;
            Ok::<_, PipelineError>(consumer)
        }
        .await;
        let consumer = match attached {
            Ok(consumer) => consumer,
            Err(e) => {
                downstream.release().await;
                return Err(e);
            }
        };

        let (downstream, capture) =
            launch(Box::new(consumer), downstream, capture, channel).await?;
        Ok(Self {
            capture: Some(capture),
            server: Some(server),
            downstream: Some(downstream),
        })
    }

    /// Capture side only. Streaming starts once an external consumer attaches.
    pub async fn capture_only(upstream: Upstream) -> Result<Self, PipelineError> {
        let Upstream {
            capture,
            mut server,
            channel,
        } = upstream;

        log::info!("Waiting for a transport consumer on {}", server.local_addr());
        let peer = server.wait_for_consumer().await?;
        log::info!("Streaming to {}", peer);

        let capture = CaptureStage::spawn(capture, channel)?;
        Ok(Self {
            capture: Some(capture),
            server: Some(server),
            downstream: None,
        })
    }

    /// Encode side only, fed by an already connected transport.
    pub async fn relay(
        inbox: Box<dyn FrameInbox>,
        mut downstream: Downstream,
        ready_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        if let Err(e) = downstream.prepare(ready_timeout).await {
            downstream.release().await;
            return Err(e);
        }
        Ok(Self {
            capture: None,
            server: None,
            downstream: Some(DownstreamStage::spawn(inbox, downstream)),
        })
    }

    /// Both halves in one process over an in-memory transport. For callers
    /// embedding the pipeline, typically with a [`stream_voice`] sink.
    ///
    /// [`stream_voice`]: crate::sink::stream_voice
    pub async fn local(
        capture: Box<dyn CaptureSource>,
        queue_depth: usize,
        mut downstream: Downstream,
        ready_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        if let Err(e) = downstream.prepare(ready_timeout).await {
            downstream.release().await;
            return Err(e);
        }

        let (channel, consumer) = TransportChannel::local(queue_depth);
        let (downstream, capture) = launch(Box::new(consumer), downstream, capture, channel).await?;
        Ok(Self {
            capture: Some(capture),
            server: None,
            downstream: Some(downstream),
        })
    }

    /// Run until the pipeline ends on its own: the source is exhausted and
    /// everything downstream has drained, or a stage fails.
    pub async fn wait(&mut self) -> Result<(), PipelineError> {
        let Self {
            capture,
            downstream,
            ..
        } = self;

        loop {
            let capture_live = capture.as_ref().is_some_and(|c| c.done.is_some());
            let downstream_live = downstream.as_ref().is_some_and(|d| d.task.is_some());
            if !capture_live && !downstream_live {
                return Ok(());
            }

            tokio::select! {
                result = async {
                    match capture.as_mut() {
                        Some(stage) => stage.finished().await,
                        None => Ok(0),
                    }
                }, if capture_live => {
                    result?;
                }
                result = async {
                    match downstream.as_mut() {
                        Some(stage) => stage.finished().await,
                        None => Ok(0),
                    }
                }, if downstream_live => {
                    result?;
                    return Ok(());
                }
            }
        }
    }

    /// Release everything in reverse acquisition order: sink, encoder,
    /// transport, capture handle. Every step runs even if an earlier one
    /// failed; the first failure is returned.
    pub async fn stop(mut self) -> Result<(), PipelineError> {
        let mut first_err: Option<PipelineError> = None;
        let mut record = |r: Result<(), PipelineError>| {
            if let Err(e) = r {
                log::error!("Pipeline release error: {}", e);
                first_err.get_or_insert(e);
            }
        };

        if let Some(capture) = &self.capture {
            capture.request_stop();
        }
        if let Some(downstream) = self.downstream.take() {
            record(downstream.stop().await);
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(capture) = self.capture.take() {
            record(capture.join().await);
        }

        log::info!("Pipeline stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
