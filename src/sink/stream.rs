//! In-process voice connection exposing the encoded output as a `Stream`.
//!
//! For embedding callers whose voice API pulls audio from a readable stream
//! and reports connection state through callbacks: the stream end is handed to
//! that API and its callbacks drive [`VoiceControl`].

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::{mpsc, watch};

use super::SinkError;
use super::voice::{LinkSignal, VoiceConnection};
use crate::audio::CompressedFrame;

pub fn stream_voice(
    queue_depth: usize,
) -> (StreamVoiceConnection, VoiceControl, EncodedStream) {
    let (tx, rx) = mpsc::channel(queue_depth);
    let (signal_tx, signal_rx) = watch::channel(LinkSignal::Pending);
    (
        StreamVoiceConnection {
            tx: Some(tx),
            signals: signal_rx,
        },
        VoiceControl { signal: signal_tx },
        EncodedStream { rx },
    )
}

pub struct StreamVoiceConnection {
    tx: Option<mpsc::Sender<CompressedFrame>>,
    signals: watch::Receiver<LinkSignal>,
}

#[async_trait]
impl VoiceConnection for StreamVoiceConnection {
    fn start(&mut self) -> watch::Receiver<LinkSignal> {
        self.signals.clone()
    }

    async fn send(&mut self, frame: CompressedFrame) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Disconnected)?;
        tx.send(frame).await.map_err(|_| SinkError::Disconnected)
    }

    async fn shutdown(&mut self) {
        // Ends the stream for the reader.
        self.tx.take();
    }
}

/// Connection-state callbacks from the external voice API.
pub struct VoiceControl {
    signal: watch::Sender<LinkSignal>,
}

impl VoiceControl {
    pub fn establish(&self) {
        let _ = self.signal.send(LinkSignal::Established);
    }

    pub fn lose(&self) {
        let _ = self.signal.send(LinkSignal::Lost);
    }
}

impl Drop for VoiceControl {
    fn drop(&mut self) {
        let _ = self.signal.send(LinkSignal::Lost);
    }
}

/// Readable stream of 20 ms Opus frames, in encode order.
pub struct EncodedStream {
    rx: mpsc::Receiver<CompressedFrame>,
}

impl Stream for EncodedStream {
    type Item = CompressedFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
