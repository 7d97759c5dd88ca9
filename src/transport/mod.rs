//! Ordered frame transport across the capture/encode process boundary.
//!
//! The capture side owns a [`TransportChannel`] and pushes frames into a
//! bounded queue. A full queue blocks the sender; nothing is dropped. On the
//! wire every frame is one binary WebSocket message of exactly
//! `FRAME_BYTES` bytes with no header. Once the consumer goes away the
//! channel is closed for good.

mod consumer;
mod server;

pub use consumer::TransportConsumer;
pub use server::TransportServer;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::audio::AudioFrame;
use crate::audio::format::FrameLengthError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    Closed,
    #[error("malformed frame on the wire: {0}")]
    MalformedFrame(#[from] FrameLengthError),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Sending half of the transport. Sends complete in order, one at a time.
pub struct TransportChannel {
    tx: mpsc::Sender<AudioFrame>,
}

impl TransportChannel {
    fn new(queue_depth: usize) -> (Self, mpsc::Receiver<AudioFrame>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        (Self { tx }, rx)
    }

    /// In-process channel with the same queueing and close semantics as the
    /// WebSocket transport.
    pub fn local(queue_depth: usize) -> (Self, LocalConsumer) {
        let (channel, rx) = Self::new(queue_depth);
        (channel, LocalConsumer { rx })
    }

    /// Queue a frame, waiting while the queue is full.
    pub async fn send(&self, frame: AudioFrame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Like [`send`](Self::send), for the capture thread. Must not be called
    /// from inside the async runtime.
    pub fn blocking_send(&self, frame: AudioFrame) -> Result<(), TransportError> {
        self.tx.blocking_send(frame).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of a transport as seen by the encode stage.
#[async_trait]
pub trait FrameInbox: Send {
    /// Next frame in send order. `Ok(None)` means the producer finished.
    async fn recv(&mut self) -> Result<Option<AudioFrame>, TransportError>;
}

/// Consumer end of [`TransportChannel::local`]. Dropping it closes the channel.
pub struct LocalConsumer {
    rx: mpsc::Receiver<AudioFrame>,
}

impl LocalConsumer {
    pub fn disconnect(self) {}
}

#[async_trait]
impl FrameInbox for LocalConsumer {
    async fn recv(&mut self) -> Result<Option<AudioFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_BYTES;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(Bytes::from(vec![tag; FRAME_BYTES])).unwrap()
    }

    #[tokio::test]
    async fn test_local_preserves_order() {
        let (channel, mut consumer) = TransportChannel::local(4);
        tokio::spawn(async move {
            for tag in 0..20u8 {
                channel.send(frame(tag)).await.unwrap();
            }
        });

        for tag in 0..20u8 {
            let got = consumer.recv().await.unwrap().unwrap();
            assert_eq!(got.as_bytes()[0], tag);
        }
        assert!(consumer.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_drained() {
        let (channel, mut consumer) = TransportChannel::local(2);
        channel.send(frame(0)).await.unwrap();
        channel.send(frame(1)).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), channel.send(frame(2))).await;
        assert!(blocked.is_err(), "send should wait while the queue is full");

        let sender = tokio::spawn(async move {
            channel.send(frame(2)).await.unwrap();
            channel
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        assert_eq!(consumer.recv().await.unwrap().unwrap().as_bytes()[0], 0);
        let _channel = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();

        assert_eq!(consumer.recv().await.unwrap().unwrap().as_bytes()[0], 1);
        assert_eq!(consumer.recv().await.unwrap().unwrap().as_bytes()[0], 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let (channel, mut consumer) = TransportChannel::local(4);
        channel.send(frame(0)).await.unwrap();
        assert!(consumer.recv().await.unwrap().is_some());

        consumer.disconnect();
        assert!(channel.is_closed());
        for tag in 1..4 {
            assert!(matches!(
                channel.send(frame(tag)).await,
                Err(TransportError::Closed)
            ));
        }
    }

    #[test]
    fn test_blocking_send_from_thread() {
        let (channel, mut consumer) = TransportChannel::local(1);
        let handle = std::thread::spawn(move || {
            for tag in 0..3u8 {
                channel.blocking_send(frame(tag)).unwrap();
            }
        });

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            for tag in 0..3u8 {
                assert_eq!(consumer.recv().await.unwrap().unwrap().as_bytes()[0], tag);
            }
        });
        handle.join().unwrap();
    }
}
