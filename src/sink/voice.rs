use async_trait::async_trait;
use tokio::sync::watch;

use super::{SinkError, SinkState};
use crate::audio::CompressedFrame;

/// Progress of an outbound voice connection, as reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Pending,
    Established,
    Lost,
}

/// An outbound real-time voice transport.
#[async_trait]
pub trait VoiceConnection: Send {
    /// Begin connecting. Progress is published on the returned receiver;
    /// implementations publish `Lost` before they give up.
    fn start(&mut self) -> watch::Receiver<LinkSignal>;

    async fn send(&mut self, frame: CompressedFrame) -> Result<(), SinkError>;

    async fn shutdown(&mut self);
}

/// Forwards encoded frames to a voice connection once it is ready.
///
/// Frames delivered in any state other than `Ready` are dropped on the
/// floor, not queued and not reported as errors.
pub struct VoiceSink {
    conn: Box<dyn VoiceConnection>,
    state: SinkState,
    signals: Option<watch::Receiver<LinkSignal>>,
    forwarded: u64,
    dropped: u64,
}

impl VoiceSink {
    pub fn new(conn: Box<dyn VoiceConnection>) -> Self {
        Self {
            conn,
            state: SinkState::Idle,
            signals: None,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub fn state(&mut self) -> SinkState {
        self.refresh();
        self.state
    }

    /// `Idle → Connecting`. No effect in any other state.
    pub fn connect(&mut self) {
        if self.state != SinkState::Idle {
            return;
        }
        self.signals = Some(self.conn.start());
        self.state = SinkState::Connecting;
        self.refresh();
        log::info!("Voice sink connecting");
    }

    /// Wait until the connection settles and return the resulting state.
    pub async fn wait_ready(&mut self) -> SinkState {
        loop {
            self.refresh();
            if self.state != SinkState::Connecting {
                return self.state;
            }
            let Some(rx) = self.signals.as_mut() else {
                return self.state;
            };
            if rx.changed().await.is_err() {
                // Connection went away without reporting.
                self.state = SinkState::Disconnected;
                return self.state;
            }
        }
    }

    pub async fn deliver(&mut self, frame: CompressedFrame) -> Result<(), SinkError> {
        self.refresh();
        if self.state != SinkState::Ready {
            self.dropped += 1;
            log::debug!(
                "Voice sink {:?}, dropping frame ({} dropped)",
                self.state,
                self.dropped
            );
            return Ok(());
        }

        match self.conn.send(frame).await {
            Ok(()) => {
                self.forwarded += 1;
                Ok(())
            }
            Err(e) => {
                log::error!("Voice send failed after {} frames: {}", self.forwarded, e);
                self.state = SinkState::Disconnected;
                Err(e)
            }
        }
    }

    /// `→ Disconnected`, releasing the connection.
    pub async fn close(&mut self) {
        if self.state != SinkState::Idle {
            self.conn.shutdown().await;
        }
        self.state = SinkState::Disconnected;
        log::info!(
            "Voice sink closed: forwarded={}, dropped={}",
            self.forwarded,
            self.dropped
        );
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn refresh(&mut self) {
        let Some(rx) = &self.signals else {
            return;
        };
        let signal = *rx.borrow();
        self.state = match (self.state, signal) {
            (SinkState::Connecting, LinkSignal::Established) => {
                log::info!("Voice sink ready");
                SinkState::Ready
            }
            (SinkState::Connecting | SinkState::Ready, LinkSignal::Lost) => {
                log::warn!("Voice connection lost");
                SinkState::Disconnected
            }
            (state, _) => state,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::stream_voice;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn packet(tag: u8) -> CompressedFrame {
        CompressedFrame::new(Bytes::from(vec![tag; 40]))
    }

    #[tokio::test]
    async fn test_idle_drops_silently() {
        let (conn, _control, mut stream) = stream_voice(8);
        let mut sink = VoiceSink::new(Box::new(conn));

        for tag in 0..5 {
            sink.deliver(packet(tag)).await.unwrap();
        }
        assert_eq!(sink.state(), SinkState::Idle);
        assert_eq!(sink.forwarded(), 0);
        assert_eq!(sink.dropped(), 5);

        sink.close().await;
        assert!(timeout(Duration::from_millis(50), stream.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_only_ready_frames_reach_destination() {
        let (conn, control, mut stream) = stream_voice(8);
        let mut sink = VoiceSink::new(Box::new(conn));

        sink.connect();
        assert_eq!(sink.state(), SinkState::Connecting);
        sink.deliver(packet(0)).await.unwrap();
        sink.deliver(packet(1)).await.unwrap();

        control.establish();
        assert_eq!(sink.wait_ready().await, SinkState::Ready);
        for tag in 2..6 {
            sink.deliver(packet(tag)).await.unwrap();
        }

        for tag in 2..6 {
            let got = stream.next().await.unwrap();
            assert_eq!(got.as_bytes()[0], tag);
        }
        assert_eq!(sink.dropped(), 2);
        assert_eq!(sink.forwarded(), 4);
    }

    #[tokio::test]
    async fn test_lost_connection_disconnects() {
        let (conn, control, _stream) = stream_voice(8);
        let mut sink = VoiceSink::new(Box::new(conn));
        sink.connect();
        control.establish();
        assert_eq!(sink.wait_ready().await, SinkState::Ready);

        control.lose();
        assert_eq!(sink.state(), SinkState::Disconnected);
        sink.deliver(packet(9)).await.unwrap();
        assert_eq!(sink.dropped(), 1);

        // Disconnected is terminal.
        control.establish();
        assert_eq!(sink.state(), SinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_attempt_never_becomes_ready() {
        let (conn, control, _stream) = stream_voice(8);
        let mut sink = VoiceSink::new(Box::new(conn));
        sink.connect();
        control.lose();
        assert_eq!(sink.wait_ready().await, SinkState::Disconnected);
    }
}
