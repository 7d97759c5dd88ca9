//! Terminal stages: local monitor playback and outbound voice connections.

mod monitor;
mod stream;
mod voice;
mod ws_voice;

pub use monitor::MonitorSink;
pub use stream::{EncodedStream, StreamVoiceConnection, VoiceControl, stream_voice};
pub use voice::{LinkSignal, VoiceConnection, VoiceSink};
pub use ws_voice::WsVoiceConnection;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    Connecting,
    Ready,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to start playback: {0}")]
    Playback(String),
    #[error("sink disconnected")]
    Disconnected,
}
