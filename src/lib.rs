//! tabcast - stream one application's audio as fixed 20 ms frames
//!
//! Capture and framing sit on one side of a local WebSocket transport; Opus
//! encoding and the sink (local monitor or voice connection) sit on the
//! other. The `tabcast` binary runs either side or both from `config.toml`.
//!
//! Embedding callers can skip the socket and read the encoded output as a
//! stream:
//!
//! ```no_run
//! use std::time::Duration;
//! use futures_util::StreamExt;
//! use tabcast::audio::{capture::PipeCapture, EncoderSession};
//! use tabcast::pipeline::{Downstream, Pipeline};
//! use tabcast::sink::{stream_voice, VoiceSink};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let capture = PipeCapture::open("/tmp/window.pcm", 480)?;
//! let (conn, control, mut packets) = stream_voice(16);
//! let downstream = Downstream::Voice {
//!     encoder: Box::new(EncoderSession::new(128_000)?),
//!     sink: VoiceSink::new(Box::new(conn)),
//! };
//!
//! control.establish();
//! let pipeline = Pipeline::local(Box::new(capture), 8, downstream, Duration::ZERO).await?;
//! while let Some(packet) = packets.next().await {
//!     // hand `packet` to the voice API
//!     # let _ = packet;
//! }
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod sink;
pub mod transport;
