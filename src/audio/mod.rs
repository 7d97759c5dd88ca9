//! audio - Capture, framing, Opus encoding, and monitor playback
//!
//! Uses ALSA for audio I/O and Opus for encoding. The stream format is fixed
//! at 48 kHz stereo S16LE in 20 ms frames.

mod alsa_device;
pub mod capture;
pub mod format;
mod framer;
mod opus_codec;
pub mod playback;

pub use capture::{CaptureError, CaptureSource, CaptureTarget, SourceKind};
pub use format::{AudioFrame, CompressedFrame, FRAME_BYTES};
pub use framer::Framer;
pub use opus_codec::{EncoderError, EncoderSession, FrameEncoder};
pub use playback::{AlsaPlayback, PcmOutput};
