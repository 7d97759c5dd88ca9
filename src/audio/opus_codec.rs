//! Opus encoder session for the fixed 48 kHz stereo, 20 ms frame format.
//!
//! The session carries inter-frame prediction state, so frames must arrive
//! in capture order and a failed call leaves the session unusable.

use bytes::Bytes;
use thiserror::Error;

use super::format::{AudioFrame, CompressedFrame, CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// Upper bound for one Opus packet (RFC 6716 recommends 4000 bytes).
const MAX_PACKET_BYTES: usize = 4000;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to create opus encoder: {0}")]
    Init(#[source] opus::Error),
    #[error("opus encode failed: {0}")]
    Codec(#[source] opus::Error),
    #[error("encoder session is unusable after an earlier failure")]
    SessionPoisoned,
}

/// Turns frames into compressed packets, strictly in call order.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &AudioFrame) -> Result<CompressedFrame, EncoderError>;

    fn frames_encoded(&self) -> u64;
}

pub struct EncoderSession {
    encoder: opus::Encoder,
    pcm: Vec<i16>,
    packet: Vec<u8>,
    poisoned: bool,
    frames_encoded: u64,
}

impl EncoderSession {
    /// Create a session at `bitrate` bits/s.
    pub fn new(bitrate: i32) -> Result<Self, EncoderError> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)
                .map_err(EncoderError::Init)?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .map_err(EncoderError::Init)?;

        log::info!(
            "Opus encoder ready: rate={}, ch={}, frame={} samples, bitrate={}",
            SAMPLE_RATE,
            CHANNELS,
            FRAME_SAMPLES,
            bitrate,
        );

        Ok(Self {
            encoder,
            pcm: vec![0i16; FRAME_SAMPLES * CHANNELS as usize],
            packet: vec![0u8; MAX_PACKET_BYTES],
            poisoned: false,
            frames_encoded: 0,
        })
    }

}

impl FrameEncoder for EncoderSession {
    /// Encode the next frame in capture order.
    fn encode(&mut self, frame: &AudioFrame) -> Result<CompressedFrame, EncoderError> {
        if self.poisoned {
            return Err(EncoderError::SessionPoisoned);
        }

        frame.read_samples(&mut self.pcm);
        match self.encoder.encode(&self.pcm, &mut self.packet) {
            Ok(len) => {
                self.frames_encoded += 1;
                Ok(CompressedFrame::new(Bytes::copy_from_slice(
                    &self.packet[..len],
                )))
            }
            Err(e) => {
                self.poisoned = true;
                log::error!(
                    "Opus encode error after {} frames: {}",
                    self.frames_encoded,
                    e
                );
                Err(EncoderError::Codec(e))
            }
        }
    }

    fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(phase: usize) -> AudioFrame {
        let mut samples = Vec::with_capacity(FRAME_SAMPLES * 2);
        for i in 0..FRAME_SAMPLES {
            let t = (phase * FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
            let s = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            samples.push(s);
            samples.push(s);
        }
        AudioFrame::from_samples(&samples).unwrap()
    }

    #[test]
    fn test_each_packet_is_one_frame_long() {
        let mut session = EncoderSession::new(128_000).unwrap();
        let mut decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Stereo).unwrap();
        let mut pcm = vec![0i16; 5760 * 2];

        for phase in 0..5 {
            let packet = session.encode(&tone_frame(phase)).unwrap();
            assert!(!packet.is_empty());
            assert!(packet.len() <= MAX_PACKET_BYTES);

            let samples = decoder.decode(packet.as_bytes(), &mut pcm, false).unwrap();
            assert_eq!(samples, FRAME_SAMPLES);
        }
        assert_eq!(session.frames_encoded(), 5);
    }

    #[test]
    fn test_poisoned_session_refuses_frames() {
        let mut session = EncoderSession::new(64_000).unwrap();
        session.poisoned = true;
        assert!(matches!(
            session.encode(&tone_frame(0)),
            Err(EncoderError::SessionPoisoned)
        ));
        assert_eq!(session.frames_encoded(), 0);
    }

    #[test]
    fn test_codec_failure_poisons_session() {
        let mut session = EncoderSession::new(64_000).unwrap();
        session.encode(&tone_frame(0)).unwrap();

        // libopus refuses a zero-length output buffer.
        session.packet = Vec::new();
        assert!(matches!(
            session.encode(&tone_frame(1)),
            Err(EncoderError::Codec(_))
        ));

        session.packet = vec![0u8; MAX_PACKET_BYTES];
        assert!(matches!(
            session.encode(&tone_frame(2)),
            Err(EncoderError::SessionPoisoned)
        ));
        assert_eq!(session.frames_encoded(), 1);
    }

    #[test]
    fn test_invalid_bitrate_fails_init() {
        assert!(matches!(EncoderSession::new(-5), Err(EncoderError::Init(_))));
    }
}
