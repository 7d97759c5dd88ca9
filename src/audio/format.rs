//! Fixed stream format and the frame types that flow through the pipeline.
//!
//! Everything downstream of capture assumes 48 kHz interleaved stereo S16LE in
//! 20 ms frames. These are not runtime-configurable.

use bytes::Bytes;
use thiserror::Error;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const FRAME_DURATION_MS: u32 = 20;

/// Samples per channel in one frame (960).
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

/// Raw size of one frame in bytes (3840).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS as usize * BYTES_PER_SAMPLE;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("audio frame must be {FRAME_BYTES} bytes, got {0}")]
pub struct FrameLengthError(pub usize);

/// One 20 ms block of interleaved S16LE PCM. The length is always `FRAME_BYTES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    pub fn new(data: Bytes) -> Result<Self, FrameLengthError> {
        if data.len() != FRAME_BYTES {
            return Err(FrameLengthError(data.len()));
        }
        Ok(Self(data))
    }

    pub fn from_samples(samples: &[i16]) -> Result<Self, FrameLengthError> {
        let mut data = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self::new(Bytes::from(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Decode into interleaved i16 samples, writing into `out`.
    ///
    /// `out` must hold `FRAME_SAMPLES * CHANNELS` samples.
    pub fn read_samples(&self, out: &mut [i16]) {
        for (dst, src) in out.iter_mut().zip(self.0.chunks_exact(BYTES_PER_SAMPLE)) {
            *dst = i16::from_le_bytes([src[0], src[1]]);
        }
    }

    pub fn samples(&self) -> Vec<i16> {
        let mut out = vec![0i16; FRAME_SAMPLES * CHANNELS as usize];
        self.read_samples(&mut out);
        out
    }
}

/// One Opus packet covering exactly one `AudioFrame` worth of audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame(Bytes);

impl CompressedFrame {
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
