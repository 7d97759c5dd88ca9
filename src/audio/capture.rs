//! Capture sources: where window audio enters the pipeline.
//!
//! Window/tab selection happens outside this crate. By the time audio gets
//! here it is either an ALSA PCM (typically a PipeWire/Pulse node routed from
//! the application) or a raw PCM byte stream written by a capture helper.

use std::fs::File;
use std::io::{self, Read};
use std::str::FromStr;

use alsa::pcm::PCM;
use thiserror::Error;

use super::alsa_device::{self, AlsaParams};
use super::format::{BYTES_PER_SAMPLE, CHANNELS, SAMPLE_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// ALSA PCM device name
    Device,
    /// Path to a FIFO or file of raw S16LE 48 kHz stereo, `-` for stdin
    Pipe,
}

impl FromStr for SourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" => Ok(Self::Device),
            "pipe" => Ok(Self::Pipe),
            _ => Err(()),
        }
    }
}

/// Identifies the audio source to capture from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub kind: SourceKind,
    pub id: String,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source {id:?} unavailable: {reason}")]
    Unavailable { id: String, reason: String },
    #[error(
        "capture source {id:?} negotiated {sample_rate} Hz / {channels} ch, need {SAMPLE_RATE} Hz / {CHANNELS} ch"
    )]
    UnsupportedFormat {
        id: String,
        sample_rate: u32,
        channels: u32,
    },
    #[error("capture read failed: {0}")]
    Read(String),
}

/// An opened capture handle yielding raw interleaved S16LE bytes.
pub trait CaptureSource: Send {
    /// Preferred read size in bytes.
    fn chunk_size(&self) -> usize;

    /// Read the next chunk into `buf`. `Ok(0)` means the source has ended.
    ///
    /// Chunk sizes are arbitrary and need not align to frames or samples.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError>;
}

/// Open the configured source. Failures here are not retried.
pub fn open(
    target: &CaptureTarget,
    period_frames: usize,
) -> Result<Box<dyn CaptureSource>, CaptureError> {
    match target.kind {
        SourceKind::Device => Ok(Box::new(AlsaCapture::open(&target.id, period_frames)?)),
        SourceKind::Pipe => Ok(Box::new(PipeCapture::open(&target.id, period_frames)?)),
    }
}

// ======================== ALSA ========================

pub struct AlsaCapture {
    pcm: PCM,
    samples: Vec<i16>,
}

impl AlsaCapture {
    pub fn open(device: &str, period_frames: usize) -> Result<Self, CaptureError> {
        let (pcm, params) =
            alsa_device::open_capture(device, period_frames).map_err(|e| {
                CaptureError::Unavailable {
                    id: device.to_string(),
                    reason: format!("{:#}", e),
                }
            })?;

        if !params.is_pipeline_format() {
            return Err(CaptureError::UnsupportedFormat {
                id: device.to_string(),
                sample_rate: params.sample_rate,
                channels: params.channels,
            });
        }

        Ok(Self {
            pcm,
            samples: vec![0i16; params.period_size * CHANNELS as usize],
        })
    }
}

impl CaptureSource for AlsaCapture {
    fn chunk_size(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let io = self
            .pcm
            .io_i16()
            .map_err(|e| CaptureError::Read(e.to_string()))?;

        let max_samples = (buf.len() / BYTES_PER_SAMPLE).min(self.samples.len());
        let max_samples = max_samples - max_samples % CHANNELS as usize;

        loop {
            match io.readi(&mut self.samples[..max_samples]) {
                Ok(frames) => {
                    let n = frames * CHANNELS as usize;
                    for (dst, s) in buf
                        .chunks_exact_mut(BYTES_PER_SAMPLE)
                        .zip(&self.samples[..n])
                    {
                        dst.copy_from_slice(&s.to_le_bytes());
                    }
                    return Ok(n * BYTES_PER_SAMPLE);
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    self.pcm
                        .prepare()
                        .map_err(|e2| CaptureError::Read(format!("recovery failed: {}", e2)))?;
                }
            }
        }
    }
}

// ======================== Pipe ========================

/// Raw PCM from any byte stream: a FIFO fed by a window-capture helper, a
/// file, or stdin.
pub struct PipeCapture {
    reader: Box<dyn Read + Send>,
    chunk_size: usize,
}

impl PipeCapture {
    pub fn open(path: &str, period_frames: usize) -> Result<Self, CaptureError> {
        let reader: Box<dyn Read + Send> = if path == "-" {
            Box::new(io::stdin())
        } else {
            let file = File::open(path).map_err(|e| CaptureError::Unavailable {
                id: path.to_string(),
                reason: e.to_string(),
            })?;
            Box::new(file)
        };
        log::info!("Pipe capture: source={}", path);
        Ok(Self::from_reader(reader, period_frames))
    }

    pub fn from_reader(reader: Box<dyn Read + Send>, period_frames: usize) -> Self {
        Self {
            reader,
            chunk_size: period_frames.max(1) * CHANNELS as usize * BYTES_PER_SAMPLE,
        }
    }
}

impl CaptureSource for PipeCapture {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        loop {
            match self.reader.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CaptureError::Read(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("pipe".parse::<SourceKind>(), Ok(SourceKind::Pipe));
        assert!("window".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_missing_pipe_is_unavailable() {
        let target = CaptureTarget {
            kind: SourceKind::Pipe,
            id: "/nonexistent/tabcast/capture.pcm".into(),
        };
        match open(&target, 480) {
            Err(CaptureError::Unavailable { id, .. }) => assert_eq!(id, target.id),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_pipe_reads_until_eof() {
        let mut capture = PipeCapture::from_reader(Box::new(Cursor::new(vec![9u8; 5000])), 480);
        assert_eq!(capture.chunk_size(), 1920);

        let mut buf = vec![0u8; capture.chunk_size()];
        let mut total = 0;
        loop {
            let n = capture.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 5000);
    }

    #[test]
    fn test_format_check() {
        let params = |sample_rate, channels| AlsaParams {
            sample_rate,
            channels,
            period_size: 480,
            buffer_size: 1920,
        };
        assert!(params(48_000, 2).is_pipeline_format());
        assert!(!params(44_100, 2).is_pipeline_format());
        assert!(!params(48_000, 1).is_pipeline_format());
    }
}
