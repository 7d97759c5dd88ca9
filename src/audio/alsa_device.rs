//! Opening ALSA PCMs in the pipeline's fixed stream format.

use std::fmt;

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::format::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// What the hardware actually granted. Rate and channel count are only
/// requested, so they must be checked before use.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per period
    pub period_size: usize,
    /// Frames in the whole ring buffer
    pub buffer_size: usize,
}

impl AlsaParams {
    fn negotiated(pcm: &PCM) -> alsa::Result<Self> {
        let hwp = pcm.hw_params_current()?;
        Ok(Self {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        })
    }

    /// The pipeline never resamples, so anything but 48 kHz stereo is unusable.
    pub fn is_pipeline_format(&self) -> bool {
        self.sample_rate == SAMPLE_RATE && self.channels == CHANNELS
    }
}

impl fmt::Display for AlsaParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, period {} / buffer {} frames",
            self.sample_rate, self.channels, self.period_size, self.buffer_size
        )
    }
}

pub fn open_capture(device: &str, period_frames: usize) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("cannot open capture device '{}'", device))?;
    request_stream_format(&pcm, period_frames)
        .with_context(|| format!("capture device '{}' rejected S16LE interleaved", device))?;
    negotiated(device, "capture", pcm)
}

/// Playback periods are one frame long so each write maps to one period.
pub fn open_playback(device: &str) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Playback, false)
        .with_context(|| format!("cannot open playback device '{}'", device))?;
    request_stream_format(&pcm, FRAME_SAMPLES)
        .with_context(|| format!("playback device '{}' rejected S16LE interleaved", device))?;
    negotiated(device, "playback", pcm)
}

fn request_stream_format(pcm: &PCM, period_frames: usize) -> alsa::Result<()> {
    let hwp = HwParams::any(pcm)?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::S16LE)?;
    hwp.set_channels(CHANNELS)?;
    hwp.set_rate_near(SAMPLE_RATE, ValueOr::Nearest)?;
    hwp.set_period_size_near(period_frames.max(1) as Frames, ValueOr::Nearest)?;
    pcm.hw_params(&hwp)
}

fn negotiated(device: &str, role: &str, pcm: PCM) -> Result<(PCM, AlsaParams)> {
    let params = AlsaParams::negotiated(&pcm)
        .with_context(|| format!("cannot read back {} parameters for '{}'", role, device))?;
    log::info!("ALSA {} '{}': {}", role, device, params);
    Ok((pcm, params))
}
