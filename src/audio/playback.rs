use alsa::pcm::PCM;
use anyhow::Result;

use super::alsa_device;
use super::format::{AudioFrame, CHANNELS, FRAME_SAMPLES};

/// A local destination for raw PCM frames. Runs on the playback thread.
pub trait PcmOutput: Send {
    fn write(&mut self, frame: &AudioFrame) -> Result<()>;
}

pub struct AlsaPlayback {
    pcm: PCM,
    samples: Vec<i16>,
}

impl AlsaPlayback {
    pub fn open(device: &str) -> Result<Self> {
        let (pcm, params) = alsa_device::open_playback(device)?;
        if !params.is_pipeline_format() {
            anyhow::bail!(
                "playback device '{}' negotiated {} Hz / {} ch",
                device,
                params.sample_rate,
                params.channels
            );
        }
        Ok(Self {
            pcm,
            samples: vec![0i16; FRAME_SAMPLES * CHANNELS as usize],
        })
    }
}

impl PcmOutput for AlsaPlayback {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        frame.read_samples(&mut self.samples);
        let io = self.pcm.io_i16()?;

        // Retry short writes and XRUNs without losing the frame.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < FRAME_SAMPLES {
            let offset = frames_written * CHANNELS as usize;
            match io.writei(&self.samples[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    self.pcm.prepare()?;

                    // 底层持续跟不上写入速度时，丢弃剩余部分防止死循环
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten samples.",
                            retry_count,
                            FRAME_SAMPLES - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
