use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::audio::{CaptureTarget, SourceKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Which half (or both halves) of the process boundary this binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Full,
    Capture,
    Relay,
}

impl FromStr for PipelineMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "capture" => Ok(Self::Capture),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Monitor,
    Voice,
}

impl FromStr for SinkKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitor" => Ok(Self::Monitor),
            "voice" => Ok(Self::Voice),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub url: String,
    pub token: String,
    pub client_id: String,
    pub channel_id: String,
    /// Opus bitrate in bits/s
    pub bitrate: i32,
    /// How long pipeline start waits for the voice connection; zero disables the wait.
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: PipelineMode,

    // 采集源
    pub capture: CaptureTarget,
    pub capture_period_frames: usize,

    // 传输通道
    pub transport_addr: SocketAddr,
    pub transport_queue_depth: usize,

    // 输出端
    pub sink: SinkKind,
    pub playback_device: String,

    pub voice: VoiceConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, ConfigError> {
        let bind_ip: IpAddr = parse("transport.bind_ip", env!("TRANSPORT_BIND_IP"))?;
        let port: u16 = parse("transport.port", env!("TRANSPORT_PORT"))?;

        let queue_depth: usize = parse("transport.queue_depth", env!("TRANSPORT_QUEUE_DEPTH"))?;
        if queue_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "transport.queue_depth",
                value: "0".into(),
            });
        }

        let kind: SourceKind = parse("capture.kind", env!("CAPTURE_KIND"))?;
        let ready_timeout_ms: u64 = parse("voice.ready_timeout_ms", env!("VOICE_READY_TIMEOUT_MS"))?;

        Ok(Self {
            mode: parse("pipeline.mode", env!("PIPELINE_MODE"))?,
            capture: CaptureTarget {
                kind,
                id: env!("CAPTURE_ID").to_string(),
            },
            capture_period_frames: parse("capture.period_frames", env!("CAPTURE_PERIOD_FRAMES"))?,
            transport_addr: SocketAddr::new(bind_ip, port),
            transport_queue_depth: queue_depth,
            sink: parse("sink.kind", env!("SINK_KIND"))?,
            playback_device: env!("SINK_PLAYBACK_DEVICE").to_string(),
            voice: VoiceConfig {
                url: env!("VOICE_URL").to_string(),
                token: env!("VOICE_TOKEN").to_string(),
                client_id: env!("VOICE_CLIENT_ID").to_string(),
                channel_id: env!("VOICE_CHANNEL_ID").to_string(),
                bitrate: parse("voice.bitrate", env!("VOICE_BITRATE"))?,
                ready_timeout: Duration::from_millis(ready_timeout_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_time_config_parses() {
        let config = Config::new().expect("config.toml should be valid");
        assert!(config.transport_queue_depth > 0);
        assert!(config.capture_period_frames > 0);
    }

    #[test]
    fn test_enum_values() {
        assert_eq!("relay".parse::<PipelineMode>(), Ok(PipelineMode::Relay));
        assert_eq!("voice".parse::<SinkKind>(), Ok(SinkKind::Voice));
        assert!("speaker".parse::<SinkKind>().is_err());
    }

    #[test]
    fn test_parse_reports_key() {
        let err = parse::<u16>("transport.port", "99999").unwrap_err();
        assert_eq!(err.to_string(), "invalid value for transport.port: \"99999\"");
    }
}
