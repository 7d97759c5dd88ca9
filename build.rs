use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    pipeline: Pipeline,
    capture: Capture,
    transport: Transport,
    sink: Sink,
    voice: Voice,
}

#[derive(Deserialize)]
struct Pipeline {
    mode: String,
}

#[derive(Deserialize)]
struct Capture {
    kind: String,
    id: String,
    period_frames: usize,
}

#[derive(Deserialize)]
struct Transport {
    bind_ip: String,
    port: u16,
    queue_depth: usize,
}

#[derive(Deserialize)]
struct Sink {
    kind: String,
    playback_device: String,
}

#[derive(Deserialize)]
struct Voice {
    url: String,
    token: String,
    client_id: String,
    channel_id: String,
    bitrate: i32,
    ready_timeout_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=PIPELINE_MODE={}", config.pipeline.mode);

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_KIND={}", config.capture.kind);
    println!("cargo:rustc-env=CAPTURE_ID={}", config.capture.id);
    println!("cargo:rustc-env=CAPTURE_PERIOD_FRAMES={}", config.capture.period_frames);

    // 传输通道配置
    println!("cargo:rustc-env=TRANSPORT_BIND_IP={}", config.transport.bind_ip);
    println!("cargo:rustc-env=TRANSPORT_PORT={}", config.transport.port);
    println!("cargo:rustc-env=TRANSPORT_QUEUE_DEPTH={}", config.transport.queue_depth);

    // 输出端配置
    println!("cargo:rustc-env=SINK_KIND={}", config.sink.kind);
    println!("cargo:rustc-env=SINK_PLAYBACK_DEVICE={}", config.sink.playback_device);

    // 语音连接配置
    println!("cargo:rustc-env=VOICE_URL={}", config.voice.url);
    println!("cargo:rustc-env=VOICE_TOKEN={}", config.voice.token);
    println!("cargo:rustc-env=VOICE_CLIENT_ID={}", config.voice.client_id);
    println!("cargo:rustc-env=VOICE_CHANNEL_ID={}", config.voice.channel_id);
    println!("cargo:rustc-env=VOICE_BITRATE={}", config.voice.bitrate);
    println!("cargo:rustc-env=VOICE_READY_TIMEOUT_MS={}", config.voice.ready_timeout_ms);
}
