use tabcast::audio::{self, AlsaPlayback, EncoderSession};
use tabcast::config::{Config, PipelineMode, SinkKind};
use tabcast::pipeline::{Downstream, Pipeline, PipelineError, Upstream};
use tabcast::sink::{MonitorSink, SinkError, VoiceSink, WsVoiceConnection};
use tabcast::transport::{TransportConsumer, TransportServer};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new()?;
    log::info!(
        "Starting {:?} pipeline: capture={:?} transport={} sink={:?}",
        config.mode,
        config.capture,
        config.transport_addr,
        config.sink
    );

    let mut pipeline = tokio::select! {
        started = start(&config) => started?,
        _ = signal::ctrl_c() => {
            println!("Received Ctrl+C during startup, exiting");
            return Ok(());
        }
    };

    // 运行直到 Ctrl+C 或者某个阶段出错
    let outcome = tokio::select! {
        result = pipeline.wait() => result,
        _ = signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    let stopped = pipeline.stop().await;
    outcome?;
    stopped?;
    Ok(())
}

/// Acquire resources in pipeline order (capture, transport, encoder, sink)
/// and start the configured mode.
async fn start(config: &Config) -> Result<Pipeline, PipelineError> {
    let ready_timeout = config.voice.ready_timeout;

    match config.mode {
        PipelineMode::Full => {
            let upstream = open_upstream(config).await?;
            let downstream = open_downstream(config)?;
            Pipeline::full(upstream, downstream, ready_timeout).await
        }
        PipelineMode::Capture => Pipeline::capture_only(open_upstream(config).await?).await,
        PipelineMode::Relay => {
            let consumer = TransportConsumer::connect(config.transport_addr).await?;
            let downstream = open_downstream(config)?;
            Pipeline::relay(Box::new(consumer), downstream, ready_timeout).await
        }
    }
}

async fn open_upstream(config: &Config) -> Result<Upstream, PipelineError> {
    let capture = audio::capture::open(&config.capture, config.capture_period_frames)?;
    let (server, channel) =
        TransportServer::bind(config.transport_addr, config.transport_queue_depth).await?;
    Ok(Upstream {
        capture,
        server,
        channel,
    })
}

fn open_downstream(config: &Config) -> Result<Downstream, PipelineError> {
    match config.sink {
        SinkKind::Monitor => {
            let output = AlsaPlayback::open(&config.playback_device)
                .map_err(|e| SinkError::Playback(format!("{:#}", e)))?;
            let sink = MonitorSink::start(Box::new(output), config.transport_queue_depth)?;
            Ok(Downstream::Monitor(sink))
        }
        SinkKind::Voice => {
            let encoder = Box::new(EncoderSession::new(config.voice.bitrate)?);
            let conn = WsVoiceConnection::new(config.voice.clone());
            Ok(Downstream::Voice {
                encoder,
                sink: VoiceSink::new(Box::new(conn)),
            })
        }
    }
}
