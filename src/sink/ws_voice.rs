use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;
use uuid::Uuid;

use super::SinkError;
use super::voice::{LinkSignal, VoiceConnection};
use crate::audio::CompressedFrame;
use crate::audio::format::{CHANNELS, FRAME_DURATION_MS, SAMPLE_RATE};
use crate::config::VoiceConfig;

/// Frames in flight between the sink and the socket writer.
const OUTBOUND_DEPTH: usize = 16;

// 音频参数结构体
#[derive(Serialize)]
struct AudioParams {
    format: &'static str,
    sample_rate: u32,
    channels: u32,
    frame_duration: u32,
}

// Hello Message，用于初始化连接
#[derive(Serialize)]
struct HelloMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    version: u8,
    transport: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<&'a str>,
    audio_params: AudioParams,
}

#[derive(Deserialize, Debug)]
struct ServerMessage {
    #[serde(rename = "type")]
    msg_type: String,
    session_id: Option<String>,
}

/// Voice gateway over WebSocket. The gateway's `hello` reply marks the
/// connection as established; every compressed frame is one binary message.
pub struct WsVoiceConnection {
    config: VoiceConfig,
    tx: Option<mpsc::Sender<CompressedFrame>>,
    task: Option<JoinHandle<()>>,
}

impl WsVoiceConnection {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl VoiceConnection for WsVoiceConnection {
    fn start(&mut self) -> watch::Receiver<LinkSignal> {
        let (signal_tx, signal_rx) = watch::channel(LinkSignal::Pending);
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let config = self.config.clone();

        self.tx = Some(tx);
        self.task = Some(tokio::spawn(async move {
            // 不做重连：断开即终止
            if let Err(e) = connect_and_loop(&config, rx, &signal_tx).await {
                log::error!("Voice connection error: {:#}", e);
            }
            let _ = signal_tx.send(LinkSignal::Lost);
        }));
        signal_rx
    }

    async fn send(&mut self, frame: CompressedFrame) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Disconnected)?;
        tx.send(frame).await.map_err(|_| SinkError::Disconnected)
    }

    async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                log::warn!("Voice connection did not close in time, aborting");
                task.abort();
            }
        }
    }
}

async fn connect_and_loop(
    config: &VoiceConfig,
    mut rx: mpsc::Receiver<CompressedFrame>,
    signal: &watch::Sender<LinkSignal>,
) -> anyhow::Result<()> {
    let url = Url::parse(&config.url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("voice url has no host: {}", config.url))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let client_id = if config.client_id == "unknown-client" {
        Uuid::new_v4().to_string()
    } else {
        config.client_id.clone()
    };

    let request = tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(config.url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", config.token))
        .header("Client-Id", &client_id)
        .header("Protocol-Version", "1")
        .body(())?;

    log::info!("Connecting to voice gateway {}...", config.url);
    let (ws_stream, _) = connect_async(request).await?;
    let (mut write, mut read) = ws_stream.split();

    let hello = HelloMessage {
        msg_type: "hello",
        version: 1,
        transport: "websocket",
        channel_id: (!config.channel_id.is_empty()).then_some(config.channel_id.as_str()),
        audio_params: AudioParams {
            format: "opus",
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: FRAME_DURATION_MS,
        },
    };
    let hello_json = serde_json::to_string(&hello)?;
    log::debug!("Sending hello: {}", hello_json);
    write.send(Message::Text(hello_json.into())).await?;

    let mut sent: u64 = 0;
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) if msg.msg_type == "hello" => {
                                log::info!(
                                    "Voice gateway hello, session_id={}",
                                    msg.session_id.as_deref().unwrap_or("-")
                                );
                                let _ = signal.send(LinkSignal::Established);
                            }
                            Ok(msg) => log::debug!("Unhandled voice message type: {}", msg.msg_type),
                            // 可能不是JSON，忽略
                            Err(_) => log::debug!("Ignoring voice text: {}", text.as_str()),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        anyhow::bail!("voice gateway closed connection: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => anyhow::bail!("voice gateway connection closed"),
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        write.send(Message::Binary(frame.into_bytes())).await?;
                        sent += 1;
                    }
                    None => {
                        log::info!("Voice connection shutting down after {} frames", sent);
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkState, VoiceSink};
    use bytes::Bytes;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn voice_config(url: String) -> VoiceConfig {
        VoiceConfig {
            url,
            token: "secret".into(),
            client_id: "client-1".into(),
            channel_id: "chan-42".into(),
            bitrate: 64_000,
            ready_timeout: Duration::from_secs(1),
        }
    }

    /// Gateway that checks the handshake, replies hello, then records the
    /// first `expect` binary messages.
    async fn gateway(listener: TcpListener, expect: usize) -> (Option<String>, Value, Vec<u8>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut auth = None;
        let capture_auth = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            auth = req
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture_auth)
            .await
            .unwrap();

        let hello = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str::<Value>(text.as_str()).unwrap(),
            other => panic!("expected hello, got {:?}", other),
        };
        ws.send(Message::Text(r#"{"type":"hello","session_id":"s1"}"#.into()))
            .await
            .unwrap();

        let mut tags = Vec::new();
        while tags.len() < expect {
            if let Message::Binary(data) = ws.next().await.unwrap().unwrap() {
                tags.push(data[0]);
            }
        }
        (auth, hello, tags)
    }

    #[tokio::test]
    async fn test_hello_then_frames_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());
        let server = tokio::spawn(gateway(listener, 3));

        let mut sink = VoiceSink::new(Box::new(WsVoiceConnection::new(voice_config(url))));
        sink.connect();
        assert_eq!(sink.wait_ready().await, SinkState::Ready);

        for tag in 1..=3u8 {
            sink.deliver(CompressedFrame::new(Bytes::from(vec![tag; 20])))
                .await
                .unwrap();
        }

        let (auth, hello, tags) = server.await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["channel_id"], "chan-42");
        assert_eq!(hello["audio_params"]["format"], "opus");
        assert_eq!(hello["audio_params"]["sample_rate"], 48000);
        assert_eq!(hello["audio_params"]["channels"], 2);
        assert_eq!(hello["audio_params"]["frame_duration"], 20);
        assert_eq!(tags, vec![1, 2, 3]);

        sink.close().await;
        assert_eq!(sink.state(), SinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());
        drop(listener);

        let mut sink = VoiceSink::new(Box::new(WsVoiceConnection::new(voice_config(url))));
        sink.connect();
        assert_eq!(sink.wait_ready().await, SinkState::Disconnected);
    }
}
