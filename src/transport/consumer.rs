use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{FrameInbox, TransportError};
use crate::audio::AudioFrame;

/// Receiving end of a [`TransportServer`](super::TransportServer).
pub struct TransportConsumer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    received: u64,
}

impl TransportConsumer {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(url.as_str()).await?;
        log::info!("Transport consumer attached to {}", url);
        Ok(Self { ws, received: 0 })
    }

    /// Leave the session. The producer side treats this as terminal.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameInbox for TransportConsumer {
    async fn recv(&mut self) -> Result<Option<AudioFrame>, TransportError> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Binary(data) => {
                    let frame = AudioFrame::new(data)?;
                    self.received += 1;
                    return Ok(Some(frame));
                }
                Message::Close(frame) => {
                    log::info!(
                        "Transport producer closed after {} frames: {:?}",
                        self.received,
                        frame
                    );
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_BYTES;
    use crate::transport::TransportServer;
    use bytes::Bytes;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(Bytes::from(vec![tag; FRAME_BYTES])).unwrap()
    }

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut server, channel) = TransportServer::bind(any_port(), 4).await.unwrap();
        let mut consumer = TransportConsumer::connect(server.local_addr()).await.unwrap();
        server.wait_for_consumer().await.unwrap();

        let producer = tokio::spawn(async move {
            for tag in 0..50u8 {
                channel.send(frame(tag)).await.unwrap();
            }
        });

        for tag in 0..50u8 {
            let got = consumer.recv().await.unwrap().unwrap();
            assert_eq!(got.as_bytes().len(), FRAME_BYTES);
            assert!(got.as_bytes().iter().all(|b| *b == tag));
        }
        producer.await.unwrap();

        // Channel dropped by the producer task: clean end of stream.
        assert!(consumer.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_consumer_rejected() {
        let (mut server, channel) = TransportServer::bind(any_port(), 4).await.unwrap();
        let mut first = TransportConsumer::connect(server.local_addr()).await.unwrap();
        server.wait_for_consumer().await.unwrap();

        let second = TransportConsumer::connect(server.local_addr()).await;
        assert!(matches!(second, Err(TransportError::WebSocket(_))));

        channel.send(frame(7)).await.unwrap();
        let got = first.recv().await.unwrap().unwrap();
        assert_eq!(got.as_bytes()[0], 7);
    }

    #[tokio::test]
    async fn test_consumer_disconnect_closes_channel() {
        let (mut server, channel) = TransportServer::bind(any_port(), 4).await.unwrap();
        let mut consumer = TransportConsumer::connect(server.local_addr()).await.unwrap();
        server.wait_for_consumer().await.unwrap();

        channel.send(frame(1)).await.unwrap();
        consumer.recv().await.unwrap().unwrap();
        consumer.close().await.unwrap();

        timeout(Duration::from_secs(2), async {
            while !channel.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("channel should close after the consumer leaves");

        assert!(matches!(
            channel.send(frame(2)).await,
            Err(TransportError::Closed)
        ));

        // No reconnection: a new consumer is refused.
        let again = TransportConsumer::connect(server.local_addr()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_short_message_is_malformed() {
        let listener = tokio::net::TcpListener::bind(any_port()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Binary(Bytes::from(vec![0u8; 100])))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut consumer = TransportConsumer::connect(addr).await.unwrap();
        assert!(matches!(
            consumer.recv().await,
            Err(TransportError::MalformedFrame(_))
        ));
    }
}
