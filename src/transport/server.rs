use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, accept_hdr_async};

use super::{TransportChannel, TransportError};
use crate::audio::AudioFrame;

/// A peer that has not finished the WebSocket upgrade by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket endpoint serving frames to exactly one consumer.
///
/// The first peer to complete the handshake becomes the consumer for the
/// lifetime of the server. Later peers are refused with HTTP 409, including
/// after the consumer has left.
pub struct TransportServer {
    local_addr: SocketAddr,
    consumer: Option<oneshot::Receiver<SocketAddr>>,
    accept_task: JoinHandle<()>,
}

impl TransportServer {
    /// Bind the listener and return the server with its sending channel.
    pub async fn bind(
        addr: SocketAddr,
        queue_depth: usize,
    ) -> Result<(Self, TransportChannel), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (channel, rx) = TransportChannel::new(queue_depth);
        let (connected_tx, connected_rx) = oneshot::channel();

        log::info!(
            "Transport listening on ws://{} (queue depth {})",
            local_addr,
            queue_depth
        );

        let accept_task = tokio::spawn(accept_loop(listener, rx, connected_tx));

        Ok((
            Self {
                local_addr,
                consumer: Some(connected_rx),
                accept_task,
            },
            channel,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait until a consumer has connected. Returns its address.
    pub async fn wait_for_consumer(&mut self) -> Result<SocketAddr, TransportError> {
        let rx = self.consumer.take().ok_or(TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Stop accepting connections. A connected consumer keeps receiving until
    /// the sending channel is dropped.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    rx: mpsc::Receiver<AudioFrame>,
    connected_tx: oneshot::Sender<SocketAddr>,
) {
    let mut pending = Some((rx, connected_tx));
    // Handshakes run off the accept path so a silent peer cannot hold it.
    let (done_tx, mut done_rx) = mpsc::channel::<(WebSocketStream<TcpStream>, SocketAddr)>(4);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Transport accept error: {}", e);
                        continue;
                    }
                };
                if pending.is_some() {
                    tokio::spawn(handshake(stream, peer, done_tx.clone()));
                } else {
                    tokio::spawn(reject(stream, peer));
                }
            }
            Some((ws, peer)) = done_rx.recv() => {
                match pending.take() {
                    Some((rx, connected_tx)) => {
                        log::info!("Transport consumer connected: {}", peer);
                        let _ = connected_tx.send(peer);
                        tokio::spawn(write_loop(ws, rx, peer));
                    }
                    None => {
                        // Lost the race to an earlier handshake.
                        log::warn!("Closing late transport consumer: {}", peer);
                        tokio::spawn(async move {
                            let mut ws = ws;
                            let _ = ws.close(None).await;
                        });
                    }
                }
            }
        }
    }
}

async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    done_tx: mpsc::Sender<(WebSocketStream<TcpStream>, SocketAddr)>,
) {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => {
            let _ = done_tx.send((ws, peer)).await;
        }
        Ok(Err(e)) => log::warn!("Transport handshake with {} failed: {}", peer, e),
        Err(_) => log::warn!("Transport handshake with {} timed out", peer),
    }
}

async fn reject(stream: TcpStream, peer: SocketAddr) {
    let refuse = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
        let mut resp = ErrorResponse::new(Some("consumer already connected".to_string()));
        *resp.status_mut() = StatusCode::CONFLICT;
        Err(resp)
    };
    let _ = accept_hdr_async(stream, refuse).await;
    log::warn!("Rejected second transport consumer: {}", peer);
}

async fn write_loop(
    ws: WebSocketStream<TcpStream>,
    mut rx: mpsc::Receiver<AudioFrame>,
    peer: SocketAddr,
) {
    let (mut write, mut read) = ws.split();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Binary(frame.into_bytes())).await {
                            log::error!("Transport write to {} failed: {}", peer, e);
                            break;
                        }
                        sent += 1;
                    }
                    None => {
                        // Producer finished; tell the consumer.
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        log::warn!("Transport consumer {} closed: {:?}", peer, frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("Transport consumer {} error: {}", peer, e);
                        break;
                    }
                    None => {
                        log::warn!("Transport consumer {} disconnected", peer);
                        break;
                    }
                }
            }
        }
    }

    // Dropping `rx` here moves every sender into the closed state.
    log::info!("Transport to {} finished after {} frames", peer, sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_BYTES;
    use crate::transport::{FrameInbox, TransportConsumer};
    use bytes::Bytes;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_silent_peer_does_not_block_consumer() {
        let (mut server, channel) = TransportServer::bind("127.0.0.1:0".parse().unwrap(), 4)
            .await
            .unwrap();

        // Opens TCP but never sends an upgrade request.
        let _silent = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut consumer = timeout(
            Duration::from_secs(2),
            TransportConsumer::connect(server.local_addr()),
        )
        .await
        .expect("consumer should get past a silent peer")
        .unwrap();
        let peer = timeout(Duration::from_secs(2), server.wait_for_consumer())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(peer.port(), 0);

        let frame = AudioFrame::new(Bytes::from(vec![3u8; FRAME_BYTES])).unwrap();
        channel.send(frame).await.unwrap();
        assert_eq!(consumer.recv().await.unwrap().unwrap().as_bytes()[0], 3);
    }
}
