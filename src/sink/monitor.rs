use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::{SinkError, SinkState};
use crate::audio::{AudioFrame, PcmOutput};

/// Plays raw frames locally. Frames skip the encoder entirely.
///
/// Playback runs on its own OS thread so a blocking device write never stalls
/// the async stages. The sink is `Ready` from construction until that thread
/// exits.
pub struct MonitorSink {
    tx: Option<mpsc::Sender<AudioFrame>>,
    handle: Option<JoinHandle<()>>,
    delivered: u64,
}

impl MonitorSink {
    pub fn start(output: Box<dyn PcmOutput>, queue_depth: usize) -> Result<Self, SinkError> {
        let (tx, rx) = mpsc::channel(queue_depth);
        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || play_thread(output, rx))
            .map_err(|e| SinkError::Playback(e.to_string()))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            delivered: 0,
        })
    }

    pub fn state(&self) -> SinkState {
        match &self.tx {
            Some(tx) if !tx.is_closed() => SinkState::Ready,
            _ => SinkState::Disconnected,
        }
    }

    pub async fn deliver(&mut self, frame: AudioFrame) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Disconnected)?;
        tx.send(frame).await.map_err(|_| SinkError::Disconnected)?;
        self.delivered += 1;
        Ok(())
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Let queued frames play out, then stop the playback thread.
    pub async fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

fn play_thread(mut output: Box<dyn PcmOutput>, mut rx: mpsc::Receiver<AudioFrame>) {
    log::info!("Playback started");
    let mut played: u64 = 0;

    while let Some(frame) = rx.blocking_recv() {
        if let Err(e) = output.write(&frame) {
            log::error!("Playback write failed: {:#}", e);
            break;
        }
        played += 1;
    }

    log::info!("Playback stopped after {} frames", played);
}
