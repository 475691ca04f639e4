use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::PlaybackSink;
use super::ring::RingConsumer;

/// Playback drain configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Largest write handed to the sink
    pub max_chunk_bytes: usize,
    /// Sleep between attempts when the ring is empty or the sink is full
    pub idle_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 4096,
            idle_interval: Duration::from_millis(1),
        }
    }
}

/// Emitted by the drain task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A finished stream has been fully handed to the sink
    StreamDrained,
}

/// Handle to a running drain task
pub struct PlaybackHandle {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<u64>>>,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl PlaybackHandle {
    /// Non-blocking check for a drained stream.
    pub fn try_event(&mut self) -> Option<PlaybackEvent> {
        self.events.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<PlaybackEvent> {
        self.events.recv().await
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the task to stop at its next iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop the task and wait for it; returns the bytes it played.
    pub async fn stop(&mut self) -> Result<u64> {
        self.request_stop();
        match self.task.take() {
            Some(task) => task.await.context("Playback task panicked")?,
            None => Ok(0),
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Spawn the drain loop moving audio from `consumer` to `sink`.
pub fn spawn_playback(
    mut consumer: RingConsumer,
    mut sink: Box<dyn PlaybackSink>,
    config: PlaybackConfig,
) -> PlaybackHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();
    let stop_flag = stop.clone();

    let task = tokio::spawn(async move {
        info!(
            "Playback started: sink={}, ring={} bytes",
            sink.name(),
            consumer.capacity()
        );
        let mut played = 0u64;

        while !stop_flag.load(Ordering::SeqCst) {
            let n = match consumer
                .read_into(sink.as_mut(), config.max_chunk_bytes)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("Playback sink {} failed: {}", sink.name(), e);
                    break;
                }
            };
            played += n as u64;

            if n == 0 {
                if consumer.take_completion() {
                    if let Err(e) = sink.flush().await {
                        warn!("Playback sink flush failed: {}", e);
                    }
                    debug!("Stream drained after {} bytes", played);
                    let _ = tx.send(PlaybackEvent::StreamDrained);
                }
                tokio::time::sleep(config.idle_interval).await;
            }
        }

        sink.close().await?;
        info!("Playback stopped after {} bytes", played);
        Ok(played)
    });

    PlaybackHandle {
        stop,
        task: Some(task),
        events: rx,
    }
}
