use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::events::{EventSender, SessionEvent};
use super::state::SessionState;
use super::stats::SessionStats;
use crate::audio::{
    spawn_playback, AllocationStrategy, AudioRing, MemoryPools, PlaybackConfig, PlaybackEvent,
    PlaybackHandle, PlaybackSink, RingProducer, StreamState, PCM_SAMPLE_WIDTH,
};
use crate::error::{Result, SessionError, TransportError};
use crate::ws::{
    ConnectionConfig, Connector, Inbound, Message, UpgradeRequest, WsConnection,
};

/// Connection and lifecycle state shared by every client
pub(crate) struct Link<C: Connector> {
    connector: C,
    request: UpgradeRequest,
    config: ConnectionConfig,
    pools: Arc<MemoryPools>,
    conn: Option<WsConnection<C::Stream>>,
    state: SessionState,
    pub(crate) events: EventSender,
    pub(crate) stats: SessionStats,
}

impl<C: Connector> Link<C> {
    pub(crate) fn new(
        connector: C,
        request: UpgradeRequest,
        config: ConnectionConfig,
        pools: Arc<MemoryPools>,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            request,
            config,
            pools,
            conn: None,
            state: SessionState::Disconnected,
            events,
            stats: SessionStats::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_open())
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!("Unexpected state transition {} -> {}", from, next);
        }
        debug!("State {} -> {}", from, next);

        if !from.is_active() && next.is_active() {
            self.stats.session_started_at = Some(Utc::now());
        } else if !next.is_active() {
            self.stats.session_started_at = None;
        }
        self.state = next;
        self.stats.state = next;
        self.events.emit(SessionEvent::StateChanged { from, to: next });
    }

    /// Fail with `InvalidState` unless `allowed` holds.
    pub(crate) fn require(&self, operation: &'static str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    pub(crate) async fn connect(&mut self) -> Result<()> {
        self.require("connect", self.state == SessionState::Disconnected)?;
        self.transition(SessionState::Connecting);

        match self.open().await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.stats.connections += 1;
                self.transition(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.request.endpoint, e);
                self.transition(SessionState::Disconnected);
                self.events.emit(SessionEvent::Disconnected {
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    async fn open(&self) -> Result<WsConnection<C::Stream>, TransportError> {
        let stream = self.connector.connect(&self.request.endpoint).await?;
        WsConnection::handshake(stream, &self.request, &self.config, Arc::clone(&self.pools)).await
    }

    pub(crate) async fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(SessionError::NotConnected)?;
        if let Err(e) = conn.send_binary(bytes).await {
            self.teardown(&format!("send failed: {}", e));
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) async fn send_text(&mut self, text: &str) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(SessionError::NotConnected)?;
        if let Err(e) = conn.send_text(text).await {
            self.teardown(&format!("send failed: {}", e));
            return Err(e.into());
        }
        Ok(())
    }

    /// Next application message, or `None` when nothing arrived in `wait`
    /// or the server closed the connection.
    pub(crate) async fn recv(&mut self, wait: Duration) -> Result<Option<Message>> {
        let conn = self.conn.as_mut().ok_or(SessionError::NotConnected)?;
        match conn.recv(wait).await {
            Ok(Some(Inbound::Message(message))) => Ok(Some(message)),
            Ok(Some(Inbound::Closed { code, reason })) => {
                info!("Server closed the connection ({:?}) {}", code, reason);
                self.teardown(&format!("closed by server: {}", reason));
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Connection lost: {}", e);
                self.teardown(&e.to_string());
                Err(e.into())
            }
        }
    }

    /// Close gracefully and move to `Disconnected`.
    pub(crate) async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("Close handshake failed: {}", e);
            }
        }
        if self.state != SessionState::Disconnected {
            self.teardown("closed by client");
        }
    }

    pub(crate) fn teardown(&mut self, reason: &str) {
        self.conn = None;
        if self.state == SessionState::Disconnected {
            return;
        }
        self.transition(SessionState::Disconnected);
        self.events.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub(crate) fn stats(&self) -> SessionStats {
        self.stats.clone()
    }
}

/// Playback ring, drain task and the audio waiting for ring space
pub(crate) struct AudioOutput {
    producer: RingProducer,
    handle: PlaybackHandle,
    /// Chunks the ring had no room for, oldest first
    pending: VecDeque<Vec<u8>>,
    /// First byte of a sample split across two chunks
    carry: Option<u8>,
    /// Stream end seen while chunks were still pending
    finish_requested: bool,
}

impl AudioOutput {
    /// Allocate the ring and start draining into the sink in `sink_slot`.
    ///
    /// The sink is only taken once the ring exists, so a failed allocation
    /// can be retried on the next connect. Once the sink has been handed to
    /// a drain task that later stopped there is nothing left to play into.
    pub(crate) fn ensure(
        output: &mut Option<AudioOutput>,
        sink_slot: &mut Option<Box<dyn PlaybackSink>>,
        strategy: &AllocationStrategy,
        config: &PlaybackConfig,
    ) -> Result<()> {
        if output.is_some() {
            return Ok(());
        }
        Self::check_available(output, sink_slot)?;
        let (producer, consumer) = AudioRing::allocate(strategy)?;
        let Some(sink) = sink_slot.take() else {
            return Err(SessionError::PlaybackClosed);
        };

        *output = Some(AudioOutput {
            producer,
            handle: spawn_playback(consumer, sink, config.clone()),
            pending: VecDeque::new(),
            carry: None,
            finish_requested: false,
        });
        Ok(())
    }

    /// Fail when there is neither a running output nor a sink to start one.
    pub(crate) fn check_available(
        output: &Option<AudioOutput>,
        sink_slot: &Option<Box<dyn PlaybackSink>>,
    ) -> Result<()> {
        if output.is_none() && sink_slot.is_none() {
            return Err(SessionError::PlaybackClosed);
        }
        Ok(())
    }

    /// Queue audio for playback; false when some of it had to be held back.
    ///
    /// Chunks larger than the ring are split. An odd trailing byte waits for
    /// the next chunk so the ring only ever holds whole samples.
    pub(crate) fn push(&mut self, mut audio: Vec<u8>) -> bool {
        if let Some(byte) = self.carry.take() {
            audio.insert(0, byte);
        }
        if audio.len() % PCM_SAMPLE_WIDTH != 0 {
            self.carry = audio.pop();
        }

        let piece = (self.producer.capacity() / PCM_SAMPLE_WIDTH * PCM_SAMPLE_WIDTH)
            .max(PCM_SAMPLE_WIDTH);
        if audio.len() > piece {
            debug!(
                "Splitting {} byte audio chunk for the {} byte ring",
                audio.len(),
                self.producer.capacity()
            );
            self.pending.extend(audio.chunks(piece).map(<[u8]>::to_vec));
        } else if !audio.is_empty() {
            self.pending.push_back(audio);
        }
        self.flush_pending()
    }

    /// Move held audio into the ring in order; true once nothing is pending.
    pub(crate) fn flush_pending(&mut self) -> bool {
        while let Some(front) = self.pending.front() {
            if self.producer.write(front) == 0 {
                return false;
            }
            self.pending.pop_front();
        }
        if self.finish_requested {
            self.finish_requested = false;
            self.producer.finish_stream();
        }
        true
    }

    /// Bytes in the ring plus bytes still held back.
    pub(crate) fn buffered(&self) -> usize {
        self.producer.len() + self.pending.iter().map(Vec::len).sum::<usize>()
    }

    pub(crate) fn begin_stream(&mut self) {
        // A new stream before the last one was fully queued continues it
        self.finish_requested = false;
        self.carry = None;
        self.producer.begin_stream();
    }

    /// Mark the stream complete once everything pushed so far is queued.
    pub(crate) fn finish_stream(&mut self) {
        if self.carry.take().is_some() {
            debug!("Dropping partial sample at end of stream");
        }
        if self.pending.is_empty() {
            self.producer.finish_stream();
        } else {
            self.finish_requested = true;
        }
    }

    pub(crate) fn stream_state(&self) -> StreamState {
        if self.finish_requested {
            return StreamState::Finished;
        }
        self.producer.stream_state()
    }

    /// Drop everything buffered or held back without stopping the drain task.
    pub(crate) fn stop_playback(&mut self) {
        let dropped = self.buffered();
        self.pending.clear();
        self.carry = None;
        self.finish_requested = false;
        self.producer.discard();
        while self.handle.try_event().is_some() {}
        info!("Playback stopped, {} buffered bytes dropped", dropped);
    }

    /// True once for each stream the drain task finished.
    pub(crate) fn take_drained(&mut self) -> bool {
        matches!(self.handle.try_event(), Some(PlaybackEvent::StreamDrained))
    }

    pub(crate) async fn stop(&mut self) -> anyhow::Result<u64> {
        self.handle.stop().await
    }
}
