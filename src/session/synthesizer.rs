//! Streaming text-to-speech over JSON text frames.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::events::{event_channel, EventReceiver, SessionEvent};
use super::link::{AudioOutput, Link};
use super::state::{ActivePhase, SessionState};
use super::stats::SessionStats;
use crate::audio::{MemoryPools, PlaybackSink};
use crate::config::SynthesizerConfig;
use crate::error::{Result, TransportError};
use crate::protocol::synthesis::{SynthesisRequest, SynthesisResponse};
use crate::ws::{Connector, Message, UpgradeRequest};

pub struct SynthesizerClient<C: Connector> {
    link: Link<C>,
    settings: SynthesizerConfig,
    config: SessionConfig,
    pools: Arc<MemoryPools>,
    output: Option<AudioOutput>,
    sink: Option<Box<dyn PlaybackSink>>,
    task_started: bool,
    receiving: bool,
    chunks_received: u32,
    spoken_at: Option<Instant>,
}

impl<C: Connector> SynthesizerClient<C> {
    pub fn new(
        connector: C,
        settings: SynthesizerConfig,
        config: SessionConfig,
        pools: Arc<MemoryPools>,
        sink: Box<dyn PlaybackSink>,
    ) -> (Self, EventReceiver) {
        let request = UpgradeRequest::new(settings.endpoint.clone())
            .header("Authorization", format!("Bearer {}", settings.api_key));

        let (events, rx) = event_channel(config.event_queue_depth);
        let link = Link::new(
            connector,
            request,
            config.connection.clone(),
            Arc::clone(&pools),
            events,
        );

        let client = Self {
            link,
            settings,
            config,
            pools,
            output: None,
            sink: Some(sink),
            task_started: false,
            receiving: false,
            chunks_received: 0,
            spoken_at: None,
        };
        (client, rx)
    }

    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    /// Whether audio for the current utterance is still arriving
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    pub fn playback_buffered(&self) -> usize {
        self.output.as_ref().map_or(0, |o| o.buffered())
    }

    pub fn stats(&self) -> SessionStats {
        self.link.stats()
    }

    /// Speech speed, 0.5 to 2.0
    pub fn set_speed(&mut self, speed: f32) -> bool {
        if !(0.5..=2.0).contains(&speed) {
            warn!("Ignoring speed {} (expected 0.5..=2.0)", speed);
            return false;
        }
        self.settings.speed = speed;
        true
    }

    /// Volume, 0.1 to 1.0
    pub fn set_volume(&mut self, volume: f32) -> bool {
        if !(0.1..=1.0).contains(&volume) {
            warn!("Ignoring volume {} (expected 0.1..=1.0)", volume);
            return false;
        }
        self.settings.volume = volume;
        true
    }

    /// Pitch in semitones, -12 to 12
    pub fn set_pitch(&mut self, pitch: i32) -> bool {
        if !(-12..=12).contains(&pitch) {
            warn!("Ignoring pitch {} (expected -12..=12)", pitch);
            return false;
        }
        self.settings.pitch = pitch;
        true
    }

    pub fn set_voice(&mut self, voice_id: impl Into<String>) {
        self.settings.voice_id = voice_id.into();
    }

    pub async fn connect(&mut self) -> Result<()> {
        AudioOutput::check_available(&self.output, &self.sink)?;
        self.link.connect().await?;

        let strategy = self.pools.fixed_strategy(self.settings.ring_bytes);
        if let Err(e) =
            AudioOutput::ensure(&mut self.output, &mut self.sink, &strategy, &self.config.playback)
        {
            error!("Playback setup failed: {}", e);
            self.link.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send `task_start` and wait for `task_started`.
    pub async fn start_task(&mut self) -> Result<()> {
        self.link
            .require("start a task", self.state() == SessionState::Connected)?;

        self.task_started = false;
        self.link.transition(SessionState::SessionStarting);
        self.send(&SynthesisRequest::task_start(&self.settings)).await?;
        debug!("task_start sent (voice {})", self.settings.voice_id);

        let deadline = Instant::now() + self.config.session_start_timeout;
        loop {
            if self.task_started {
                self.link
                    .transition(SessionState::SessionActive(ActivePhase::Listening));
                info!("Synthesis task started");
                return Ok(());
            }
            if self.state() != SessionState::SessionStarting {
                return Err(crate::error::SessionError::SessionFailed(
                    "task rejected".to_string(),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("No task_started within {:?}", self.config.session_start_timeout);
                self.link.transition(SessionState::Connected);
                return Err(TransportError::Timeout {
                    what: "task_started",
                }
                .into());
            }
            self.receive_one((deadline - now).min(self.config.poll_interval))
                .await?;
        }
    }

    /// Synthesize `text`. Connects and starts a task as needed.
    pub async fn speak(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Nothing to speak");
            return Ok(());
        }

        if self.state() == SessionState::Disconnected {
            self.connect().await?;
        }
        self.link.require(
            "speak",
            self.state().phase() != Some(ActivePhase::Speaking),
        )?;
        if self.state() == SessionState::Connected {
            self.start_task().await?;
        }
        self.link.require(
            "speak",
            self.state() == SessionState::SessionActive(ActivePhase::Listening),
        )?;

        self.send(&SynthesisRequest::TaskContinue {
            text: text.to_string(),
        })
        .await?;

        self.chunks_received = 0;
        self.receiving = true;
        self.spoken_at = Some(Instant::now());
        if let Some(output) = self.output.as_mut() {
            output.begin_stream();
        }
        self.link
            .transition(SessionState::SessionActive(ActivePhase::Speaking));
        self.link.events.emit(SessionEvent::SynthesisStarted {
            text: Some(text.to_string()),
        });
        info!("Speaking {} characters", text.chars().count());
        Ok(())
    }

    /// One control-loop iteration.
    pub async fn poll(&mut self) -> Result<()> {
        self.check_playback();

        if let Some(output) = self.output.as_mut() {
            if !output.flush_pending() {
                tokio::time::sleep(self.config.playback.idle_interval).await;
                return Ok(());
            }
        }

        if !self.link.is_connected() {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        }

        self.receive_one(self.config.poll_interval).await
    }

    /// Stop the current utterance: buffered audio is dropped and the rest of
    /// its stream is ignored. The connection and the drain task stay up.
    pub fn stop_playback(&mut self) {
        if let Some(output) = self.output.as_mut() {
            output.stop_playback();
        }
        self.receiving = false;
        if self.state().phase() == Some(ActivePhase::Speaking) {
            // The server keeps the task open only until its final chunk
            self.task_started = false;
            self.link.transition(SessionState::Connected);
        }
    }

    /// Send `task_finish` if a task is open, then close.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.task_started && self.link.is_connected() {
            if let Err(e) = self.send(&SynthesisRequest::TaskFinish).await {
                debug!("task_finish failed: {}", e);
            }
        }
        self.task_started = false;
        self.receiving = false;
        self.link.close().await;
        Ok(())
    }

    /// Disconnect and stop the playback task.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.disconnect().await?;
        if let Some(mut output) = self.output.take() {
            match output.stop().await {
                Ok(played) => info!("Playback finished, {} bytes played", played),
                Err(e) => warn!("Playback task ended with error: {}", e),
            }
        }
        Ok(())
    }

    fn check_playback(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        while output.take_drained() {
            info!(
                "Playback complete: {} chunks received",
                self.chunks_received
            );
            self.link.events.emit(SessionEvent::PlaybackFinished);
            if self.link.state() == SessionState::SessionActive(ActivePhase::Speaking) {
                // The server closes the task after the final chunk
                self.task_started = false;
                self.link.transition(SessionState::Connected);
            }
        }
    }

    async fn send(&mut self, request: &SynthesisRequest) -> Result<()> {
        let json = serde_json::to_string(request).map_err(crate::error::ProtocolError::from)?;
        self.link.send_text(&json).await
    }

    async fn receive_one(&mut self, wait: std::time::Duration) -> Result<()> {
        let Some(message) = self.link.recv(wait).await? else {
            return Ok(());
        };
        self.handle(message);
        Ok(())
    }

    fn handle(&mut self, message: Message) {
        let response: SynthesisResponse = match serde_json::from_slice(&message.payload) {
            Ok(response) => response,
            Err(e) => {
                if message.payload.len() > 10 {
                    warn!("Unparseable synthesis message ({} bytes): {}", message.payload.len(), e);
                }
                self.link.stats.messages_dropped += 1;
                return;
            }
        };

        match response.event.as_deref() {
            Some("connected_success") => info!("Synthesis service connected"),
            Some("task_started") => self.task_started = true,
            Some("task_finished") => {
                info!("Synthesis task finished");
                self.task_started = false;
            }
            Some("task_failed") | Some("error") => {
                let message = response.error_message();
                error!("Synthesis error: {}", message);
                if self.state() == SessionState::SessionStarting {
                    self.link.transition(SessionState::Connected);
                }
                self.link.events.emit(SessionEvent::ServerError {
                    code: response
                        .base_resp
                        .as_ref()
                        .and_then(|b| u32::try_from(b.status_code).ok()),
                    message,
                });
            }
            Some(other) => debug!("Synthesis event {}", other),
            None => {}
        }

        if !self.receiving {
            if response.audio_hex().is_some() || response.is_final {
                debug!("Ignoring synthesis output after playback was stopped");
            }
            return;
        }

        if let Some(hex_audio) = response.audio_hex() {
            match hex::decode(hex_audio) {
                Ok(audio) => self.on_audio(audio),
                Err(e) => {
                    warn!("Dropping malformed hex audio: {}", e);
                    self.link.stats.messages_dropped += 1;
                }
            }
        }

        if response.is_final {
            self.receiving = false;
            if let Some(output) = self.output.as_mut() {
                output.finish_stream();
            }
            info!(
                "Synthesis completed: {} chunks received",
                self.chunks_received
            );
            self.link.events.emit(SessionEvent::SynthesisEnded);
        }
    }

    fn on_audio(&mut self, audio: Vec<u8>) {
        self.chunks_received += 1;
        if self.chunks_received == 1 {
            if let Some(at) = self.spoken_at {
                info!("First audio chunk after {:?}", at.elapsed());
            }
        }
        self.link.stats.playback_bytes_received += audio.len() as u64;

        match self.output.as_mut() {
            Some(output) => {
                output.push(audio);
            }
            None => warn!("Dropping {} bytes of audio: no playback buffer", audio.len()),
        }
    }
}
