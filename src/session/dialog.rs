//! Full-duplex spoken dialog over the event/session protocol profile.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::SessionConfig;
use super::events::{event_channel, EventReceiver, SessionEvent};
use super::link::{AudioOutput, Link};
use super::state::{ActivePhase, SessionState};
use super::stats::SessionStats;
use crate::audio::{AudioBatcher, MemoryPools, PlaybackSink, StreamState};
use crate::config::{DialogConfig, DialogModel};
use crate::error::{ProtocolError, Result, SessionError, TransportError};
use crate::protocol::codec::{self, Profile, ProtocolMessage};
use crate::protocol::events::{
    is_connection_scoped, AsrExtra, AsrResponsePayload, AsrSection, ChatResponsePayload,
    ChatTtsTextPayload, ClientEvent, ContentPayload, DialogExtra, DialogSection, ErrorPayload,
    ServerEvent, SessionStartedPayload, StartSessionPayload, TtsAudioConfig, TtsSection,
    TtsSentenceStartPayload,
};
use crate::protocol::header::{MessageType, Serialization};
use crate::ws::Connector;

/// Client for the realtime dialog service
///
/// Drive it by calling [`poll`](Self::poll) from the control loop; every
/// call handles at most one inbound message and never blocks longer than
/// the configured poll interval (plus the payload timeout once a frame has
/// started arriving).
pub struct DialogClient<C: Connector> {
    link: Link<C>,
    settings: DialogConfig,
    config: SessionConfig,
    pools: Arc<MemoryPools>,
    session_id: Option<String>,
    dialog_id: Option<String>,
    batcher: AudioBatcher,
    output: Option<AudioOutput>,
    sink: Option<Box<dyn PlaybackSink>>,
    last_transcript: String,
    failure: Option<String>,
    /// Set when playback is cut off mid-reply; cleared at the reply's end
    discard_tts: bool,
}

impl<C: Connector> DialogClient<C> {
    pub fn new(
        connector: C,
        settings: DialogConfig,
        config: SessionConfig,
        pools: Arc<MemoryPools>,
        sink: Box<dyn PlaybackSink>,
    ) -> (Self, EventReceiver) {
        let request = crate::ws::UpgradeRequest::new(settings.endpoint.clone())
            .header("X-Api-App-ID", settings.app_id.as_str())
            .header("X-Api-Access-Key", settings.access_key.as_str())
            .header("X-Api-Resource-Id", settings.resource_id.as_str())
            .header("X-Api-App-Key", settings.app_key.as_str());

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
            batcher: AudioBatcher::new(config.batch.clone()),
            settings,
            config,
            pools,
            session_id: None,
            dialog_id: None,
            output: None,
            sink: Some(sink),
            last_transcript: String::new(),
            failure: None,
            discard_tts: false,
        };
        (client, rx)
    }

    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn dialog_id(&self) -> Option<&str> {
        self.dialog_id.as_deref()
    }

    /// Bytes of synthesized audio waiting in the playback ring
    pub fn playback_buffered(&self) -> usize {
        self.output.as_ref().map_or(0, |o| o.buffered())
    }

    pub fn stats(&self) -> SessionStats {
        self.link.stats()
    }

    /// Open the connection, allocate the playback ring and announce the
    /// connection to the server.
    pub async fn connect(&mut self) -> Result<()> {
        AudioOutput::check_available(&self.output, &self.sink)?;
        self.link.connect().await?;

        let strategy = self.pools.playback_strategy();
        if let Err(e) =
            AudioOutput::ensure(&mut self.output, &mut self.sink, &strategy, &self.config.playback)
        {
            error!("Playback setup failed: {}", e);
            self.link.close().await;
            return Err(e.into());
        }

        self.send_json(ClientEvent::StartConnection, &serde_json::json!({}))
            .await?;
        info!("Dialog connection ready");
        Ok(())
    }

    /// Start a dialog session and wait for the server to accept it.
    pub async fn start_session(&mut self) -> Result<()> {
        self.link
            .require("start a session", self.state() == SessionState::Connected)?;

        let session_id = Uuid::new_v4().to_string();
        self.session_id = Some(session_id.clone());
        self.failure = None;
        self.discard_tts = false;
        self.link.transition(SessionState::SessionStarting);

        let payload = self.start_session_payload();
        self.send_json(ClientEvent::StartSession, &payload).await?;
        info!("Starting dialog session {}", session_id);

        let deadline = Instant::now() + self.config.session_start_timeout;
        loop {
            match self.state() {
                SessionState::SessionActive(_) => return Ok(()),
                SessionState::SessionStarting => {}
                SessionState::Connected => {
                    self.session_id = None;
                    let reason = self
                        .failure
                        .take()
                        .unwrap_or_else(|| "session rejected".to_string());
                    return Err(SessionError::SessionFailed(reason));
                }
                _ => return Err(SessionError::NotConnected),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("No SessionStarted within {:?}", self.config.session_start_timeout);
                self.session_id = None;
                self.link.transition(SessionState::Connected);
                return Err(TransportError::Timeout {
                    what: "session start acknowledgment",
                }
                .into());
            }
            self.receive_one((deadline - now).min(self.config.poll_interval))
                .await?;
        }
    }

    /// Begin streaming uplink audio. Allowed in any active phase except
    /// Recording, so the user can talk over playback, which stops it.
    pub async fn start_recording(&mut self) -> Result<()> {
        let phase = self.state().phase();
        self.link.require(
            "start recording",
            phase.is_some() && phase != Some(ActivePhase::Recording),
        )?;
        if phase == Some(ActivePhase::Speaking) {
            self.stop_playback();
        }

        self.batcher.reset();
        self.last_transcript.clear();
        self.link
            .transition(SessionState::SessionActive(ActivePhase::Recording));
        info!("Recording started");
        Ok(())
    }

    /// Batch captured samples and send every full batch.
    pub async fn send_samples(&mut self, samples: &[i16]) -> Result<()> {
        self.require_recording("send audio")?;
        for batch in self.batcher.push(samples) {
            self.send_audio_chunk(batch).await?;
        }
        Ok(())
    }

    /// Send already-encoded PCM as one audio message.
    pub async fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        self.require_recording("send audio")?;
        self.send_audio_chunk(pcm.to_vec()).await
    }

    /// Flush buffered audio and wait for the reply. No end-of-audio marker
    /// is sent; the server detects the end of speech itself.
    pub async fn stop_recording(&mut self) -> Result<()> {
        if self.state().phase() != Some(ActivePhase::Recording) {
            debug!("stop_recording while {}, ignoring", self.state());
            return Ok(());
        }
        self.finish_recording().await?;
        self.link.events.emit(SessionEvent::RecordingStopped {
            reason: crate::vad::StopReason::Manual,
            text: self.last_transcript.clone(),
        });
        Ok(())
    }

    /// Cut off the reply being played. Buffered audio is dropped and the
    /// rest of the reply is ignored until the server ends it.
    pub fn stop_playback(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        // Still arriving unless the server already sent TtsEnded
        if output.stream_state() == StreamState::Active {
            self.discard_tts = true;
        }
        output.stop_playback();
        if self.state().phase() == Some(ActivePhase::Speaking) {
            self.link
                .transition(SessionState::SessionActive(ActivePhase::Listening));
        }
    }

    /// Ask the bot to greet the user with `text`.
    pub async fn say_hello(&mut self, text: &str) -> Result<()> {
        self.link.require("say hello", self.state().is_active())?;
        let payload = ContentPayload {
            content: text.to_string(),
        };
        self.send_json(ClientEvent::SayHello, &payload).await
    }

    /// Send a typed user query instead of speech.
    pub async fn send_text_query(&mut self, text: &str) -> Result<()> {
        self.link.require("send a text query", self.state().is_active())?;
        let payload = ContentPayload {
            content: text.to_string(),
        };
        self.send_json(ClientEvent::ChatTextQuery, &payload).await
    }

    /// Have the bot speak `text` verbatim.
    pub async fn send_tts_text(&mut self, text: &str) -> Result<()> {
        self.link.require("send TTS text", self.state().is_active())?;
        let payload = ChatTtsTextPayload {
            start: true,
            content: text.to_string(),
            end: true,
        };
        self.send_json(ClientEvent::ChatTtsText, &payload).await
    }

    /// End the current session. A no-op when no session is active.
    pub async fn finish_session(&mut self) -> Result<()> {
        if !self.state().is_active() || self.session_id.is_none() {
            debug!("finish_session while {}, nothing to do", self.state());
            return Ok(());
        }

        self.send_json(ClientEvent::FinishSession, &serde_json::json!({}))
            .await?;
        self.link.transition(SessionState::SessionEnding);
        info!("Finishing dialog session");
        Ok(())
    }

    /// Finish the session (if any), say goodbye and close the socket.
    /// Playback keeps draining until [`shutdown`](Self::shutdown).
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state().is_active() {
            if let Err(e) = self.finish_session().await {
                debug!("FinishSession during disconnect failed: {}", e);
            }
        }
        if self.link.is_connected() {
            if let Err(e) = self
                .send_json(ClientEvent::FinishConnection, &serde_json::json!({}))
                .await
            {
                debug!("FinishConnection failed: {}", e);
            }
        }
        self.link.close().await;
        self.session_id = None;
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

    /// One control-loop iteration.
    pub async fn poll(&mut self) -> Result<()> {
        self.check_playback();

        if let Some(output) = self.output.as_mut() {
            if !output.flush_pending() {
                // Ring still full; leave the socket unread
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

    fn require_recording(&self, operation: &'static str) -> Result<()> {
        self.link.require(
            operation,
            self.state().phase() == Some(ActivePhase::Recording),
        )
    }

    async fn finish_recording(&mut self) -> Result<()> {
        if let Some(rest) = self.batcher.flush() {
            self.send_audio_chunk(rest).await?;
        }
        self.link
            .transition(SessionState::SessionActive(ActivePhase::AwaitingResponse));
        Ok(())
    }

    fn check_playback(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        while output.take_drained() {
            self.link.events.emit(SessionEvent::PlaybackFinished);
            if self.link.state() == SessionState::SessionActive(ActivePhase::Speaking) {
                self.link
                    .transition(SessionState::SessionActive(ActivePhase::Listening));
            }
        }
    }

    fn start_session_payload(&self) -> StartSessionPayload {
        let s = &self.settings;
        let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());
        let (speaking_style, character_manifest) = match s.model {
            DialogModel::Open => (non_empty(&s.speaking_style), None),
            DialogModel::Character => (None, non_empty(&s.character_manifest)),
        };

        StartSessionPayload {
            asr: AsrSection {
                extra: AsrExtra {
                    end_smooth_window_ms: s.end_smooth_window_ms,
                },
            },
            tts: TtsSection {
                speaker: s.speaker.clone(),
                audio_config: TtsAudioConfig {
                    channel: 1,
                    format: "pcm_s16le".to_string(),
                    sample_rate: s.output_sample_rate,
                },
            },
            dialog: DialogSection {
                bot_name: s.bot_name.clone(),
                system_role: non_empty(&s.system_role),
                speaking_style,
                character_manifest,
                dialog_id: self.dialog_id.clone(),
                extra: DialogExtra {
                    input_mod: "audio".to_string(),
                    model: s.model.as_str().to_string(),
                },
            },
        }
    }

    async fn send_json<T: serde::Serialize>(&mut self, event: ClientEvent, body: &T) -> Result<()> {
        let msg = ProtocolMessage::json(MessageType::ClientFullRequest, body)?;
        self.send_message(event, msg).await
    }

    async fn send_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        let len = chunk.len() as u64;
        self.send_message(ClientEvent::TaskRequest, ProtocolMessage::audio(chunk))
            .await?;
        self.link.stats.audio_chunks_sent += 1;
        self.link.stats.audio_bytes_sent += len;
        Ok(())
    }

    async fn send_message(&mut self, event: ClientEvent, msg: ProtocolMessage) -> Result<()> {
        let mut msg = msg.with_event(event.id());
        if !is_connection_scoped(event.id()) {
            if let Some(id) = &self.session_id {
                msg = msg.with_session(id.clone());
            }
        }
        debug!("Sending {:?} ({} byte payload)", event, msg.payload.len());
        self.link.send_binary(&codec::encode(&msg, Profile::EventSession)).await
    }

    async fn receive_one(&mut self, wait: std::time::Duration) -> Result<()> {
        let Some(message) = self.link.recv(wait).await? else {
            return Ok(());
        };

        match codec::decode(&message.payload, Profile::EventSession) {
            Ok(Some(msg)) => {
                self.dispatch(msg);
                Ok(())
            }
            Ok(None) => {
                debug!("Ignoring message of type 0");
                Ok(())
            }
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                self.link.stats.messages_dropped += 1;
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, msg: ProtocolMessage) {
        match msg.message_type {
            MessageType::ServerError => self.on_server_error(&msg),
            MessageType::ServerAck | MessageType::ServerFullResponse
                if msg.serialization == Serialization::Raw =>
            {
                match msg.payload_bytes() {
                    Ok(audio) => self.on_audio(audio.into_owned()),
                    Err(e) => {
                        warn!("Dropping audio payload: {}", e);
                        self.link.stats.messages_dropped += 1;
                    }
                }
            }
            MessageType::ServerAck | MessageType::ServerFullResponse => self.on_event(&msg),
            other => debug!("Ignoring client-side message type {:?}", other),
        }
    }

    fn on_server_error(&mut self, msg: &ProtocolMessage) {
        let message = parse_payload::<ErrorPayload>(msg)
            .map(|p| p.describe())
            .unwrap_or_else(|| String::from_utf8_lossy(&msg.payload).into_owned());
        error!("Server error {:?}: {}", msg.error_code, message);

        if self.state() == SessionState::SessionStarting {
            self.failure = Some(message.clone());
            self.link.transition(SessionState::Connected);
        }
        self.link.events.emit(SessionEvent::ServerError {
            code: msg.error_code,
            message,
        });
    }

    fn on_audio(&mut self, audio: Vec<u8>) {
        if self.discard_tts {
            debug!("Discarding {} bytes of interrupted reply", audio.len());
            return;
        }
        let state = self.state();
        let Some(output) = self.output.as_mut() else {
            warn!("Dropping {} bytes of audio: no playback buffer", audio.len());
            return;
        };

        if output.stream_state() != StreamState::Active {
            output.begin_stream();
        }
        if matches!(
            state.phase(),
            Some(ActivePhase::Listening) | Some(ActivePhase::AwaitingResponse)
        ) {
            self.link
                .transition(SessionState::SessionActive(ActivePhase::Speaking));
        }

        self.link.stats.playback_bytes_received += audio.len() as u64;
        debug!("Audio chunk: {} bytes", audio.len());
        output.push(audio);
    }

    fn on_event(&mut self, msg: &ProtocolMessage) {
        let Some(event_id) = msg.event_id else {
            debug!("Response without event id, ignoring");
            return;
        };
        let Some(event) = ServerEvent::from_id(event_id) else {
            debug!("Ignoring unknown event {}", event_id);
            return;
        };

        match event {
            ServerEvent::ConnectionStarted => info!("Connection started"),
            ServerEvent::ConnectionFailed => {
                let message = parse_payload::<ErrorPayload>(msg)
                    .map(|p| p.describe())
                    .unwrap_or_default();
                error!("Connection failed: {}", message);
                self.link.events.emit(SessionEvent::ServerError {
                    code: None,
                    message: message.clone(),
                });
                self.link.teardown(&format!("connection failed: {}", message));
            }
            ServerEvent::ConnectionFinished => {
                self.link.teardown("connection finished by server");
            }
            ServerEvent::SessionStarted => {
                let payload = parse_payload::<SessionStartedPayload>(msg).unwrap_or_default();
                if let Some(id) = payload.dialog_id.filter(|id| !id.is_empty()) {
                    self.dialog_id = Some(id);
                }
                if self.state() == SessionState::SessionStarting {
                    self.link
                        .transition(SessionState::SessionActive(ActivePhase::Listening));
                    info!("Dialog session started (dialog id {:?})", self.dialog_id);
                    self.link.events.emit(SessionEvent::SessionStarted {
                        session_id: self.session_id.clone().unwrap_or_default(),
                        dialog_id: self.dialog_id.clone(),
                    });
                }
            }
            ServerEvent::SessionFailed => {
                let message = parse_payload::<ErrorPayload>(msg)
                    .map(|p| p.describe())
                    .unwrap_or_else(|| "session failed".to_string());
                error!("Session failed: {}", message);
                if self.state() == SessionState::SessionStarting {
                    self.failure = Some(message.clone());
                    self.link.transition(SessionState::Connected);
                }
                self.session_id = None;
                self.link.events.emit(SessionEvent::ServerError {
                    code: None,
                    message,
                });
            }
            ServerEvent::SessionFinished => {
                info!("Session finished");
                self.session_id = None;
                if self.state().is_active() || self.state() == SessionState::SessionEnding {
                    self.link.transition(SessionState::Connected);
                }
            }
            ServerEvent::UsageResponse => debug!("Usage report received"),
            ServerEvent::TtsSentenceStart => {
                let payload = parse_payload::<TtsSentenceStartPayload>(msg).unwrap_or_default();
                debug!("Sentence start: {:?}", payload.text);
                if self.discard_tts {
                    return;
                }
                if let Some(output) = self.output.as_mut() {
                    if output.stream_state() != StreamState::Active {
                        output.begin_stream();
                    }
                }
                if matches!(
                    self.state().phase(),
                    Some(ActivePhase::Listening) | Some(ActivePhase::AwaitingResponse)
                ) {
                    self.link
                        .transition(SessionState::SessionActive(ActivePhase::Speaking));
                }
                self.link
                    .events
                    .emit(SessionEvent::SynthesisStarted { text: payload.text });
            }
            ServerEvent::TtsSentenceEnd => debug!("Sentence end"),
            ServerEvent::TtsResponse => debug!("Non-audio TTS response, ignoring"),
            ServerEvent::TtsEnded => {
                if self.discard_tts {
                    self.discard_tts = false;
                } else if let Some(output) = self.output.as_mut() {
                    output.finish_stream();
                }
                info!("Synthesis ended");
                self.link.events.emit(SessionEvent::SynthesisEnded);
            }
            ServerEvent::AsrInfo => {
                debug!("Speech detected");
                self.link.events.emit(SessionEvent::SpeechDetected);
            }
            ServerEvent::AsrResponse => {
                let payload = parse_payload::<AsrResponsePayload>(msg).unwrap_or_default();
                if let Some(result) = payload.results.first() {
                    let text = result.text.trim();
                    if !text.is_empty() {
                        self.last_transcript = text.to_string();
                        self.link.events.emit(SessionEvent::Transcript {
                            text: text.to_string(),
                            is_final: !result.is_interim,
                        });
                    }
                }
            }
            ServerEvent::AsrEnded => {
                info!("Recognition ended: {:?}", self.last_transcript);
                self.link.events.emit(SessionEvent::RecognitionEnded {
                    text: self.last_transcript.clone(),
                });
                match self.state().phase() {
                    Some(ActivePhase::Recording) => {
                        // Remaining batched audio belongs to an utterance the
                        // server already closed
                        self.batcher.reset();
                        self.link
                            .transition(SessionState::SessionActive(ActivePhase::AwaitingResponse));
                        self.link.events.emit(SessionEvent::RecordingStopped {
                            reason: crate::vad::StopReason::EndOfUtterance,
                            text: self.last_transcript.clone(),
                        });
                    }
                    Some(ActivePhase::Listening) => self
                        .link
                        .transition(SessionState::SessionActive(ActivePhase::AwaitingResponse)),
                    _ => {}
                }
            }
            ServerEvent::ChatResponse => {
                let payload = parse_payload::<ChatResponsePayload>(msg).unwrap_or_default();
                if let Some(content) = payload.content.filter(|c| !c.is_empty()) {
                    self.link.events.emit(SessionEvent::ChatText { content });
                }
            }
            ServerEvent::ChatTextQueryConfirmed => debug!("Text query confirmed"),
            ServerEvent::ChatEnded => debug!("Chat reply complete"),
        }
    }
}

/// Parse a JSON payload, logging (not failing) on malformed input.
fn parse_payload<T: DeserializeOwned>(msg: &ProtocolMessage) -> Option<T> {
    match msg.parse_json::<T>() {
        Ok(value) => Some(value),
        Err(ProtocolError::Json(e)) if msg.payload.is_empty() => {
            debug!("Empty payload for event {:?}: {}", msg.event_id, e);
            None
        }
        Err(e) => {
            warn!("Malformed payload for event {:?}: {}", msg.event_id, e);
            None
        }
    }
}
