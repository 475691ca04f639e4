//! Streaming speech recognition over the simple protocol profile, with
//! client-side end-of-utterance detection.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SessionConfig;
use super::events::{event_channel, EventReceiver, SessionEvent};
use super::link::Link;
use super::state::{ActivePhase, SessionState};
use super::stats::SessionStats;
use crate::audio::{AudioBatcher, MemoryPools};
use crate::config::RecognizerConfig;
use crate::error::{Result, SessionError, TransportError};
use crate::protocol::codec::{self, Profile, ProtocolMessage};
use crate::protocol::events::{
    ErrorPayload, RecognitionApp, RecognitionAudio, RecognitionParams, RecognitionRequest,
    RecognitionResponse, RecognitionUser,
};
use crate::protocol::header::{MessageType, Serialization};
use crate::vad::{StopReason, VadConfig, VoiceActivityController};
use crate::ws::{Connector, UpgradeRequest};

pub struct RecognizerClient<C: Connector> {
    link: Link<C>,
    settings: RecognizerConfig,
    config: SessionConfig,
    uid: String,
    vad: VoiceActivityController,
    batcher: AudioBatcher,
    /// An end-of-audio marker went out on the current connection
    end_marker_sent: bool,
    recognized_text: String,
}

impl<C: Connector> RecognizerClient<C> {
    pub fn new(
        connector: C,
        settings: RecognizerConfig,
        vad: VadConfig,
        config: SessionConfig,
        pools: Arc<MemoryPools>,
    ) -> (Self, EventReceiver) {
        let request = UpgradeRequest::new(settings.endpoint.clone())
            .header("x-api-key", settings.api_key.as_str());

        let (events, rx) = event_channel(config.event_queue_depth);
        let link = Link::new(connector, request, config.connection.clone(), pools, events);
        let uid = settings
            .uid
            .clone()
            .unwrap_or_else(|| format!("voicelink-{}", Uuid::new_v4().simple()));

        let client = Self {
            link,
            batcher: AudioBatcher::new(config.batch.clone()),
            vad: VoiceActivityController::new(vad),
            settings,
            config,
            uid,
            end_marker_sent: false,
            recognized_text: String::new(),
        };
        (client, rx)
    }

    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    pub fn is_recording(&self) -> bool {
        self.state().phase() == Some(ActivePhase::Recording)
    }

    /// Transcript captured when the last recording stopped
    pub fn recognized_text(&self) -> &str {
        &self.recognized_text
    }

    pub fn stats(&self) -> SessionStats {
        self.link.stats()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.link.connect().await?;
        self.end_marker_sent = false;
        Ok(())
    }

    /// Open a recognition request and start the VAD window.
    ///
    /// The service accepts one end-of-audio marker per connection, so after
    /// a finished recording this reconnects first.
    pub async fn start_recording(&mut self) -> Result<()> {
        if self.end_marker_sent {
            info!("End-of-audio already sent on this connection, reconnecting");
            self.link.close().await;
            self.end_marker_sent = false;
        }
        if self.state() == SessionState::Disconnected {
            self.connect().await?;
        }
        self.link
            .require("start recording", self.state() == SessionState::Connected)?;

        self.link.transition(SessionState::SessionStarting);
        let request = self.full_request();
        let msg = ProtocolMessage::json(MessageType::ClientFullRequest, &request)?;
        self.link.send_binary(&codec::encode(&msg, Profile::Simple)).await?;
        debug!("Recognition request {} sent", request.request.reqid);

        self.batcher.reset();
        self.recognized_text.clear();
        self.vad.begin(Instant::now());
        self.link
            .transition(SessionState::SessionActive(ActivePhase::Recording));
        info!("Recording started");
        Ok(())
    }

    /// Batch and send captured samples. Ignored when not recording, so a
    /// capture loop may keep feeding after an automatic stop.
    pub async fn send_samples(&mut self, samples: &[i16]) -> Result<()> {
        if !self.is_recording() {
            debug!("Not recording, dropping {} samples", samples.len());
            return Ok(());
        }
        for batch in self.batcher.push(samples) {
            self.send_audio_chunk(batch).await?;
        }
        Ok(())
    }

    pub async fn stop_recording(&mut self) -> Result<()> {
        self.stop_with(StopReason::Manual).await
    }

    /// One control-loop iteration: stop checks, then at most one message.
    pub async fn poll(&mut self) -> Result<()> {
        if self.is_recording() {
            if let Some(reason) = self.vad.poll(Instant::now()) {
                return self.stop_with(reason).await;
            }
        }

        if !self.link.is_connected() {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        }

        let message = match self.link.recv(self.config.poll_interval).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            // The service hangs up once it has the end-of-audio marker
            Err(SessionError::Transport(TransportError::Closed)) if self.end_marker_sent => {
                info!("Recognition connection closed after end of audio");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match codec::decode(&message.payload, Profile::Simple) {
            Ok(Some(msg)) => self.handle(msg).await,
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

    pub async fn disconnect(&mut self) -> Result<()> {
        self.link.close().await;
        self.end_marker_sent = false;
        Ok(())
    }

    async fn stop_with(&mut self, reason: StopReason) -> Result<()> {
        if !self.is_recording() {
            return Ok(());
        }
        self.vad.disarm();

        if let Some(rest) = self.batcher.flush() {
            self.send_audio_chunk(rest).await?;
        }
        self.link
            .send_binary(&codec::encode(&ProtocolMessage::end_of_audio(), Profile::Simple))
            .await?;
        self.end_marker_sent = true;

        self.recognized_text = self.vad.last_text().to_string();
        self.link.transition(SessionState::SessionEnding);
        info!("Recording stopped ({:?}): {:?}", reason, self.recognized_text);

        self.link.events.emit(SessionEvent::RecordingStopped {
            reason,
            text: self.recognized_text.clone(),
        });
        if reason == StopReason::NoSpeech {
            self.link.events.emit(SessionEvent::NoSpeechTimeout);
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ProtocolMessage) -> Result<()> {
        match msg.message_type {
            MessageType::ServerError => {
                let message = msg
                    .parse_json::<ErrorPayload>()
                    .map(|p| p.describe())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&msg.payload).into_owned());
                warn!("Server error {:?}: {}", msg.error_code, message);
                self.link.events.emit(SessionEvent::ServerError {
                    code: msg.error_code,
                    message,
                });
                Ok(())
            }
            MessageType::ServerFullResponse | MessageType::ServerAck
                if msg.serialization == Serialization::Json =>
            {
                let response = match msg.parse_json::<RecognitionResponse>() {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Malformed recognition response: {}", e);
                        self.link.stats.messages_dropped += 1;
                        return Ok(());
                    }
                };
                self.on_response(&msg, response).await
            }
            other => {
                debug!("Ignoring {:?} message", other);
                Ok(())
            }
        }
    }

    async fn on_response(&mut self, msg: &ProtocolMessage, response: RecognitionResponse) -> Result<()> {
        if !response.is_success() {
            let message = response
                .message
                .clone()
                .unwrap_or_else(|| "recognition failed".to_string());
            warn!("Recognition error {:?}: {}", response.code, message);
            self.link.events.emit(SessionEvent::ServerError {
                code: response.code.and_then(|c| u32::try_from(c).ok()),
                message,
            });
            return Ok(());
        }

        let text = response.best_text();
        if !text.is_empty() {
            self.link.events.emit(SessionEvent::Transcript {
                text: text.to_string(),
                is_final: false,
            });
        }

        let last = msg.is_last() || msg.sequence.is_some_and(|s| s < 0);
        if last {
            let final_text = if text.is_empty() {
                self.vad.last_text().to_string()
            } else {
                text.to_string()
            };
            info!("Final recognition result: {:?}", final_text);
            self.recognized_text = final_text.clone();
            self.link
                .events
                .emit(SessionEvent::RecognitionEnded { text: final_text });
        }

        let text = text.to_string();
        if let Some(reason) = self.vad.on_result(&text, Instant::now()) {
            self.stop_with(reason).await?;
        }
        Ok(())
    }

    async fn send_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        let len = chunk.len() as u64;
        let msg = ProtocolMessage::audio(chunk);
        self.link.send_binary(&codec::encode(&msg, Profile::Simple)).await?;
        self.link.stats.audio_chunks_sent += 1;
        self.link.stats.audio_bytes_sent += len;
        Ok(())
    }

    fn full_request(&self) -> RecognitionRequest {
        RecognitionRequest {
            app: RecognitionApp {
                cluster: self.settings.cluster.clone(),
            },
            user: RecognitionUser {
                uid: self.uid.clone(),
            },
            request: RecognitionParams {
                reqid: Uuid::new_v4().to_string(),
                nbest: 1,
                workflow: self.settings.workflow.clone(),
                result_type: "full".to_string(),
                sequence: 1,
            },
            audio: RecognitionAudio {
                format: "raw".to_string(),
                rate: self.config.sample_rate,
                bits: self.config.bits_per_sample,
                channel: self.config.channels,
                codec: "raw".to_string(),
            },
        }
    }
}
