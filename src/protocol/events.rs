//! Event ids and JSON payloads of the event/session profile, plus the
//! request/response bodies of the simple (recognition) profile.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    StartConnection,
    FinishConnection,
    StartSession,
    FinishSession,
    /// Uplink audio chunk
    TaskRequest,
    SayHello,
    ChatTtsText,
    ChatTextQuery,
}

impl ClientEvent {
    pub fn id(self) -> i32 {
        match self {
            ClientEvent::StartConnection => 1,
            ClientEvent::FinishConnection => 2,
            ClientEvent::StartSession => 100,
            ClientEvent::FinishSession => 102,
            ClientEvent::TaskRequest => 200,
            ClientEvent::SayHello => 300,
            ClientEvent::ChatTtsText => 500,
            ClientEvent::ChatTextQuery => 501,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    ConnectionStarted,
    ConnectionFailed,
    ConnectionFinished,
    SessionStarted,
    SessionFinished,
    SessionFailed,
    UsageResponse,
    TtsSentenceStart,
    TtsSentenceEnd,
    /// Downlink synthesized audio
    TtsResponse,
    TtsEnded,
    /// Speech detected in the uplink audio
    AsrInfo,
    AsrResponse,
    AsrEnded,
    ChatResponse,
    ChatTextQueryConfirmed,
    ChatEnded,
}

impl ServerEvent {
    pub fn from_id(id: i32) -> Option<Self> {
        let event = match id {
            50 => ServerEvent::ConnectionStarted,
            51 => ServerEvent::ConnectionFailed,
            52 => ServerEvent::ConnectionFinished,
            150 => ServerEvent::SessionStarted,
            152 => ServerEvent::SessionFinished,
            153 => ServerEvent::SessionFailed,
            154 => ServerEvent::UsageResponse,
            350 => ServerEvent::TtsSentenceStart,
            351 => ServerEvent::TtsSentenceEnd,
            352 => ServerEvent::TtsResponse,
            359 => ServerEvent::TtsEnded,
            450 => ServerEvent::AsrInfo,
            451 => ServerEvent::AsrResponse,
            459 => ServerEvent::AsrEnded,
            550 => ServerEvent::ChatResponse,
            553 => ServerEvent::ChatTextQueryConfirmed,
            559 => ServerEvent::ChatEnded,
            _ => return None,
        };
        Some(event)
    }

    pub fn id(self) -> i32 {
        match self {
            ServerEvent::ConnectionStarted => 50,
            ServerEvent::ConnectionFailed => 51,
            ServerEvent::ConnectionFinished => 52,
            ServerEvent::SessionStarted => 150,
            ServerEvent::SessionFinished => 152,
            ServerEvent::SessionFailed => 153,
            ServerEvent::UsageResponse => 154,
            ServerEvent::TtsSentenceStart => 350,
            ServerEvent::TtsSentenceEnd => 351,
            ServerEvent::TtsResponse => 352,
            ServerEvent::TtsEnded => 359,
            ServerEvent::AsrInfo => 450,
            ServerEvent::AsrResponse => 451,
            ServerEvent::AsrEnded => 459,
            ServerEvent::ChatResponse => 550,
            ServerEvent::ChatTextQueryConfirmed => 553,
            ServerEvent::ChatEnded => 559,
        }
    }
}

/// Connection-scoped events never carry a session id on the wire.
pub fn is_connection_scoped(event_id: i32) -> bool {
    matches!(event_id, 1 | 2 | 50 | 51 | 52)
}

// ---- event/session profile payloads ----

#[derive(Debug, Clone, Serialize)]
pub struct StartSessionPayload {
    pub asr: AsrSection,
    pub tts: TtsSection,
    pub dialog: DialogSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsrSection {
    pub extra: AsrExtra,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsrExtra {
    pub end_smooth_window_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsSection {
    pub speaker: String,
    pub audio_config: TtsAudioConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsAudioConfig {
    pub channel: u16,
    pub format: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogSection {
    pub bot_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaking_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_id: Option<String>,
    pub extra: DialogExtra,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogExtra {
    pub input_mod: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionStartedPayload {
    #[serde(default)]
    pub dialog_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsrResponsePayload {
    #[serde(default)]
    pub results: Vec<AsrResultItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsrResultItem {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_interim: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TtsSentenceStartPayload {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponsePayload {
    #[serde(default)]
    pub content: Option<String>,
}

/// Body of server error messages and failure events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorPayload {
    pub fn describe(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unspecified error".to_string())
    }
}

/// Body of SayHello and ChatTextQuery.
#[derive(Debug, Clone, Serialize)]
pub struct ContentPayload {
    pub content: String,
}

/// Body of ChatTtsText: a complete utterance is sent as one start+end chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTtsTextPayload {
    pub start: bool,
    pub content: String,
    pub end: bool,
}

// ---- simple profile (recognition) ----

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionRequest {
    pub app: RecognitionApp,
    pub user: RecognitionUser,
    pub request: RecognitionParams,
    pub audio: RecognitionAudio,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionApp {
    pub cluster: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionUser {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionParams {
    pub reqid: String,
    pub nbest: u32,
    pub workflow: String,
    pub result_type: String,
    pub sequence: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionAudio {
    pub format: String,
    pub rate: u32,
    pub bits: u16,
    pub channel: u16,
    pub codec: String,
}

/// Response codes that mean success.
pub const RECOGNITION_OK_CODES: [i64; 2] = [1000, 1013];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionResponse {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Vec<RecognitionResult>,
}

impl RecognitionResponse {
    pub fn is_success(&self) -> bool {
        self.code.map_or(true, |code| RECOGNITION_OK_CODES.contains(&code))
    }

    /// First hypothesis, or `""` when there is none or it is blank.
    pub fn best_text(&self) -> &str {
        self.result
            .first()
            .map(|r| r.text.trim())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub text: String,
}
