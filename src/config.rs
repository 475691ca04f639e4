use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub timeouts: TimeoutConfig,
    pub memory: MemoryConfig,
    pub vad: VadSettings,
    pub recognizer: RecognizerConfig,
    pub dialog: DialogConfig,
    pub synthesizer: SynthesizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Depth of each client's event queue
    pub event_queue_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voicelink".to_string(),
            event_queue_depth: 256,
        }
    }
}

/// Host, port and request path of a WebSocket service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Value for the `Host` header; the port is omitted when it is 443.
    pub fn host_header(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wss://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    /// Samples pulled from the capture source per read
    pub samples_per_read: usize,
    /// Bytes of PCM per outbound audio message
    pub batch_bytes: usize,
    /// Drop the 0 / -1 / 1 samples some capture drivers emit when idle
    pub filter_sentinels: bool,
    /// Largest write handed to the playback sink
    pub playback_chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,       // 16kHz capture
            bits_per_sample: 16,      // PCM s16le
            channels: 1,              // Mono
            samples_per_read: 800,    // 50ms at 16kHz
            batch_bytes: 3200,        // 100ms at 16kHz
            filter_sentinels: true,
            playback_chunk_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    /// Longest wait for the rest of a frame once its header has arrived
    pub payload_ms: u64,
    /// Longest wait for a session or task start acknowledgment
    pub session_start_ms: u64,
    /// How long one poll iteration waits for an inbound message
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 10_000,
            payload_ms: 5_000,
            session_start_ms: 3_000,
            poll_interval_ms: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn payload(&self) -> Duration {
        Duration::from_millis(self.payload_ms)
    }

    pub fn session_start(&self) -> Duration {
        Duration::from_millis(self.session_start_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Budget of the preferred (fast) pool
    pub fast_pool_bytes: usize,
    /// Budget of the general fallback pool
    pub general_pool_bytes: usize,
    pub max_frame_payload: usize,
    pub max_message_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            fast_pool_bytes: 8 * 1024 * 1024,
            general_pool_bytes: 2 * 1024 * 1024,
            max_frame_payload: 1_000_000,
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    pub silence_timeout_ms: u64,
    pub max_duration_ms: u64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 1_000,
            max_duration_ms: 50_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub endpoint: EndpointConfig,
    pub api_key: String,
    pub cluster: String,
    /// Stable user id; a random one is generated when unset
    pub uid: Option<String>,
    pub workflow: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::new("openspeech.bytedance.com", 443, "/api/v2/asr"),
            api_key: String::new(),
            cluster: "volcengine_input_en".to_string(),
            uid: None,
            workflow: "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate".to_string(),
        }
    }
}

/// Dialog model family: "O" takes a speaking style, "SC" a character manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DialogModel {
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "SC")]
    Character,
}

impl DialogModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogModel::Open => "O",
            DialogModel::Character => "SC",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    pub endpoint: EndpointConfig,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    pub model: DialogModel,
    pub speaker: String,
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    pub character_manifest: String,
    pub end_smooth_window_ms: u32,
    /// Sample rate of synthesized speech
    pub output_sample_rate: u32,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::new(
                "openspeech.bytedance.com",
                443,
                "/api/v3/realtime/dialogue",
            ),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: "volc.speech.dialog".to_string(),
            app_key: "PlgvMymc7f3tQnJ6".to_string(),
            model: DialogModel::Open,
            speaker: "zh_female_vv_jupiter_bigtts".to_string(),
            bot_name: "Doubao".to_string(),
            system_role: String::new(),
            speaking_style: String::new(),
            character_manifest: String::new(),
            end_smooth_window_ms: 1500,
            output_sample_rate: 24000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    pub endpoint: EndpointConfig,
    pub api_key: String,
    pub model: String,
    pub voice_id: String,
    pub speed: f32,
    pub volume: f32,
    pub pitch: i32,
    pub english_normalization: bool,
    pub sample_rate: u32,
    pub bitrate: u32,
    pub format: String,
    pub channels: u16,
    /// Playback ring size for synthesized audio
    pub ring_bytes: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::new("api.minimaxi.com", 443, "/ws/v1/t2a_v2"),
            api_key: String::new(),
            model: "speech-2.6-hd".to_string(),
            voice_id: "male-qn-qingse".to_string(),
            speed: 1.0,
            volume: 1.0,
            pitch: 0,
            english_normalization: false,
            sample_rate: 16000,
            bitrate: 32000,
            format: "pcm".to_string(),
            channels: 1,
            ring_bytes: 512 * 1024,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `VOICELINK__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("VOICELINK").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_constants() {
        let config = Config::default();
        assert_eq!(config.audio.batch_bytes, 3200);
        assert_eq!(config.dialog.output_sample_rate, 24000);
        assert_eq!(config.recognizer.endpoint.path, "/api/v2/asr");
        assert_eq!(config.timeouts.handshake(), Duration::from_secs(10));
    }

    #[test]
    fn test_host_header_omits_default_port() {
        assert_eq!(EndpointConfig::new("a.example", 443, "/").host_header(), "a.example");
        assert_eq!(
            EndpointConfig::new("127.0.0.1", 9000, "/").host_header(),
            "127.0.0.1:9000"
        );
    }
}
