//! JSON messages exchanged with the streaming synthesis service over text
//! frames. Audio comes back hex-encoded inside `data.audio`.

use serde::{Deserialize, Serialize};

use crate::config::SynthesizerConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SynthesisRequest {
    TaskStart {
        model: String,
        voice_setting: VoiceSetting,
        audio_setting: AudioSetting,
    },
    TaskContinue {
        text: String,
    },
    TaskFinish,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSetting {
    pub voice_id: String,
    pub speed: f32,
    pub vol: f32,
    pub pitch: i32,
    pub english_normalization: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSetting {
    pub sample_rate: u32,
    pub bitrate: u32,
    pub format: String,
    pub channel: u16,
}

impl SynthesisRequest {
    pub fn task_start(config: &SynthesizerConfig) -> Self {
        SynthesisRequest::TaskStart {
            model: config.model.clone(),
            voice_setting: VoiceSetting {
                voice_id: config.voice_id.clone(),
                speed: config.speed,
                vol: config.volume,
                pitch: config.pitch,
                english_normalization: config.english_normalization,
            },
            audio_setting: AudioSetting {
                sample_rate: config.sample_rate,
                bitrate: config.bitrate,
                format: config.format.clone(),
                channel: config.channels,
            },
        }
    }
}

/// Any server message. Every field is optional; audio chunks may arrive
/// without an `event`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SynthesisResponse {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Option<SynthesisData>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub base_resp: Option<BaseResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SynthesisData {
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseResponse {
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub status_msg: Option<String>,
}

impl SynthesisResponse {
    /// Hex audio payload, if present and non-empty.
    pub fn audio_hex(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.audio.as_deref())
            .filter(|a| !a.is_empty())
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.base_resp.as_ref().and_then(|b| b.status_msg.clone()))
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_start_shape() {
        let value = serde_json::to_value(SynthesisRequest::task_start(&SynthesizerConfig::default()))
            .unwrap();
        assert_eq!(value["event"], "task_start");
        assert_eq!(value["voice_setting"]["voice_id"], "male-qn-qingse");
        assert_eq!(value["audio_setting"]["sample_rate"], 16000);
        assert_eq!(value["audio_setting"]["channel"], 1);
    }

    #[test]
    fn test_task_finish_is_bare_event() {
        let json = serde_json::to_string(&SynthesisRequest::TaskFinish).unwrap();
        assert_eq!(json, r#"{"event":"task_finish"}"#);
    }
}
