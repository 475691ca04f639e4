use std::time::Duration;

use crate::audio::{ChunkConfig, PlaybackConfig};
use crate::config::Config;
use crate::ws::ConnectionConfig;

/// Runtime parameters shared by every client
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport limits and timeouts
    pub connection: ConnectionConfig,

    /// Longest wait for a session or task start acknowledgment
    /// Default: 3 seconds
    pub session_start_timeout: Duration,

    /// How long one `poll` waits for an inbound message
    pub poll_interval: Duration,

    /// Uplink batching
    pub batch: ChunkConfig,

    /// Playback drain behaviour
    pub playback: PlaybackConfig,

    /// Uplink sample rate in Hz
    pub sample_rate: u32,

    /// Uplink bits per sample
    pub bits_per_sample: u16,

    /// Uplink channel count
    pub channels: u16,

    /// Capacity of the event queue
    pub event_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            session_start_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(10),
            batch: ChunkConfig::default(),
            playback: PlaybackConfig::default(),
            sample_rate: 16000, // 16kHz uplink
            bits_per_sample: 16,
            channels: 1, // Mono
            event_queue_depth: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection: ConnectionConfig {
                handshake_timeout: config.timeouts.handshake(),
                payload_timeout: config.timeouts.payload(),
                max_frame_payload: config.memory.max_frame_payload,
                max_message_size: config.memory.max_message_bytes,
            },
            session_start_timeout: config.timeouts.session_start(),
            poll_interval: config.timeouts.poll_interval(),
            batch: ChunkConfig::from_config(&config.audio),
            playback: PlaybackConfig {
                max_chunk_bytes: config.audio.playback_chunk_bytes,
                ..PlaybackConfig::default()
            },
            sample_rate: config.audio.sample_rate,
            bits_per_sample: config.audio.bits_per_sample,
            channels: config.audio.channels,
            event_queue_depth: config.service.event_queue_depth,
        }
    }
}
