use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::SessionState;

/// Counters for one client link
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Current lifecycle state
    pub state: SessionState,

    /// When the client was created
    pub created_at: DateTime<Utc>,

    /// When the current session became active, if one is
    pub session_started_at: Option<DateTime<Utc>>,

    /// Number of successful handshakes
    pub connections: u32,

    /// Uplink audio messages sent
    pub audio_chunks_sent: u64,

    /// Uplink audio bytes sent
    pub audio_bytes_sent: u64,

    /// Synthesized audio bytes written to the playback ring
    pub playback_bytes_received: u64,

    /// Inbound messages that could not be decoded
    pub messages_dropped: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            created_at: Utc::now(),
            session_started_at: None,
            connections: 0,
            audio_chunks_sent: 0,
            audio_bytes_sent: 0,
            playback_bytes_received: 0,
            messages_dropped: 0,
        }
    }

    /// Seconds since the current session became active
    pub fn session_duration_secs(&self) -> f64 {
        self.session_started_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
