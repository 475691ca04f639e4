use std::fmt;

use serde::Serialize;

/// What an active session is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActivePhase {
    /// Idle, ready to record or to receive speech
    Listening,
    /// Uplink audio is flowing
    Recording,
    /// Recording ended, waiting for the server's reply
    AwaitingResponse,
    /// Synthesized audio is arriving or playing
    Speaking,
}

/// Lifecycle of a client link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    SessionStarting,
    SessionActive(ActivePhase),
    SessionEnding,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::SessionActive(_))
    }

    pub fn phase(&self) -> Option<ActivePhase> {
        match self {
            SessionState::SessionActive(phase) => Some(*phase),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Any state may drop to `Disconnected` when the transport goes away.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Disconnected {
            return true;
        }
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, SessionStarting) => true,
            (SessionStarting, SessionActive(_)) => true,
            // Start rejected or timed out
            (SessionStarting, Connected) => true,
            (SessionActive(a), SessionActive(b)) => *a != b,
            (SessionActive(_), SessionEnding) => true,
            // Task completed by the server
            (SessionActive(_), Connected) => true,
            (SessionEnding, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ActivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivePhase::Listening => "listening",
            ActivePhase::Recording => "recording",
            ActivePhase::AwaitingResponse => "awaiting response",
            ActivePhase::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::SessionStarting => f.write_str("session starting"),
            SessionState::SessionActive(phase) => write!(f, "session active ({})", phase),
            SessionState::SessionEnding => f.write_str("session ending"),
        }
    }
}
