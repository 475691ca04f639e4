use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::state::SessionState;
use crate::vad::StopReason;

/// Everything a client reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    SessionStarted {
        session_id: String,
        dialog_id: Option<String>,
    },
    /// The server heard speech in the uplink
    SpeechDetected,
    Transcript {
        text: String,
        is_final: bool,
    },
    /// The server finished recognizing the current utterance
    RecognitionEnded {
        text: String,
    },
    RecordingStopped {
        reason: StopReason,
        text: String,
    },
    /// The recording window elapsed without any speech
    NoSpeechTimeout,
    SynthesisStarted {
        text: Option<String>,
    },
    /// All synthesized audio for the current reply has arrived
    SynthesisEnded,
    /// The playback ring drained after a finished stream
    PlaybackFinished,
    ChatText {
        content: String,
    },
    ServerError {
        code: Option<u32>,
        message: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Sending half of a client's event queue
///
/// Emitting never blocks the control loop: when the queue is full the event
/// is dropped with a warning.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
}

pub type EventReceiver = mpsc::Receiver<SessionEvent>;

/// Create a bounded event queue
pub fn event_channel(depth: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!("No event listener, dropping {:?}", event);
            }
        }
    }
}
