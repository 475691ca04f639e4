//! Session clients
//!
//! Each client owns one WebSocket link and drives it from a single control
//! loop:
//! - `DialogClient` runs the event-coded realtime dialogue protocol
//! - `RecognizerClient` streams audio for recognition and stops on its own
//!   when the transcript settles
//! - `SynthesizerClient` streams text for synthesis into a playback ring
//!
//! Clients report progress through a bounded `SessionEvent` queue.

mod config;
mod dialog;
mod events;
mod link;
mod recognizer;
mod state;
mod stats;
mod synthesizer;

pub use config::SessionConfig;
pub use dialog::DialogClient;
pub use events::{event_channel, EventReceiver, EventSender, SessionEvent};
pub use recognizer::RecognizerClient;
pub use state::{ActivePhase, SessionState};
pub use stats::SessionStats;
pub use synthesizer::SynthesizerClient;
