//! Client-side end-of-utterance detection for the recognizer.
//!
//! The controller is a pure state machine over `tokio::time::Instant`s fed
//! by the caller, so it can be driven deterministically in tests.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::VadSettings;

/// Identical consecutive results that count as a stable transcript.
pub const STABILITY_THRESHOLD: u32 = 10;

/// Why a recording stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The same non-empty transcript arrived repeatedly
    Stable,
    /// Speech was followed by silence
    Silence,
    /// Hit the maximum duration after speech
    MaxDuration,
    /// Hit the maximum duration without any speech
    NoSpeech,
    /// The server signalled the end of the utterance
    EndOfUtterance,
    /// The caller stopped it
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub silence_timeout: Duration,
    pub max_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_millis(1000),
            max_duration: Duration::from_secs(50),
        }
    }
}

impl From<&VadSettings> for VadConfig {
    fn from(settings: &VadSettings) -> Self {
        Self {
            silence_timeout: Duration::from_millis(settings.silence_timeout_ms),
            max_duration: Duration::from_millis(settings.max_duration_ms),
        }
    }
}

/// Per-recording state.
#[derive(Debug, Clone)]
pub struct RecordingWindow {
    pub start_time: Instant,
    pub last_speech_time: Option<Instant>,
    pub has_speech: bool,
    pub same_result_count: u32,
    pub last_result_text: String,
}

impl RecordingWindow {
    fn new(now: Instant) -> Self {
        Self {
            start_time: now,
            last_speech_time: None,
            has_speech: false,
            same_result_count: 0,
            last_result_text: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct VoiceActivityController {
    config: VadConfig,
    window: Option<RecordingWindow>,
    armed: bool,
}

impl VoiceActivityController {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            window: None,
            armed: false,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Start a fresh window; stop checks are live until one fires.
    pub fn begin(&mut self, now: Instant) {
        self.window = Some(RecordingWindow::new(now));
        self.armed = true;
    }

    /// Stop evaluating without clearing the window.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn window(&self) -> Option<&RecordingWindow> {
        self.window.as_ref()
    }

    /// Most recent non-empty transcript of the current window.
    pub fn last_text(&self) -> &str {
        self.window
            .as_ref()
            .map(|w| w.last_result_text.as_str())
            .unwrap_or_default()
    }

    /// Record a recognition result. Blank results are ignored.
    ///
    /// Returns [`StopReason::Stable`] on the result that brings the run of
    /// identical texts to the threshold.
    pub fn on_result(&mut self, text: &str, now: Instant) -> Option<StopReason> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let window = self.window.as_mut()?;

        window.has_speech = true;
        window.last_speech_time = Some(now);

        if text == window.last_result_text {
            window.same_result_count += 1;
        } else {
            window.same_result_count = 1;
            window.last_result_text = text.to_string();
        }
        debug!(
            "Result {:?} seen {} time(s)",
            text, window.same_result_count
        );

        if self.armed && window.same_result_count >= STABILITY_THRESHOLD {
            info!("Transcript stable after {} identical results", window.same_result_count);
            self.armed = false;
            return Some(StopReason::Stable);
        }
        None
    }

    /// Evaluate the time-based stop conditions.
    pub fn poll(&mut self, now: Instant) -> Option<StopReason> {
        if !self.armed {
            return None;
        }
        let window = self.window.as_ref()?;

        let elapsed = now.saturating_duration_since(window.start_time);
        if elapsed >= self.config.max_duration {
            self.armed = false;
            return Some(if window.has_speech {
                info!("Maximum recording duration reached");
                StopReason::MaxDuration
            } else {
                info!("No speech within {:?}", self.config.max_duration);
                StopReason::NoSpeech
            });
        }

        if let (true, Some(last)) = (window.has_speech, window.last_speech_time) {
            if now.saturating_duration_since(last) >= self.config.silence_timeout {
                info!("Silence after speech, stopping");
                self.armed = false;
                return Some(StopReason::Silence);
            }
        }

        None
    }
}
