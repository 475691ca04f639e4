// Integration tests for end-of-utterance detection
//
// The controller is driven with explicit instants, so no test sleeps.

use std::time::Duration;

use loqa_voicelink::vad::{StopReason, VadConfig, VoiceActivityController, STABILITY_THRESHOLD};
use tokio::time::Instant;

fn controller() -> (VoiceActivityController, Instant) {
    let mut vad = VoiceActivityController::new(VadConfig {
        silence_timeout: Duration::from_millis(1000),
        max_duration: Duration::from_secs(50),
    });
    let start = Instant::now();
    vad.begin(start);
    (vad, start)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_stable_transcript_stops_on_threshold() {
    let (mut vad, start) = controller();

    for i in 1..STABILITY_THRESHOLD {
        assert_eq!(vad.on_result("turn on the light", start + ms(i as u64 * 10)), None);
    }
    assert_eq!(
        vad.on_result("turn on the light", start + ms(100)),
        Some(StopReason::Stable)
    );
    assert!(!vad.is_armed());
    assert_eq!(vad.last_text(), "turn on the light");

    // Fires once per window
    assert_eq!(vad.on_result("turn on the light", start + ms(110)), None);
}

#[test]
fn test_changing_text_resets_the_run() {
    let (mut vad, start) = controller();

    for _ in 0..STABILITY_THRESHOLD - 1 {
        vad.on_result("turn on", start);
    }
    assert_eq!(vad.on_result("turn on the", start), None);
    assert_eq!(vad.window().map(|w| w.same_result_count), Some(1));
    assert_eq!(vad.last_text(), "turn on the");
}

#[test]
fn test_blank_results_are_ignored() {
    let (mut vad, start) = controller();

    assert_eq!(vad.on_result("   ", start + ms(10)), None);
    let window = vad.window().cloned().expect("window");
    assert!(!window.has_speech);
    assert_eq!(window.same_result_count, 0);

    // Whitespace does not make a different transcript
    vad.on_result("hello", start + ms(20));
    vad.on_result(" hello ", start + ms(30));
    assert_eq!(vad.window().map(|w| w.same_result_count), Some(2));
}

#[test]
fn test_silence_after_speech_stops() {
    let (mut vad, start) = controller();
    vad.on_result("hello", start + ms(500));

    assert_eq!(vad.poll(start + ms(1400)), None);
    assert_eq!(vad.poll(start + ms(1500)), Some(StopReason::Silence));
    assert_eq!(vad.poll(start + ms(1600)), None);
}

#[test]
fn test_silence_without_speech_does_not_stop() {
    let (mut vad, start) = controller();
    assert_eq!(vad.poll(start + ms(5000)), None);
    assert!(vad.is_armed());
}

#[test]
fn test_max_duration_without_speech_is_no_speech() {
    let (mut vad, start) = controller();
    assert_eq!(vad.poll(start + ms(49_999)), None);
    assert_eq!(vad.poll(start + ms(50_000)), Some(StopReason::NoSpeech));
}

#[test]
fn test_max_duration_is_checked_before_silence() {
    let (mut vad, start) = controller();
    vad.on_result("hello", start + ms(10));

    // Both conditions hold; the duration limit wins
    assert_eq!(vad.poll(start + ms(60_000)), Some(StopReason::MaxDuration));
}

#[test]
fn test_disarmed_controller_is_silent() {
    let (mut vad, start) = controller();
    vad.disarm();
    assert_eq!(vad.poll(start + ms(60_000)), None);

    // A new window re-arms it
    vad.begin(start + ms(60_000));
    assert!(vad.is_armed());
    assert_eq!(vad.last_text(), "");
    assert_eq!(vad.poll(start + ms(110_000)), Some(StopReason::NoSpeech));
}
