// Integration tests for WAV file sources and sinks
//
// Fixtures are generated into a temp directory with hound.

use std::path::Path;

use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use loqa_voicelink::audio::{
    AudioBackend, AudioBackendConfig, AudioFile, PlaybackSink, WavFileBackend, WavFileSink,
};

fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) -> Result<()> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[test]
fn test_audio_file_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("speech.wav");
    write_wav(&path, 16000, 1, &vec![100i16; 8000])?;

    let audio = AudioFile::open(&path)?;

    assert_eq!(audio.sample_rate, 16000);
    assert_eq!(audio.channels, 1);
    assert_eq!(audio.samples.len(), 8000);
    assert!((audio.duration_seconds - 0.5).abs() < 1e-9);
    assert!(audio.path.contains("speech.wav"));
    Ok(())
}

#[test]
fn test_audio_file_nonexistent() {
    let result = AudioFile::open("/nonexistent/path/to/audio.wav");
    assert!(result.is_err(), "Opening nonexistent file should fail");
}

#[test]
fn test_audio_file_rejects_8_bit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("8bit.wav");
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 8,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec)?;
    writer.write_sample(0i8)?;
    writer.finalize()?;

    assert!(AudioFile::open(&path).is_err());
    Ok(())
}

#[test]
fn test_uplink_samples_downmix_stereo() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stereo.wav");
    write_wav(&path, 16000, 2, &[100, 300, -200, -400, 7, 8])?;

    let audio = AudioFile::open(&path)?;
    assert_eq!(audio.uplink_samples(16000)?, vec![200, -300, 7]);
    Ok(())
}

#[test]
fn test_uplink_samples_require_matching_rate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cd.wav");
    write_wav(&path, 44100, 1, &[1, 2, 3])?;

    let audio = AudioFile::open(&path)?;
    assert!(audio.uplink_samples(16000).is_err(), "Resampling is not supported");
    Ok(())
}

#[tokio::test]
async fn test_file_backend_replays_in_frames() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("replay.wav");
    let samples: Vec<i16> = (0..2000).map(|i| i as i16).collect();
    write_wav(&path, 16000, 1, &samples)?;

    let config = AudioBackendConfig {
        target_sample_rate: 16000,
        target_channels: 1,
        samples_per_read: 800,
    };
    let mut backend = WavFileBackend::new(path.display().to_string(), config);
    let mut frames = backend.start().await?;
    assert!(backend.start().await.is_err(), "A running backend cannot start twice");

    let mut replayed = Vec::new();
    let mut timestamps = Vec::new();
    while let Some(frame) = frames.recv().await {
        timestamps.push(frame.timestamp_ms);
        replayed.extend(frame.samples);
    }

    assert_eq!(timestamps, vec![0, 50, 100]);
    assert_eq!(replayed, samples);

    backend.stop().await?;
    assert!(!backend.is_capturing());
    Ok(())
}

#[tokio::test]
async fn test_wav_sink_joins_split_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.wav");

    let mut sink = WavFileSink::create(&path, 24000, 1)?;
    let pcm: Vec<u8> = [1000i16, -2000, 3000]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    // Split inside the second sample
    assert_eq!(sink.write(&pcm[..3]).await?, 3);
    assert_eq!(sink.write(&pcm[3..]).await?, 3);
    sink.flush().await?;
    sink.close().await?;
    assert_eq!(sink.bytes_written(), 6);

    let mut reader = WavReader::open(&path)?;
    assert_eq!(reader.spec().sample_rate, 24000);
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(samples, vec![1000, -2000, 3000]);

    assert!(sink.write(&pcm).await.is_err(), "Closed sink rejects writes");
    Ok(())
}
