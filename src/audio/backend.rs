use anyhow::Result;
use tokio::sync::mpsc;

use super::file::WavFileBackend;

/// A block of captured audio (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Frame length in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let per_channel = self.samples.len() as u64 / self.channels.max(1) as u64;
        per_channel * 1000 / self.sample_rate.max(1) as u64
    }
}

/// Configuration for a capture backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Sample rate the link expects
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono)
    pub target_channels: u16,
    /// Samples delivered per frame
    pub samples_per_read: usize,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // 16kHz uplink
            target_channels: 1,        // Mono
            samples_per_read: 800,     // 50ms frames
        }
    }
}

impl AudioBackendConfig {
    pub fn from_config(audio: &crate::config::AudioConfig) -> Self {
        Self {
            target_sample_rate: audio.sample_rate,
            target_channels: audio.channels,
            samples_per_read: audio.samples_per_read,
        }
    }
}

/// Audio capture backend trait
///
/// The control loop polls the returned receiver with `try_recv`, so a
/// backend must never block the caller.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio playback sink
///
/// `write` must return within a bounded time. Returning fewer bytes than
/// offered (including 0) is backpressure; the rest is offered again.
#[async_trait::async_trait]
pub trait PlaybackSink: Send {
    /// Play (a prefix of) `pcm`, returning how many bytes were accepted
    async fn write(&mut self, pcm: &[u8]) -> Result<usize>;

    /// Called once per drained stream
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the drain task stops
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get sink name for logging
    fn name(&self) -> &str;
}

/// Sink that accepts and discards everything
#[derive(Debug, Default)]
pub struct NullSink {
    bytes: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_accepted(&self) -> u64 {
        self.bytes
    }
}

#[async_trait::async_trait]
impl PlaybackSink for NullSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        self.bytes += pcm.len() as u64;
        Ok(pcm.len())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create a capture backend for `source`
    pub fn create(source: AudioSource, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        match source {
            AudioSource::File(path) => Ok(Box::new(WavFileBackend::new(path, config))),
            AudioSource::Microphone => {
                anyhow::bail!("Microphone capture needs a platform driver; use a WAV file source")
            }
        }
    }
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Microphone input (platform driver)
    Microphone,
    /// WAV file replayed in real time
    File(String),
}
