use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame, PlaybackSink};

/// A fully loaded 16-bit WAV file
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
            anyhow::bail!(
                "Expected 16-bit integer PCM, got {}-bit {:?}",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Samples in the link's uplink format, downmixing stereo to mono.
    pub fn uplink_samples(&self, sample_rate: u32) -> Result<Vec<i16>> {
        if self.sample_rate != sample_rate {
            anyhow::bail!(
                "Resampling is not supported. Expected {}Hz, got {}Hz",
                sample_rate,
                self.sample_rate
            );
        }

        match self.channels {
            1 => Ok(self.samples.clone()),
            2 => Ok(self
                .samples
                .chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
                .collect()),
            n => anyhow::bail!("Unsupported channel count: {}", n),
        }
    }
}

/// Capture backend that replays a WAV file in real-time paced frames
pub struct WavFileBackend {
    path: String,
    config: AudioBackendConfig,
    is_capturing: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WavFileBackend {
    pub fn new(path: impl Into<String>, config: AudioBackendConfig) -> Self {
        Self {
            path: path.into(),
            config,
            is_capturing: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for WavFileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.is_capturing.load(Ordering::SeqCst) {
            anyhow::bail!("{} is already capturing", self.path);
        }

        let file = AudioFile::open(&self.path)?;
        let samples = file.uplink_samples(self.config.target_sample_rate)?;
        let sample_rate = self.config.target_sample_rate;
        let per_frame = self.config.samples_per_read.max(1);
        let frame_interval =
            Duration::from_micros(per_frame as u64 * 1_000_000 / sample_rate.max(1) as u64);

        let (tx, rx) = mpsc::channel(100);
        let is_capturing = self.is_capturing.clone();
        is_capturing.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_interval);
            let mut sent = 0usize;

            for (index, block) in samples.chunks(per_frame).enumerate() {
                if !is_capturing.load(Ordering::SeqCst) {
                    break;
                }
                interval.tick().await;

                let frame = AudioFrame {
                    samples: block.to_vec(),
                    sample_rate,
                    channels: 1,
                    timestamp_ms: (index * per_frame) as u64 * 1000 / sample_rate.max(1) as u64,
                };
                if tx.send(frame).await.is_err() {
                    debug!("Frame receiver dropped, stopping file replay");
                    break;
                }
                sent += 1;
            }

            is_capturing.store(false, Ordering::SeqCst);
            info!("File replay finished after {} frames", sent);
        });

        *self.task.lock().await = Some(handle);
        info!("Replaying {} in {}-sample frames", self.path, per_frame);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.is_capturing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("File replay task failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}

/// Playback sink that records synthesized PCM into a WAV file
pub struct WavFileSink {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    bytes_written: u64,
    /// Odd trailing byte carried over to the next write
    carry: Option<u8>,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, channels: u16) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file {}", path.display()))?;

        info!("Writing playback to {} ({}Hz)", path.display(), sample_rate);
        Ok(Self {
            path,
            writer: Some(writer),
            bytes_written: 0,
            carry: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait::async_trait]
impl PlaybackSink for WavFileSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .context("WAV sink already closed")?;

        let mut bytes = pcm;
        if let Some(low) = self.carry.take() {
            if let Some((&high, rest)) = bytes.split_first() {
                writer.write_sample(i16::from_le_bytes([low, high]))?;
                bytes = rest;
            } else {
                self.carry = Some(low);
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }

        self.bytes_written += pcm.len() as u64;
        Ok(pcm.len())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().context("Failed to flush WAV file")?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
            info!(
                "Playback file {} complete ({} bytes)",
                self.path.display(),
                self.bytes_written
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}
