use tracing::debug;

/// Samples some capture drivers emit while the line is idle
pub const SENTINEL_SAMPLES: [i16; 3] = [0, -1, 1];

/// Uplink batch configuration
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Bytes of little-endian PCM per outbound batch (default: 3200 = 100ms at 16kHz)
    pub batch_bytes: usize,
    /// Drop sentinel samples before batching
    pub filter_sentinels: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            batch_bytes: 3200,
            filter_sentinels: true,
        }
    }
}

impl ChunkConfig {
    pub fn from_config(audio: &crate::config::AudioConfig) -> Self {
        Self {
            batch_bytes: audio.batch_bytes,
            filter_sentinels: audio.filter_sentinels,
        }
    }
}

/// Accumulates captured samples into fixed-size uplink batches
#[derive(Debug)]
pub struct AudioBatcher {
    config: ChunkConfig,
    buffer: Vec<u8>,
    samples_dropped: u64,
    batches_emitted: u64,
}

impl AudioBatcher {
    pub fn new(config: ChunkConfig) -> Self {
        let capacity = config.batch_bytes;
        Self {
            config,
            buffer: Vec::with_capacity(capacity),
            samples_dropped: 0,
            batches_emitted: 0,
        }
    }

    /// Append samples; returns every batch that filled up.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        let batch_bytes = self.config.batch_bytes.max(2);

        for &sample in samples {
            if self.config.filter_sentinels && SENTINEL_SAMPLES.contains(&sample) {
                self.samples_dropped += 1;
                continue;
            }

            self.buffer.extend_from_slice(&sample.to_le_bytes());
            if self.buffer.len() >= batch_bytes {
                let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(batch_bytes));
                self.batches_emitted += 1;
                ready.push(batch);
            }
        }

        ready
    }

    /// Take the partial batch, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        debug!("Flushing partial batch of {} bytes", self.buffer.len());
        self.batches_emitted += 1;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Drop any buffered audio.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped
    }

    pub fn batches_emitted(&self) -> u64 {
        self.batches_emitted
    }
}
