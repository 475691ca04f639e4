pub mod alloc;
pub mod backend;
pub mod chunk;
pub mod file;
pub mod playback;
pub mod ring;

pub use alloc::{AllocationStrategy, AllocationTier, MemoryPool, MemoryPools, PoolLease, PooledBuffer};
pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, NullSink,
    PlaybackSink,
};
pub use chunk::{AudioBatcher, ChunkConfig};
pub use file::{AudioFile, WavFileBackend, WavFileSink};
pub use playback::{spawn_playback, PlaybackConfig, PlaybackEvent, PlaybackHandle};
pub use ring::{AudioRing, RingConsumer, RingProducer, RingStats, StreamState, PCM_SAMPLE_WIDTH};
