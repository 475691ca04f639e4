//! Wait-free SPSC byte ring between the network receive path and the
//! playback drain task.
//!
//! The receive path owns the [`RingProducer`], the drain task owns the
//! [`RingConsumer`]. Both halves share a small block of atomics: byte
//! counters, the stream state that lets the consumer report the end of a
//! synthesized stream exactly once, and a discard mark the producer raises
//! to drop whatever is buffered without stopping the consumer.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, warn};

use super::alloc::{AllocationStrategy, PoolLease};
use super::backend::PlaybackSink;
use crate::error::AllocationError;

/// Bytes per PCM sample; reads are aligned to this.
pub const PCM_SAMPLE_WIDTH: usize = 2;

const STREAM_IDLE: u8 = 0;
const STREAM_ACTIVE: u8 = 1;
const STREAM_FINISHED: u8 = 2;

/// Lifecycle of the audio stream currently flowing through the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Audio is still arriving.
    Active,
    /// The sender marked the stream complete; waiting for the ring to empty.
    Finished,
}

#[derive(Debug)]
struct RingShared {
    capacity: usize,
    stream: AtomicU8,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    rejected_writes: AtomicU64,
    /// The consumer skips everything before this write offset.
    discard_until: AtomicU64,
    _lease: Option<PoolLease>,
}

/// Snapshot of ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub rejected_writes: u64,
}

/// Constructors for the producer/consumer pair.
pub struct AudioRing;

impl AudioRing {
    pub fn new(capacity: usize) -> (RingProducer, RingConsumer) {
        Self::build(capacity, None)
    }

    /// Size the ring from the first tier of `strategy` that has room.
    pub fn allocate(
        strategy: &AllocationStrategy,
    ) -> Result<(RingProducer, RingConsumer), AllocationError> {
        let lease = strategy.reserve()?;
        let capacity = lease.len();
        Ok(Self::build(capacity, Some(lease)))
    }

    fn build(capacity: usize, lease: Option<PoolLease>) -> (RingProducer, RingConsumer) {
        let (producer, consumer) = RingBuffer::new(capacity);
        let shared = Arc::new(RingShared {
            capacity,
            stream: AtomicU8::new(STREAM_IDLE),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
            discard_until: AtomicU64::new(0),
            _lease: lease,
        });

        (
            RingProducer {
                inner: producer,
                shared: Arc::clone(&shared),
            },
            RingConsumer {
                inner: consumer,
                shared,
                scratch: Vec::new(),
            },
        )
    }
}

/// Writing half, owned by the receive path.
pub struct RingProducer {
    inner: Producer<u8>,
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Write all of `bytes` or nothing.
    ///
    /// Returns the number of bytes accepted: `bytes.len()` or 0 when there is
    /// not enough free space. A rejected write leaves the ring unchanged.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        let free = self.inner.slots();
        let Ok(mut chunk) = self.inner.write_chunk(bytes.len()) else {
            self.shared.rejected_writes.fetch_add(1, Ordering::Relaxed);
            warn!("Playback ring full: need {}, free {}", bytes.len(), free);
            return 0;
        };

        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&bytes[..split]);
        second.copy_from_slice(&bytes[split..]);
        chunk.commit_all();

        self.shared
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        bytes.len()
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.shared.capacity - self.inner.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.inner.slots()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Mark a new stream as arriving.
    pub fn begin_stream(&self) {
        self.shared.stream.store(STREAM_ACTIVE, Ordering::Release);
    }

    /// Mark the current stream complete; the consumer reports completion
    /// once everything written so far has been drained.
    pub fn finish_stream(&self) {
        self.shared.stream.store(STREAM_FINISHED, Ordering::Release);
    }

    /// Drop everything written so far and end the current stream without a
    /// completion. The consumer skips the dropped bytes on its next read.
    pub fn discard(&self) {
        let written = self.shared.bytes_written.load(Ordering::Relaxed);
        self.shared.discard_until.store(written, Ordering::Release);
        self.shared.stream.store(STREAM_IDLE, Ordering::Release);
        debug!("Discarding playback audio up to byte {}", written);
    }

    pub fn stream_state(&self) -> StreamState {
        load_stream(&self.shared)
    }

    pub fn stats(&self) -> RingStats {
        stats(&self.shared)
    }
}

/// Reading half, owned by the playback drain task.
pub struct RingConsumer {
    inner: Consumer<u8>,
    shared: Arc<RingShared>,
    scratch: Vec<u8>,
}

impl RingConsumer {
    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Copy the next contiguous run into `out` without consuming it.
    ///
    /// The run stops at the physical end of the ring, is capped at
    /// `max_bytes` and rounded down to whole samples. A sample split by the
    /// end of the ring is returned on its own.
    pub fn peek_contiguous(&mut self, max_bytes: usize, out: &mut Vec<u8>) -> usize {
        out.clear();
        let available = self.inner.slots();
        if available == 0 || max_bytes < PCM_SAMPLE_WIDTH {
            return 0;
        }
        let Ok(chunk) = self.inner.read_chunk(available) else {
            return 0;
        };
        let (first, second) = chunk.as_slices();
        let len = first.len().min(max_bytes) / PCM_SAMPLE_WIDTH * PCM_SAMPLE_WIDTH;
        if len == 0 && available >= PCM_SAMPLE_WIDTH {
            out.extend_from_slice(first);
            out.extend_from_slice(&second[..PCM_SAMPLE_WIDTH - first.len()]);
            return PCM_SAMPLE_WIDTH;
        }
        out.extend_from_slice(&first[..len]);
        // Dropping the chunk without commit leaves the data in place
        len
    }

    /// Skip bytes the producer discarded; returns how many were dropped.
    pub fn skip_discarded(&mut self) -> usize {
        let target = self.shared.discard_until.load(Ordering::Acquire);
        let read = self.shared.bytes_read.load(Ordering::Relaxed);
        if read >= target {
            return 0;
        }
        let n = ((target - read) as usize).min(self.inner.slots());
        self.consume(n);
        n
    }

    /// Discard the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.inner.slots());
        if n == 0 {
            return;
        }
        if let Ok(chunk) = self.inner.read_chunk(n) {
            chunk.commit_all();
            self.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Hand the next aligned contiguous run (at most `max_bytes`) to `sink`
    /// and advance by however much the sink accepted.
    pub async fn read_into<K>(&mut self, sink: &mut K, max_bytes: usize) -> Result<usize>
    where
        K: PlaybackSink + ?Sized,
    {
        self.skip_discarded();
        let mut scratch = std::mem::take(&mut self.scratch);
        let len = self.peek_contiguous(max_bytes, &mut scratch);
        let result = if len == 0 {
            Ok(0)
        } else {
            sink.write(&scratch[..len]).await.map(|accepted| {
                let accepted = accepted.min(len);
                self.consume(accepted);
                accepted
            })
        };
        self.scratch = scratch;
        result
    }

    /// True exactly once per finished stream, when the ring has drained.
    ///
    /// A finished stream that ends in half a sample completes too; the stray
    /// byte is dropped so it cannot shift the next stream.
    pub fn take_completion(&mut self) -> bool {
        let left = self.inner.slots();
        if left >= PCM_SAMPLE_WIDTH {
            return false;
        }
        let completed = self
            .shared
            .stream
            .compare_exchange(
                STREAM_FINISHED,
                STREAM_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if completed {
            if left > 0 {
                warn!("Dropping {} byte partial sample at end of stream", left);
                self.consume(left);
            }
            debug!("Playback stream drained");
        }
        completed
    }

    pub fn stream_state(&self) -> StreamState {
        load_stream(&self.shared)
    }

    pub fn stats(&self) -> RingStats {
        stats(&self.shared)
    }
}

fn load_stream(shared: &RingShared) -> StreamState {
    match shared.stream.load(Ordering::Acquire) {
        STREAM_ACTIVE => StreamState::Active,
        STREAM_FINISHED => StreamState::Finished,
        _ => StreamState::Idle,
    }
}

fn stats(shared: &RingShared) -> RingStats {
    RingStats {
        capacity: shared.capacity,
        bytes_written: shared.bytes_written.load(Ordering::Relaxed),
        bytes_read: shared.bytes_read.load(Ordering::Relaxed),
        rejected_writes: shared.rejected_writes.load(Ordering::Relaxed),
    }
}
