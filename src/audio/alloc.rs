//! Budgeted memory pools and the tiered allocation strategy.
//!
//! A [`MemoryPool`] models a region with a fixed byte budget (a fast external
//! RAM bank, the general heap). Reservations are returned as [`PoolLease`]s
//! that give the bytes back on drop. Allocation failure is always reported,
//! never a panic: the budget check happens first and the backing `Vec` is
//! grown with `try_reserve_exact`.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::AllocationError;

/// Preferred playback ring size in the fast pool.
pub const PREFERRED_RING_BYTES: usize = 1024 * 1024;

/// Fallback playback ring sizes tried in the general pool, largest first.
pub const FALLBACK_RING_BYTES: [usize; 4] = [512 * 1024, 256 * 1024, 128 * 1024, 64 * 1024];

/// A memory region with a fixed byte budget.
#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    limit: usize,
    in_use: AtomicUsize,
}

impl MemoryPool {
    pub fn new(name: impl Into<String>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit,
            in_use: AtomicUsize::new(0),
        })
    }

    /// A pool bounded only by the system allocator.
    pub fn unbounded(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, usize::MAX)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use())
    }

    /// Reserve `len` bytes of budget without allocating.
    pub fn try_reserve(self: &Arc<Self>, len: usize) -> Option<PoolLease> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(len)?;
            if next > self.limit {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(PoolLease {
                        pool: Arc::clone(self),
                        len,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve budget and allocate an empty buffer with `len` bytes of capacity.
    pub fn try_allocate(self: &Arc<Self>, len: usize) -> Option<PooledBuffer> {
        let lease = self.try_reserve(len)?;
        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            warn!("{} pool: system allocator refused {} bytes", self.name, len);
            return None;
        }
        Some(PooledBuffer { data, lease })
    }

    fn release(&self, len: usize) {
        self.in_use.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Budget held against a pool until dropped.
#[derive(Debug)]
pub struct PoolLease {
    pool: Arc<MemoryPool>,
    len: usize,
}

impl PoolLease {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release(self.len);
    }
}

/// A byte buffer whose capacity is charged to a pool.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    lease: PoolLease,
}

impl PooledBuffer {
    /// Bytes still writable without exceeding the reservation.
    pub fn remaining(&self) -> usize {
        self.lease.len() - self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.lease.len()
    }

    /// Append at most `remaining()` bytes; returns how many were taken.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pool_name(&self) -> &str {
        self.lease.pool_name()
    }

    /// Detach the bytes from the pool accounting.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// The fast and general pools used by one link.
#[derive(Debug, Clone)]
pub struct MemoryPools {
    pub fast: Arc<MemoryPool>,
    pub general: Arc<MemoryPool>,
}

impl MemoryPools {
    pub fn new(fast_limit: usize, general_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            fast: MemoryPool::new("fast", fast_limit),
            general: MemoryPool::new("general", general_limit),
        })
    }

    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            fast: MemoryPool::unbounded("fast"),
            general: MemoryPool::unbounded("general"),
        })
    }

    /// Allocate a frame payload buffer: fast pool first, general pool second.
    pub fn try_allocate(&self, len: usize) -> Option<PooledBuffer> {
        self.fast
            .try_allocate(len)
            .or_else(|| self.general.try_allocate(len))
    }

    /// The device-style strategy for the playback ring.
    pub fn playback_strategy(&self) -> AllocationStrategy {
        AllocationStrategy::new(vec![
            AllocationTier::new(Arc::clone(&self.fast), vec![PREFERRED_RING_BYTES]),
            AllocationTier::new(Arc::clone(&self.general), FALLBACK_RING_BYTES.to_vec()),
        ])
    }

    /// A strategy that wants exactly `bytes`, from either pool.
    pub fn fixed_strategy(&self, bytes: usize) -> AllocationStrategy {
        AllocationStrategy::new(vec![
            AllocationTier::new(Arc::clone(&self.fast), vec![bytes]),
            AllocationTier::new(Arc::clone(&self.general), vec![bytes]),
        ])
    }
}

/// One pool and the sizes to try in it, in order.
#[derive(Debug, Clone)]
pub struct AllocationTier {
    pub pool: Arc<MemoryPool>,
    pub candidates: Vec<usize>,
}

impl AllocationTier {
    pub fn new(pool: Arc<MemoryPool>, candidates: Vec<usize>) -> Self {
        Self { pool, candidates }
    }
}

/// Ordered list of tiers; the first reservation that succeeds wins.
#[derive(Debug, Clone)]
pub struct AllocationStrategy {
    tiers: Vec<AllocationTier>,
}

impl AllocationStrategy {
    pub fn new(tiers: Vec<AllocationTier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[AllocationTier] {
        &self.tiers
    }

    /// Reserve budget for the largest size any tier can provide.
    pub fn reserve(&self) -> Result<PoolLease, AllocationError> {
        for tier in &self.tiers {
            for &size in &tier.candidates {
                match tier.pool.try_reserve(size) {
                    Some(lease) => {
                        info!("Reserved {} bytes from {} pool", size, tier.pool.name());
                        return Ok(lease);
                    }
                    None => debug!(
                        "{} pool cannot provide {} bytes ({} available)",
                        tier.pool.name(),
                        size,
                        tier.pool.available()
                    ),
                }
            }
        }

        Err(AllocationError::Exhausted {
            largest: self.largest_candidate(),
        })
    }

    /// Like [`reserve`](Self::reserve), but also backs the lease with memory.
    pub fn allocate(&self) -> Result<PooledBuffer, AllocationError> {
        for tier in &self.tiers {
            for &size in &tier.candidates {
                if let Some(buffer) = tier.pool.try_allocate(size) {
                    info!("Allocated {} bytes from {} pool", size, tier.pool.name());
                    return Ok(buffer);
                }
            }
        }

        Err(AllocationError::Exhausted {
            largest: self.largest_candidate(),
        })
    }

    fn largest_candidate(&self) -> usize {
        self.tiers
            .iter()
            .flat_map(|t| t.candidates.iter().copied())
            .max()
            .unwrap_or(0)
    }
}
