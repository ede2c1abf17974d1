//! Lock-free packet buffer pool
//!
//! The UDP relay borrows a buffer per received datagram and hands it
//! through a bounded channel to the session's upstream worker. Buffers
//! are laid out as `front headroom | payload space | rear headroom` so
//! codecs can frame packets in place, and return to the pool when the
//! owning handle drops, wherever that happens (receive-loop drop,
//! channel drop, worker consumption, worker error).
//!
//! Built on `crossbeam-queue::ArrayQueue` to keep contention between
//! the receive loop and the workers off the hot path.

use std::ops::{Deref, DerefMut, Range};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::framing::Headroom;

/// Default pool capacity (number of buffers)
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Statistics for the packet buffer pool
#[derive(Debug)]
pub struct PacketPoolStats {
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from the pool
    reuses: AtomicU64,
    /// Number of buffers returned to the pool
    returns: AtomicU64,
    /// Number of buffers dropped (pool was full)
    drops: AtomicU64,
}

impl PacketPoolStats {
    fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> PacketPoolStatsSnapshot {
        PacketPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of packet pool statistics
#[derive(Debug, Clone, Copy)]
pub struct PacketPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers dropped (pool full)
    pub drops: u64,
}

/// A lock-free pool of fixed-layout packet buffers.
///
/// Every buffer is `front + payload_size + rear` bytes; the receive
/// loop reads datagrams into the payload range and codecs expand into
/// the headroom in place.
#[derive(Debug)]
pub struct PacketBufferPool {
    /// Lock-free queue of available buffers
    buffers: ArrayQueue<Vec<u8>>,
    /// Headroom layout shared by all buffers
    headroom: Headroom,
    /// Payload space between the headrooms
    payload_size: usize,
    /// Pool statistics
    stats: PacketPoolStats,
}

impl PacketBufferPool {
    /// Create a new pool.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of buffers kept in the pool
    /// * `headroom` - Front/rear reserve shared by all buffers
    /// * `payload_size` - Payload space between the headrooms
    #[must_use]
    pub fn new(capacity: usize, headroom: Headroom, payload_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            headroom,
            payload_size,
            stats: PacketPoolStats::new(),
        }
    }

    /// Total size of each buffer.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.headroom.front + self.payload_size + self.headroom.rear
    }

    /// Payload space between the headrooms.
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Headroom layout shared by all buffers.
    #[must_use]
    pub const fn headroom(&self) -> Headroom {
        self.headroom
    }

    /// Byte range of the payload space within each buffer.
    #[must_use]
    pub const fn payload_range(&self) -> Range<usize> {
        self.headroom.front..self.headroom.front + self.payload_size
    }

    /// Get a buffer from the pool or allocate a new one.
    ///
    /// Reused buffers are not zeroed: they keep their full length and
    /// the next receive overwrites the payload anyway.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledPacketBuffer {
        let buffer = if let Some(buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size()]
        };

        PooledPacketBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Pre-warm the pool by allocating buffers up front.
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            if self.buffers.push(vec![0u8; self.buffer_size()]).is_err() {
                break;
            }
        }
    }

    /// Current number of available buffers in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Get pool statistics.
    #[must_use]
    pub fn stats(&self) -> &PacketPoolStats {
        &self.stats
    }

    fn return_buffer(&self, buffer: Vec<u8>) {
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A packet buffer borrowed from the pool.
///
/// The handle is move-only: it travels through the send channel to
/// transfer ownership to a worker, and returns its buffer to the pool
/// exactly once, when dropped.
#[derive(Debug)]
pub struct PooledPacketBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Vec<u8>>,
    /// Reference to the pool for returning the buffer
    pool: Arc<PacketBufferPool>,
}

impl PooledPacketBuffer {
    /// Byte range of the payload space within this buffer.
    #[must_use]
    pub fn payload_range(&self) -> Range<usize> {
        self.pool.payload_range()
    }

    /// Front headroom of this buffer.
    #[must_use]
    pub fn front_headroom(&self) -> usize {
        self.pool.headroom().front
    }
}

impl Deref for PooledPacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledPacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledPacketBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}
