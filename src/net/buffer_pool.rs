//! Receive buffer pooling.
//!
//! # Responsibilities
//! - Hand out fixed-capacity receive buffers to new connections
//! - Take buffers back at teardown (recycle or discard)
//! - Count acquires and releases so buffer conservation can be checked
//!
//! # Design Decisions
//! - Pooling is a strategy (`BufferPool`), injected into the server
//! - Default strategy allocates on acquire and drops on release
//! - The free-list strategy is bounded so a burst of connections does not pin memory forever

use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::schema::{BufferPoolConfig, PoolStrategy};

/// Default receive buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// A fixed-capacity receive buffer.
///
/// The length never changes after allocation; the connection tracks how much of
/// it is filled with a separate cursor.
#[derive(Debug)]
pub struct PacketBuffer(Box<[u8]>);

impl PacketBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self(vec![0u8; size].into_boxed_slice())
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.0.len()
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total `acquire` calls.
    pub acquired: u64,
    /// Total `release` calls.
    pub released: u64,
    /// Buffers freshly allocated (acquires not served from a free list).
    pub allocated: u64,
    /// Buffers currently handed out.
    pub outstanding: u64,
    /// Buffers sitting on the free list.
    pub free: usize,
}

/// Strategy for supplying and reclaiming receive buffers.
pub trait BufferPool: Send + Sync + std::fmt::Debug {
    /// Hand out a buffer of `buffer_size()` bytes.
    fn acquire(&self) -> PacketBuffer;

    /// Take a buffer back. The caller must not hold any reference into it.
    fn release(&self, buffer: PacketBuffer);

    /// Nominal capacity of the buffers this pool hands out.
    fn buffer_size(&self) -> usize;

    /// Current counters.
    fn stats(&self) -> PoolStats;
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

impl Counters {
    fn snapshot(&self, free: usize) -> PoolStats {
        let acquired = self.acquired.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        PoolStats {
            acquired,
            released,
            allocated: self.allocated.load(Ordering::Relaxed),
            outstanding: acquired.saturating_sub(released),
            free,
        }
    }
}

/// Non-pooling strategy: every acquire allocates, every release drops.
#[derive(Debug)]
pub struct UnpooledAllocator {
    buffer_size: usize,
    counters: Counters,
}

impl UnpooledAllocator {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            counters: Counters::default(),
        }
    }
}

impl Default for UnpooledAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl BufferPool for UnpooledAllocator {
    fn acquire(&self) -> PacketBuffer {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        PacketBuffer::new(self.buffer_size)
    }

    fn release(&self, buffer: PacketBuffer) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        drop(buffer);
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }
}

/// Free-list strategy: released buffers are kept for reuse, up to `max_free`.
#[derive(Debug)]
pub struct FreeListPool {
    buffer_size: usize,
    max_free: usize,
    free: Mutex<Vec<PacketBuffer>>,
    counters: Counters,
}

impl FreeListPool {
    pub fn new(buffer_size: usize, max_free: usize) -> Self {
        Self {
            buffer_size,
            max_free,
            free: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Allocate `count` buffers up front (capped at `max_free`).
    pub fn prefill(&self, count: usize) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        while free.len() < count.min(self.max_free) {
            free.push(PacketBuffer::new(self.buffer_size));
            self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl BufferPool for FreeListPool {
    fn acquire(&self) -> PacketBuffer {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(buffer) => buffer,
            None => {
                self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                PacketBuffer::new(self.buffer_size)
            }
        }
    }

    fn release(&self, buffer: PacketBuffer) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        // Foreign-sized buffers are dropped so every pooled buffer stays uniform.
        if buffer.capacity() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_free {
            free.push(buffer);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn stats(&self) -> PoolStats {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner).len();
        self.counters.snapshot(free)
    }
}

/// Build the pool strategy selected in configuration.
pub fn build_pool(config: &BufferPoolConfig, buffer_size: usize) -> Arc<dyn BufferPool> {
    match config.strategy {
        PoolStrategy::Unpooled => Arc::new(UnpooledAllocator::new(buffer_size)),
        PoolStrategy::FreeList => {
            let pool = FreeListPool::new(buffer_size, config.max_free);
            pool.prefill(config.prefill);
            Arc::new(pool)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpooled_allocates_every_time() {
        let pool = UnpooledAllocator::new(64);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.capacity(), 64);
        assert_eq!(pool.stats().outstanding, 2);

        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn free_list_reuses_released_buffers() {
        let pool = FreeListPool::new(32, 4);
        let mut buf = pool.acquire();
        buf[0] = 0xAB;
        pool.release(buf);

        let again = pool.acquire();
        assert_eq!(again[0], 0xAB, "expected the recycled buffer back");
        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.acquired, 2);
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = FreeListPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for b in bufs {
            pool.release(b);
        }
        assert_eq!(pool.stats().free, 2);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn free_list_discards_foreign_sizes() {
        let pool = FreeListPool::new(16, 8);
        pool.release(PacketBuffer::new(99));
        assert_eq!(pool.stats().free, 0);
    }

    #[test]
    fn prefill_respects_max_free() {
        let pool = FreeListPool::new(8, 3);
        pool.prefill(10);
        assert_eq!(pool.stats().free, 3);
        assert_eq!(pool.stats().allocated, 3);
    }

    #[test]
    fn build_pool_follows_config() {
        let mut config = BufferPoolConfig::default();
        let pool = build_pool(&config, 128);
        assert_eq!(pool.buffer_size(), 128);

        config.strategy = PoolStrategy::FreeList;
        config.prefill = 2;
        let pool = build_pool(&config, 256);
        assert_eq!(pool.stats().free, 2);
        assert_eq!(pool.acquire().capacity(), 256);
    }
}
