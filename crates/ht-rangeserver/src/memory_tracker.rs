//! Replacement for the source's process-wide `Global` singleton bag: a small context value
//! threaded explicitly into every component that needs shared counters, rather than reached for
//! through a static. Monotonic counters are plain atomics behind a cheap `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide memory and access accounting, shared by every access group and cell store on one
/// range server. Cloning is cheap (an `Arc` bump); every clone observes the same counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryTracker {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    cache_bytes_used:      AtomicU64,
    cache_bytes_allocated: AtomicU64,
    block_index_bytes:     AtomicU64,
    bloom_filter_bytes:    AtomicU64,
    shadow_cache_bytes:    AtomicU64,
    block_index_accesses:  AtomicUsize,
}

impl MemoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cache_bytes(&self, used: i64, allocated: i64) {
        add_signed(&self.inner.cache_bytes_used, used);
        add_signed(&self.inner.cache_bytes_allocated, allocated);
    }

    pub fn add_block_index_bytes(&self, delta: i64) {
        add_signed(&self.inner.block_index_bytes, delta);
    }

    pub fn add_bloom_filter_bytes(&self, delta: i64) {
        add_signed(&self.inner.bloom_filter_bytes, delta);
    }

    pub fn add_shadow_cache_bytes(&self, delta: i64) {
        add_signed(&self.inner.shadow_cache_bytes, delta);
    }

    pub fn note_block_index_access(&self) {
        self.inner.block_index_accesses.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn cache_bytes_used(&self) -> u64 {
        self.inner.cache_bytes_used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_bytes_allocated(&self) -> u64 {
        self.inner.cache_bytes_allocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn block_index_bytes(&self) -> u64 {
        self.inner.block_index_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bloom_filter_bytes(&self) -> u64 {
        self.inner.bloom_filter_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn shadow_cache_bytes(&self) -> u64 {
        self.inner.shadow_cache_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn block_index_accesses(&self) -> usize {
        self.inner.block_index_accesses.load(Ordering::Relaxed)
    }

    /// Total bytes under this tracker's watch, used by the maintenance scheduler's memory-limit
    /// comparison.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.cache_bytes_used()
            + self.block_index_bytes()
            + self.bloom_filter_bytes()
            + self.shadow_cache_bytes()
    }
}

fn add_signed(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        counter.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
    }
}
