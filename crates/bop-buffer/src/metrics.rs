//! Counters describing how the pool is being used.
//!
//! All counters are relaxed atomics updated on the acquisition and recycle
//! paths; [`BufferManagerMetrics::snapshot`] produces a point-in-time copy for
//! monitoring. A rising `blocked_waits` count is the visible symptom of
//! backpressure.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of buffer manager counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferManagerMetricsSnapshot {
    /// Pooled segments handed out (directly or through local pools).
    pub pooled_acquisitions: u64,
    /// One-off allocations outside the pool.
    pub unpooled_allocations: u64,
    /// Pooled segments returned to the global free list.
    pub recycled: u64,
    /// Blocking acquisitions that had to wait for a segment.
    pub blocked_waits: u64,
    /// Non-blocking acquisitions that found the pool empty.
    pub exhausted: u64,
    /// Bounded acquisitions whose deadline elapsed.
    pub timeouts: u64,
}

impl BufferManagerMetricsSnapshot {
    /// Fraction of acquisition attempts that could not be served immediately.
    pub fn contention_ratio(&self) -> f64 {
        let attempts = self.pooled_acquisitions + self.exhausted + self.timeouts;
        if attempts == 0 {
            return 0.0;
        }
        (self.blocked_waits + self.exhausted + self.timeouts) as f64 / attempts as f64
    }
}

#[derive(Debug, Default)]
pub struct BufferManagerMetrics {
    pooled_acquisitions: AtomicU64,
    unpooled_allocations: AtomicU64,
    recycled: AtomicU64,
    blocked_waits: AtomicU64,
    exhausted: AtomicU64,
    timeouts: AtomicU64,
}

impl BufferManagerMetrics {
    pub(crate) fn incr_pooled_acquisitions(&self, count: u64) {
        self.pooled_acquisitions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn incr_unpooled_allocations(&self) {
        self.unpooled_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_blocked_waits(&self) {
        self.blocked_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BufferManagerMetricsSnapshot {
        BufferManagerMetricsSnapshot {
            pooled_acquisitions: self.pooled_acquisitions.load(Ordering::Relaxed),
            unpooled_allocations: self.unpooled_allocations.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            blocked_waits: self.blocked_waits.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
