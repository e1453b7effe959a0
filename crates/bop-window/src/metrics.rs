//! Counters for a slice store.
//!
//! The store itself is single-threaded, but its counters are atomics behind
//! an `Arc` so a monitoring thread can sample them while the worker runs.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SliceStoreMetricsSnapshot {
    pub slices_created: u64,
    pub slices_evicted: u64,
    /// Records rejected because they arrived at or behind the watermark.
    pub late_records: u64,
}

impl SliceStoreMetricsSnapshot {
    /// Slices created but not yet evicted.
    pub fn open_slices(&self) -> u64 {
        self.slices_created.saturating_sub(self.slices_evicted)
    }
}

#[derive(Debug, Default)]
pub struct SliceStoreMetrics {
    slices_created: AtomicU64,
    slices_evicted: AtomicU64,
    late_records: AtomicU64,
}

impl SliceStoreMetrics {
    pub(crate) fn incr_slices_created(&self) {
        self.slices_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_slices_evicted(&self, count: u64) {
        self.slices_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn incr_late_records(&self) {
        self.late_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SliceStoreMetricsSnapshot {
        SliceStoreMetricsSnapshot {
            slices_created: self.slices_created.load(Ordering::Relaxed),
            slices_evicted: self.slices_evicted.load(Ordering::Relaxed),
            late_records: self.late_records.load(Ordering::Relaxed),
        }
    }
}
