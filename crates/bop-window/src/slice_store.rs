//! Per-worker ordered slice storage for keyed window aggregations.
//!
//! Each worker thread owns one [`KeyedThreadLocalSliceStore`] per windowed
//! operator. Records are routed to the slice covering their timestamp,
//! creating it on first use; a watermark closes every slice that ends at or
//! before it and moves those slices out of the store. Slices cross to the
//! merge stage by value, over a channel, never by shared mutation.

use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use bop_buffer::BufferProvider;
use crossbeam::channel::Sender;
use tracing::{debug, trace, warn};

use crate::assigner::SliceAssigner;
use crate::config::SliceStoreConfig;
use crate::error::{WindowError, WindowResult};
use crate::metrics::{SliceStoreMetrics, SliceStoreMetricsSnapshot};
use crate::slice::{KeyedSlice, KeyedSliceStateFactory, SliceMergeTask};

/// Slices of one worker, ordered by end timestamp.
///
/// The store is `Send` but not `Sync`: it can be handed to a worker thread,
/// but only that thread may use it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use bop_buffer::BufferManager;
/// use bop_window::{KeyedThreadLocalSliceStore, SliceStoreConfig};
///
/// let manager = BufferManager::with_capacity(4096, 4).unwrap();
/// let mut store =
///     KeyedThreadLocalSliceStore::new(SliceStoreConfig::tumbling(10), Arc::new(manager)).unwrap();
/// let slice = store.find_slice_by_ts(13).unwrap();
/// assert_eq!((slice.start(), slice.end()), (10, 20));
/// let evicted = store.set_last_watermark(20);
/// assert_eq!(evicted.len(), 1);
/// ```
pub struct KeyedThreadLocalSliceStore {
    assigner: SliceAssigner,
    factory: KeyedSliceStateFactory,
    slices: VecDeque<KeyedSlice>,
    last_watermark: Option<u64>,
    next_merge_sequence: u64,
    metrics: Arc<SliceStoreMetrics>,
    _not_sync: PhantomData<Cell<()>>,
}

impl KeyedThreadLocalSliceStore {
    pub fn new(config: SliceStoreConfig, provider: Arc<dyn BufferProvider>) -> WindowResult<Self> {
        config.validate()?;
        let assigner = SliceAssigner::new(config.window_size, config.window_slide)?;
        Ok(Self {
            assigner,
            factory: KeyedSliceStateFactory::new(provider, config.value_size, config.page_size),
            slices: VecDeque::new(),
            last_watermark: None,
            next_merge_sequence: 0,
            metrics: Arc::new(SliceStoreMetrics::default()),
            _not_sync: PhantomData,
        })
    }

    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    pub fn slice_start_ts(&self, ts: u64) -> u64 {
        self.assigner.slice_start_ts(ts)
    }

    pub fn slice_end_ts(&self, ts: u64) -> u64 {
        self.assigner.slice_end_ts(ts)
    }

    /// Watermark of the last [`set_last_watermark`](Self::set_last_watermark)
    /// call, `None` before the first one.
    pub fn last_watermark(&self) -> Option<u64> {
        self.last_watermark
    }

    pub fn number_of_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn slices(&self) -> impl Iterator<Item = &KeyedSlice> {
        self.slices.iter()
    }

    pub fn first_slice(&self) -> Option<&KeyedSlice> {
        self.slices.front()
    }

    pub fn last_slice(&self) -> Option<&KeyedSlice> {
        self.slices.back()
    }

    /// Shared handle onto this store's counters.
    pub fn metrics_handle(&self) -> Arc<SliceStoreMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn metrics(&self) -> SliceStoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns the slice covering `ts`, creating it if needed.
    ///
    /// Fails with [`WindowError::LateData`] when `ts` is at or behind the last
    /// watermark: the slice it belonged to may already be gone.
    pub fn find_slice_by_ts(&mut self, ts: u64) -> WindowResult<&mut KeyedSlice> {
        if let Some(watermark) = self.last_watermark.filter(|watermark| ts <= *watermark) {
            self.metrics.incr_late_records();
            return Err(WindowError::LateData { ts, watermark });
        }
        let end = self.assigner.slice_end_ts(ts);
        if end <= ts {
            return Err(WindowError::TimestampOutOfRange(ts));
        }
        let index = self.slices.partition_point(|slice| slice.end() < end);
        if self.slices.get(index).is_some_and(|slice| slice.covers(ts)) {
            return Ok(&mut self.slices[index]);
        }
        let start = self.assigner.slice_start_ts(ts);
        self.insert_slice(index, start, end)
    }

    /// Slice ending exactly at `slice_end`.
    pub fn get_slice(&self, slice_end: u64) -> Option<&KeyedSlice> {
        self.position_of(slice_end).map(|index| &self.slices[index])
    }

    pub fn get_slice_mut(&mut self, slice_end: u64) -> Option<&mut KeyedSlice> {
        self.position_of(slice_end)
            .map(move |index| &mut self.slices[index])
    }

    fn position_of(&self, slice_end: u64) -> Option<usize> {
        self.slices
            .binary_search_by_key(&slice_end, KeyedSlice::end)
            .ok()
    }

    /// Inserts an empty slice `[start, end)` at `index`.
    ///
    /// The slice must fit between its neighbours: end-timestamp order is
    /// kept and slices never overlap.
    pub fn insert_slice(
        &mut self,
        index: usize,
        start: u64,
        end: u64,
    ) -> WindowResult<&mut KeyedSlice> {
        let fits_before = index == 0
            || self
                .slices
                .get(index - 1)
                .is_some_and(|prev| prev.end() <= start);
        let fits_after = self
            .slices
            .get(index)
            .is_none_or(|next| end <= next.start());
        if start >= end || index > self.slices.len() || !fits_before || !fits_after {
            return Err(WindowError::SliceOrder { start, end });
        }
        self.slices
            .insert(index, KeyedSlice::new(start, end, self.factory.create()));
        self.metrics.incr_slices_created();
        debug!(start, end, slices = self.slices.len(), "slice created");
        Ok(&mut self.slices[index])
    }

    /// Advances the watermark and moves out every slice ending at or before
    /// it, oldest first.
    ///
    /// Watermarks never move backwards; an older value is ignored.
    pub fn set_last_watermark(&mut self, ts: u64) -> Vec<KeyedSlice> {
        if let Some(previous) = self.last_watermark.filter(|previous| ts < *previous) {
            warn!(ts, previous, "ignoring watermark behind the current one");
            return Vec::new();
        }
        self.last_watermark = Some(ts);
        let closed = self.slices.partition_point(|slice| slice.end() <= ts);
        self.set_first_slice_index(closed)
    }

    /// Removes the oldest slice regardless of the watermark.
    pub fn drop_first_slice(&mut self) -> Option<KeyedSlice> {
        let mut slice = self.slices.pop_front()?;
        slice.mark_eligible();
        self.metrics.incr_slices_evicted(1);
        trace!(start = slice.start(), end = slice.end(), "dropped first slice");
        Some(slice)
    }

    /// Removes every slice before `index`, oldest first.
    pub fn set_first_slice_index(&mut self, index: usize) -> Vec<KeyedSlice> {
        let index = index.min(self.slices.len());
        let evicted: Vec<KeyedSlice> = self
            .slices
            .drain(..index)
            .map(|mut slice| {
                slice.mark_eligible();
                slice
            })
            .collect();
        if !evicted.is_empty() {
            self.metrics.incr_slices_evicted(evicted.len() as u64);
            debug!(
                evicted = evicted.len(),
                remaining = self.slices.len(),
                watermark = ?self.last_watermark,
                "slices evicted"
            );
        }
        evicted
    }

    /// Advances the watermark to `ts` and sends every closed slice to the
    /// merge stage. Returns the number of slices sent.
    ///
    /// If the receiver is gone, the slices not yet sent are dropped with the
    /// error and their memory is released.
    pub fn evict_into(&mut self, ts: u64, sender: &Sender<SliceMergeTask>) -> WindowResult<usize> {
        let evicted = self.set_last_watermark(ts);
        let count = evicted.len();
        for slice in evicted {
            let task = SliceMergeTask {
                sequence_number: self.next_merge_sequence,
                slice,
            };
            self.next_merge_sequence += 1;
            sender
                .send(task)
                .map_err(|_| WindowError::MergeChannelClosed)?;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for KeyedThreadLocalSliceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedThreadLocalSliceStore")
            .field("assigner", &self.assigner)
            .field("slices", &self.slices.len())
            .field("last_watermark", &self.last_watermark)
            .finish()
    }
}
