use std::sync::Arc;

use bop_buffer::BufferProvider;

use crate::hash_map::ChainedHashMap;

/// Position of a slice in its lifecycle.
///
/// Eviction moves the slice out of its store; an evicted slice is one the
/// store no longer owns, so there is no separate variant for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceLifecycle {
    /// Created by the first record mapping into its range.
    Created,
    /// At least one record has been merged into its state.
    Accumulating,
    /// The watermark has passed its end; it may be handed to a merge step.
    EligibleForEviction,
}

/// Creates the keyed state of each new slice from a buffer provider.
#[derive(Clone)]
pub struct KeyedSliceStateFactory {
    provider: Arc<dyn BufferProvider>,
    value_size: usize,
    page_size: usize,
}

impl KeyedSliceStateFactory {
    pub fn new(provider: Arc<dyn BufferProvider>, value_size: usize, page_size: usize) -> Self {
        Self {
            provider,
            value_size,
            page_size,
        }
    }

    pub fn create(&self) -> ChainedHashMap {
        ChainedHashMap::new(Arc::clone(&self.provider), self.value_size, self.page_size)
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }
}

impl std::fmt::Debug for KeyedSliceStateFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedSliceStateFactory")
            .field("value_size", &self.value_size)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// One time range `[start, end)` of a keyed window aggregation and its
/// per-key partial aggregates.
#[derive(Debug)]
pub struct KeyedSlice {
    start: u64,
    end: u64,
    state: ChainedHashMap,
    lifecycle: SliceLifecycle,
}

impl KeyedSlice {
    pub fn new(start: u64, end: u64, state: ChainedHashMap) -> Self {
        Self {
            start,
            end,
            state,
            lifecycle: SliceLifecycle::Created,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn covers(&self, ts: u64) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn lifecycle(&self) -> SliceLifecycle {
        self.lifecycle
    }

    pub fn state(&self) -> &ChainedHashMap {
        &self.state
    }

    /// Mutable state for merging records; marks the slice as accumulating.
    pub fn state_mut(&mut self) -> &mut ChainedHashMap {
        if self.lifecycle == SliceLifecycle::Created {
            self.lifecycle = SliceLifecycle::Accumulating;
        }
        &mut self.state
    }

    pub(crate) fn mark_eligible(&mut self) {
        self.lifecycle = SliceLifecycle::EligibleForEviction;
    }

    /// Gives up the slice, keeping only its state.
    pub fn into_state(self) -> ChainedHashMap {
        self.state
    }
}

/// A finished slice on its way to the merge step.
///
/// Sequence numbers are assigned per store in eviction order, so a merger
/// collecting tasks from several workers can tell whether it has seen all of
/// one worker's slices.
#[derive(Debug)]
pub struct SliceMergeTask {
    pub sequence_number: u64,
    pub slice: KeyedSlice,
}
