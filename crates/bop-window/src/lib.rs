//! Watermark tracking and keyed time-window state for BOP's windowed
//! operators.
//!
//! - [`WatermarkSequencer`] and [`MultiOriginWatermarkProcessor`] turn the
//!   out-of-order watermarks stamped on tuple buffers into a watermark every
//!   worker can act on.
//! - [`KeyedThreadLocalSliceStore`] keeps one worker's slices of a keyed
//!   window aggregation. Slice state lives in pages from a
//!   [`BufferProvider`](bop_buffer::BufferProvider), and closed slices leave
//!   the store by value as [`SliceMergeTask`]s.

pub mod config;
pub mod error;
pub mod metrics;

mod assigner;
mod hash_map;
mod sequencer;
mod slice;
mod slice_store;
mod watermark;

pub use assigner::SliceAssigner;
pub use config::{SequencerConfig, SliceStoreConfig};
pub use error::{WindowError, WindowResult};
pub use hash_map::ChainedHashMap;
pub use metrics::{SliceStoreMetrics, SliceStoreMetricsSnapshot};
pub use sequencer::WatermarkSequencer;
pub use slice::{KeyedSlice, KeyedSliceStateFactory, SliceLifecycle, SliceMergeTask};
pub use slice_store::KeyedThreadLocalSliceStore;
pub use watermark::MultiOriginWatermarkProcessor;
