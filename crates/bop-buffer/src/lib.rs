//! Pooled, reference-counted memory for BOP's streaming data plane.
//!
//! A [`BufferManager`] allocates a fixed set of equally sized segments once
//! and hands them out as [`TupleBuffer`] handles. Handles are cheap to clone
//! and move between threads; the last release returns the segment to the
//! pool it came from. Because the pool never grows, a consumer that falls
//! behind eventually stalls producers in
//! [`get_buffer_blocking`](BufferManager::get_buffer_blocking): the pool is
//! the backpressure mechanism.
//!
//! [`LocalBufferPool`] and [`FixedSizeBufferPool`] layer per-thread caching
//! and exclusive reservations on top of the manager. Everything that hands
//! out buffers implements [`BufferProvider`].

pub mod config;
pub mod error;
pub mod metrics;

mod local_pool;
mod manager;
mod provider;
mod segment;
mod tuple_buffer;

pub use config::{BufferManagerConfig, LocalBufferPoolConfig, OriginId};
pub use error::{BufferError, BufferResult};
pub use local_pool::{FixedSizeBufferPool, LocalBufferPool};
pub use manager::BufferManager;
pub use metrics::{BufferManagerMetrics, BufferManagerMetricsSnapshot};
pub use provider::{BufferProvider, BufferRecycler};
pub use tuple_buffer::{ChildBufferIndex, TupleBuffer};
