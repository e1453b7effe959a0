use std::ptr::NonNull;
use std::time::Duration;

use crate::error::BufferResult;
use crate::tuple_buffer::TupleBuffer;

/// Source of tuple buffers.
///
/// Implemented by [`BufferManager`](crate::BufferManager) and the pools it
/// creates, so operators can be handed whichever provider fits their thread.
pub trait BufferProvider: Send + Sync {
    /// Blocks until a pooled buffer is available or the provider shuts down.
    fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer>;

    /// Returns `None` immediately when no pooled buffer is available.
    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer>;

    /// Blocks at most `timeout`; fails with `PoolExhausted` when it elapses.
    fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer>;

    /// Allocates a one-off buffer of `size` bytes outside the pool.
    fn get_unpooled_buffer(&self, size: usize) -> BufferResult<TupleBuffer>;

    /// Payload size of pooled buffers.
    fn buffer_size(&self) -> usize;

    /// Pooled buffers that can be handed out without waiting.
    fn available_buffers(&self) -> usize;
}

/// Callback notified when a buffer wrapping external memory is released for
/// the last time.
///
/// The external owner keeps ownership of the memory; the callback is its cue
/// that the data plane no longer references it.
pub trait BufferRecycler: Send + Sync {
    fn recycle(&self, data: NonNull<u8>, len: usize);
}

impl<F> BufferRecycler for F
where
    F: Fn(NonNull<u8>, usize) + Send + Sync,
{
    fn recycle(&self, data: NonNull<u8>, len: usize) {
        self(data, len)
    }
}
