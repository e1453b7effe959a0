//! Memory segments and their control blocks.
//!
//! A [`MemorySegment`] is a fixed-size byte block plus the bookkeeping every
//! [`TupleBuffer`] handle shares: the reference count, the recycle target, the
//! per-use metadata and any attached child buffers.
//!
//! ```text
//!   free list ──pop──▶ activate(recycler) ──▶ refcount 1 ──clone──▶ n
//!       ▲                                                           │
//!       └──────────── recycle() ◀── refcount 0 ◀──drop── … ◀────────┘
//! ```
//!
//! A segment is either parked in a free list (refcount 0, recycler
//! [`Recycler::Detached`]) or referenced by at least one handle. Transitions
//! happen only at refcount 0, when exactly one thread owns the segment.

use std::alloc::{Layout, dealloc};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::OriginId;
use crate::local_pool::LocalShared;
use crate::manager::PoolShared;
use crate::provider::BufferRecycler;
use crate::tuple_buffer::TupleBuffer;

/// Where a segment goes once its last handle is released.
pub(crate) enum Recycler {
    /// Parked in a free list; no handle references the segment.
    Detached,
    /// Back to the manager's global free list.
    Pool(Arc<PoolShared>),
    /// Back to the cache of the local or fixed-size pool that issued it.
    Local(Arc<LocalShared>),
    /// Free the one-off allocation and the boxed segment.
    Unpooled(Arc<PoolShared>),
    /// Notify the external owner; free only the boxed segment.
    External(Arc<dyn BufferRecycler>),
}

/// Raw pointer to a segment that may be moved between free lists on
/// different threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SegmentPtr(pub(crate) NonNull<MemorySegment>);

unsafe impl Send for SegmentPtr {}
unsafe impl Sync for SegmentPtr {}

/// Per-use metadata stamped on a buffer by sources and operators.
///
/// Reset to defaults whenever the segment is recycled.
#[derive(Debug, Default)]
pub(crate) struct BufferMetadata {
    pub(crate) number_of_tuples: AtomicU64,
    pub(crate) watermark: AtomicU64,
    pub(crate) sequence_number: AtomicU64,
    pub(crate) chunk_number: AtomicU64,
    pub(crate) last_chunk: AtomicBool,
    pub(crate) origin_id: AtomicU64,
    pub(crate) creation_timestamp_ms: AtomicU64,
}

impl BufferMetadata {
    fn reset(&self) {
        self.number_of_tuples.store(0, Ordering::Relaxed);
        self.watermark.store(0, Ordering::Relaxed);
        self.sequence_number.store(0, Ordering::Relaxed);
        self.chunk_number.store(0, Ordering::Relaxed);
        self.last_chunk.store(true, Ordering::Relaxed);
        self.origin_id
            .store(OriginId::INVALID.as_u64(), Ordering::Relaxed);
        self.creation_timestamp_ms.store(0, Ordering::Relaxed);
    }
}

pub(crate) struct MemorySegment {
    data: NonNull<u8>,
    size: usize,
    /// Layout of `data` when the segment owns a one-off allocation.
    owned_layout: Option<Layout>,
    ref_count: AtomicU32,
    recycler: UnsafeCell<Recycler>,
    pub(crate) metadata: BufferMetadata,
    pub(crate) children: Mutex<Vec<TupleBuffer>>,
}

unsafe impl Send for MemorySegment {}
unsafe impl Sync for MemorySegment {}

impl MemorySegment {
    /// A segment over `size` bytes at `data` that it does not own.
    pub(crate) fn borrowed(data: NonNull<u8>, size: usize) -> Self {
        Self::with_layout(data, size, None)
    }

    /// A segment that frees `data` with `layout` when it is dropped.
    pub(crate) fn owning(data: NonNull<u8>, size: usize, layout: Layout) -> Self {
        Self::with_layout(data, size, Some(layout))
    }

    fn with_layout(data: NonNull<u8>, size: usize, owned_layout: Option<Layout>) -> Self {
        let metadata = BufferMetadata::default();
        metadata.reset();
        Self {
            data,
            size,
            owned_layout,
            ref_count: AtomicU32::new(0),
            recycler: UnsafeCell::new(Recycler::Detached),
            metadata,
            children: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> NonNull<u8> {
        self.data
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn retain(&self) {
        let prev = self.ref_count.fetch_add(1, Ordering::Relaxed);
        if prev == 0 || prev == u32::MAX {
            // Retaining a parked segment or wrapping the counter means a
            // handle outlived its segment.
            std::process::abort();
        }
    }

    /// Drops one reference. Returns true when it was the last one and the
    /// caller must recycle the segment.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        let prev = self.ref_count.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "tuple buffer refcount underflow");
        if prev == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Hands a parked segment to a first handle.
    ///
    /// # Safety
    /// The caller must own `segment` exclusively: it was just popped from a
    /// free list or freshly allocated, and its refcount is 0.
    pub(crate) unsafe fn activate(segment: SegmentPtr, recycler: Recycler) -> TupleBuffer {
        let seg = unsafe { segment.0.as_ref() };
        debug_assert_eq!(seg.ref_count.load(Ordering::Relaxed), 0);
        unsafe {
            *seg.recycler.get() = recycler;
        }
        seg.ref_count.store(1, Ordering::Release);
        unsafe { TupleBuffer::from_segment(segment.0) }
    }

    /// Returns a segment whose last handle was released to its recycle
    /// target.
    ///
    /// # Safety
    /// The refcount of `segment` must have just reached 0 on this thread.
    pub(crate) unsafe fn recycle(segment: SegmentPtr) {
        let seg = unsafe { segment.0.as_ref() };
        seg.metadata.reset();
        // Release children outside the lock; they may recycle recursively.
        let children = std::mem::take(&mut *seg.children.lock());
        drop(children);

        let recycler = unsafe { std::mem::replace(&mut *seg.recycler.get(), Recycler::Detached) };
        match recycler {
            Recycler::Detached => panic!("recycled a segment that was never activated"),
            Recycler::Pool(shared) => shared.recycle_pooled(segment),
            Recycler::Local(local) => local.recycle(segment),
            Recycler::Unpooled(shared) => {
                let size = seg.size;
                unsafe { drop(Box::from_raw(segment.0.as_ptr())) };
                shared.release_unpooled(size);
            }
            Recycler::External(external) => {
                external.recycle(seg.data, seg.size);
                unsafe { drop(Box::from_raw(segment.0.as_ptr())) };
            }
        }
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        if let Some(layout) = self.owned_layout {
            unsafe { dealloc(self.data.as_ptr(), layout) };
        }
    }
}
