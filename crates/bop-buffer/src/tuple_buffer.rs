use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::config::OriginId;
use crate::segment::{MemorySegment, SegmentPtr};

/// Index of a child buffer attached to a parent [`TupleBuffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildBufferIndex(pub u32);

impl ChildBufferIndex {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Shared, reference-counted handle onto a memory segment holding
/// serialized records.
///
/// Cloning retains the segment (one atomic increment), moving transfers the
/// handle without touching the counter, and dropping releases it. The last
/// release recycles the segment to wherever it came from: the manager's free
/// list, a local pool, the allocator (unpooled buffers) or an external
/// [`BufferRecycler`](crate::BufferRecycler).
///
/// Pass buffers by value across threads and ownership boundaries; pass
/// `&TupleBuffer` within one thread to avoid the atomic.
pub struct TupleBuffer {
    segment: NonNull<MemorySegment>,
}

unsafe impl Send for TupleBuffer {}
unsafe impl Sync for TupleBuffer {}

impl TupleBuffer {
    /// # Safety
    /// The caller transfers one reference on `segment` to the new handle.
    pub(crate) unsafe fn from_segment(segment: NonNull<MemorySegment>) -> Self {
        Self { segment }
    }

    #[inline]
    fn segment(&self) -> &MemorySegment {
        // SAFETY: a live handle keeps its segment out of the free list.
        unsafe { self.segment.as_ref() }
    }

    /// Takes an additional reference; equivalent to `clone`.
    #[inline]
    pub fn retain(&self) -> TupleBuffer {
        self.clone()
    }

    /// Gives up this handle's reference; equivalent to `drop`.
    #[inline]
    pub fn release(self) {
        drop(self)
    }

    /// Number of live handles onto this segment.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.segment().ref_count()
    }

    /// Payload capacity in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.segment().size()
    }

    /// Returns true when both handles reference the same segment.
    #[inline]
    pub fn ptr_eq(&self, other: &TupleBuffer) -> bool {
        self.segment == other.segment
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        let seg = self.segment();
        unsafe { std::slice::from_raw_parts(seg.data().as_ptr(), seg.size()) }
    }

    /// Mutable access to the payload, only when this is the sole handle.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if self.ref_count() != 1 {
            return None;
        }
        Some(unsafe { self.as_mut_slice_unchecked() })
    }

    /// Mutable access to the payload regardless of other handles.
    ///
    /// # Safety
    /// No other handle may read or write the payload for the lifetime of the
    /// returned slice.
    #[inline]
    pub unsafe fn as_mut_slice_unchecked(&mut self) -> &mut [u8] {
        let seg = self.segment();
        unsafe { std::slice::from_raw_parts_mut(seg.data().as_ptr(), seg.size()) }
    }

    /// Typed raw pointer to the start of the payload, for compiled code that
    /// owns the record layout.
    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.segment().data().as_ptr().cast()
    }

    /// Number of `T` elements that fit in the payload.
    #[inline]
    pub fn capacity_of<T>(&self) -> usize {
        match size_of::<T>() {
            0 => usize::MAX,
            size => self.buffer_size() / size,
        }
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.segment()
            .metadata
            .number_of_tuples
            .load(Ordering::Relaxed)
    }

    pub fn set_number_of_tuples(&self, value: u64) {
        self.segment()
            .metadata
            .number_of_tuples
            .store(value, Ordering::Relaxed);
    }

    pub fn watermark(&self) -> u64 {
        self.segment().metadata.watermark.load(Ordering::Relaxed)
    }

    pub fn set_watermark(&self, value: u64) {
        self.segment()
            .metadata
            .watermark
            .store(value, Ordering::Relaxed);
    }

    pub fn sequence_number(&self) -> u64 {
        self.segment()
            .metadata
            .sequence_number
            .load(Ordering::Relaxed)
    }

    pub fn set_sequence_number(&self, value: u64) {
        self.segment()
            .metadata
            .sequence_number
            .store(value, Ordering::Relaxed);
    }

    pub fn chunk_number(&self) -> u64 {
        self.segment()
            .metadata
            .chunk_number
            .load(Ordering::Relaxed)
    }

    pub fn set_chunk_number(&self, value: u64) {
        self.segment()
            .metadata
            .chunk_number
            .store(value, Ordering::Relaxed);
    }

    pub fn is_last_chunk(&self) -> bool {
        self.segment().metadata.last_chunk.load(Ordering::Relaxed)
    }

    pub fn set_last_chunk(&self, value: bool) {
        self.segment()
            .metadata
            .last_chunk
            .store(value, Ordering::Relaxed);
    }

    pub fn origin_id(&self) -> OriginId {
        OriginId(self.segment().metadata.origin_id.load(Ordering::Relaxed))
    }

    pub fn set_origin_id(&self, origin: OriginId) {
        self.segment()
            .metadata
            .origin_id
            .store(origin.as_u64(), Ordering::Relaxed);
    }

    pub fn creation_timestamp_ms(&self) -> u64 {
        self.segment()
            .metadata
            .creation_timestamp_ms
            .load(Ordering::Relaxed)
    }

    pub fn set_creation_timestamp_ms(&self, value: u64) {
        self.segment()
            .metadata
            .creation_timestamp_ms
            .store(value, Ordering::Relaxed);
    }

    /// Attaches `child` to this buffer and returns its index.
    ///
    /// The child stays alive until this buffer's segment is recycled.
    /// Attaching a buffer to itself would keep the segment alive forever and
    /// is rejected with `None`.
    pub fn store_child_buffer(&self, child: TupleBuffer) -> Option<ChildBufferIndex> {
        if self.ptr_eq(&child) {
            return None;
        }
        let mut children = self.segment().children.lock();
        let index = u32::try_from(children.len()).ok()?;
        children.push(child);
        Some(ChildBufferIndex(index))
    }

    /// Returns a new handle onto the child stored at `index`.
    pub fn load_child_buffer(&self, index: ChildBufferIndex) -> Option<TupleBuffer> {
        self.segment()
            .children
            .lock()
            .get(index.0 as usize)
            .cloned()
    }

    pub fn number_of_child_buffers(&self) -> usize {
        self.segment().children.lock().len()
    }
}

impl Clone for TupleBuffer {
    #[inline]
    fn clone(&self) -> Self {
        self.segment().retain();
        Self {
            segment: self.segment,
        }
    }
}

impl Drop for TupleBuffer {
    #[inline]
    fn drop(&mut self) {
        if self.segment().release() {
            // SAFETY: this thread released the last reference.
            unsafe { MemorySegment::recycle(SegmentPtr(self.segment)) };
        }
    }
}

impl fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("ptr", &self.segment().data())
            .field("size", &self.buffer_size())
            .field("ref_count", &self.ref_count())
            .field("number_of_tuples", &self.number_of_tuples())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::BufferManager;

    fn manager() -> BufferManager {
        BufferManager::with_capacity(128, 4).expect("manager")
    }

    #[test]
    fn clone_increments_and_drop_decrements() {
        let manager = manager();
        let buffer = manager.get_buffer_blocking().expect("buffer");
        assert_eq!(buffer.ref_count(), 1);

        let copy = buffer.clone();
        assert_eq!(buffer.ref_count(), 2);
        assert!(copy.ptr_eq(&buffer));

        drop(copy);
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(manager.available_buffers(), 3);

        buffer.release();
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn move_keeps_refcount() {
        let manager = manager();
        let buffer = manager.get_buffer_blocking().expect("buffer");
        let moved = buffer;
        assert_eq!(moved.ref_count(), 1);
        let boxed = Box::new(moved);
        assert_eq!(boxed.ref_count(), 1);
    }

    #[test]
    fn get_mut_requires_unique_handle() {
        let manager = manager();
        let mut buffer = manager.get_buffer_blocking().expect("buffer");
        buffer.get_mut().expect("unique")[..4].copy_from_slice(&[1, 2, 3, 4]);

        let shared = buffer.retain();
        assert!(buffer.get_mut().is_none());
        assert_eq!(&shared.as_slice()[..4], &[1, 2, 3, 4]);
        drop(shared);
        assert!(buffer.get_mut().is_some());
    }

    #[test]
    fn typed_access_reports_element_capacity() {
        let manager = manager();
        let buffer = manager.get_buffer_blocking().expect("buffer");
        assert_eq!(buffer.capacity_of::<u64>(), 16);
        assert_eq!(buffer.capacity_of::<[u8; 3]>(), 42);

        let ptr = buffer.as_mut_ptr::<u64>();
        for i in 0..buffer.capacity_of::<u64>() {
            unsafe { ptr.add(i).write_unaligned(i as u64 * 10) };
        }
        buffer.set_number_of_tuples(16);
        let last = u64::from_ne_bytes(buffer.as_slice()[120..128].try_into().expect("8 bytes"));
        assert_eq!(last, 150);
        assert_eq!(buffer.number_of_tuples(), 16);
    }

    #[test]
    fn metadata_resets_on_recycle() {
        let manager = BufferManager::with_capacity(64, 1).expect("manager");
        let buffer = manager.get_buffer_blocking().expect("buffer");
        buffer.set_watermark(42);
        buffer.set_sequence_number(7);
        buffer.set_chunk_number(2);
        buffer.set_last_chunk(false);
        buffer.set_origin_id(crate::OriginId::new(3));
        buffer.set_creation_timestamp_ms(1_000);
        buffer.set_number_of_tuples(5);
        drop(buffer);

        let again = manager.get_buffer_blocking().expect("buffer");
        assert_eq!(again.watermark(), 0);
        assert_eq!(again.sequence_number(), 0);
        assert_eq!(again.chunk_number(), 0);
        assert!(again.is_last_chunk());
        assert_eq!(again.origin_id(), crate::OriginId::INVALID);
        assert_eq!(again.creation_timestamp_ms(), 0);
        assert_eq!(again.number_of_tuples(), 0);
    }

    #[test]
    fn children_live_until_parent_recycles() {
        let manager = manager();
        let parent = manager.get_buffer_blocking().expect("parent");
        let child = manager.get_unpooled_buffer(300).expect("child");
        assert_eq!(child.buffer_size(), 300);

        let index = parent.store_child_buffer(child).expect("index");
        assert_eq!(index, super::ChildBufferIndex(0));
        assert_eq!(parent.number_of_child_buffers(), 1);
        assert_eq!(manager.outstanding_unpooled(), 1);

        let loaded = parent.load_child_buffer(index).expect("child");
        assert_eq!(loaded.ref_count(), 2);
        drop(loaded);

        assert!(parent.load_child_buffer(super::ChildBufferIndex(1)).is_none());
        drop(parent);
        assert_eq!(manager.outstanding_unpooled(), 0);
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn storing_self_as_child_is_rejected() {
        let manager = manager();
        let parent = manager.get_buffer_blocking().expect("parent");
        assert!(parent.store_child_buffer(parent.clone()).is_none());
        assert_eq!(parent.ref_count(), 1);
    }
}
