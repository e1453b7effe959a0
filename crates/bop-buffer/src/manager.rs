use std::alloc::{Layout, alloc};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::config::{BufferManagerConfig, LocalBufferPoolConfig};
use crate::error::{BufferError, BufferResult};
use crate::local_pool::{FixedSizeBufferPool, LocalBufferPool, LocalShared};
use crate::metrics::{BufferManagerMetrics, BufferManagerMetricsSnapshot};
use crate::provider::{BufferProvider, BufferRecycler};
use crate::segment::{MemorySegment, Recycler, SegmentPtr};
use crate::tuple_buffer::TupleBuffer;

/// State shared by the manager handle and every segment it issued.
///
/// Every active pooled or unpooled segment holds a strong reference, so the
/// region outlives the last buffer even when the manager goes first.
pub(crate) struct PoolShared {
    config: BufferManagerConfig,
    region: NonNull<u8>,
    region_layout: Layout,
    segments: Box<[MemorySegment]>,
    free: ArrayQueue<SegmentPtr>,
    wait_lock: Mutex<()>,
    available: Condvar,
    waiting: CachePadded<AtomicUsize>,
    /// Signalled on every recycle while a fixed-size pool waits to reserve.
    reservable: Condvar,
    reserving: CachePadded<AtomicUsize>,
    shutdown: AtomicBool,
    unpooled_outstanding: AtomicUsize,
    unpooled_bytes: AtomicUsize,
    pools: Mutex<Vec<Weak<LocalShared>>>,
    metrics: BufferManagerMetrics,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    fn allocate(config: BufferManagerConfig) -> BufferResult<Arc<PoolShared>> {
        config.validate()?;
        let requested = config.region_bytes().ok_or(BufferError::OutOfMemory {
            requested: usize::MAX,
        })?;
        let region_layout = Layout::from_size_align(requested, config.alignment)
            .map_err(|_| BufferError::OutOfMemory { requested })?;
        let region = NonNull::new(unsafe { alloc(region_layout) })
            .ok_or(BufferError::OutOfMemory { requested })?;

        let stride = config.segment_stride();
        let segments: Box<[MemorySegment]> = (0..config.number_of_buffers)
            .map(|i| {
                let data = unsafe { NonNull::new_unchecked(region.as_ptr().add(i * stride)) };
                MemorySegment::borrowed(data, config.buffer_size)
            })
            .collect();

        let shared = Arc::new(PoolShared {
            config,
            region,
            region_layout,
            segments,
            free: ArrayQueue::new(config.number_of_buffers),
            wait_lock: Mutex::new(()),
            available: Condvar::new(),
            waiting: CachePadded::new(AtomicUsize::new(0)),
            reservable: Condvar::new(),
            reserving: CachePadded::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            unpooled_outstanding: AtomicUsize::new(0),
            unpooled_bytes: AtomicUsize::new(0),
            pools: Mutex::new(Vec::new()),
            metrics: BufferManagerMetrics::default(),
        });
        for segment in shared.segments.iter() {
            let _ = shared.free.push(SegmentPtr(NonNull::from(segment)));
        }
        Ok(shared)
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn metrics(&self) -> &BufferManagerMetrics {
        &self.metrics
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn outstanding_pooled(&self) -> usize {
        self.config.number_of_buffers - self.free.len()
    }

    pub(crate) fn outstanding_unpooled(&self) -> usize {
        self.unpooled_outstanding.load(Ordering::Acquire)
    }

    /// Pops a free segment without waiting. Fails only on shutdown.
    pub(crate) fn try_acquire(&self) -> BufferResult<Option<SegmentPtr>> {
        if self.is_shutdown() {
            return Err(BufferError::ShutdownInProgress);
        }
        Ok(self.free.pop())
    }

    /// Pops up to `max` free segments in one pass.
    pub(crate) fn try_acquire_batch(&self, max: usize, mut sink: impl FnMut(SegmentPtr)) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        let mut taken = 0;
        while taken < max {
            match self.free.pop() {
                Some(segment) => {
                    sink(segment);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Pops a free segment, waiting on the condition variable until one is
    /// recycled, the deadline passes or the manager shuts down.
    pub(crate) fn acquire(&self, deadline: Option<Instant>) -> BufferResult<SegmentPtr> {
        if let Some(segment) = self.try_acquire()? {
            return Ok(segment);
        }
        self.metrics.incr_blocked_waits();
        trace!(
            waiting = self.waiting.load(Ordering::Relaxed),
            "buffer pool exhausted, waiting"
        );
        match self.wait_for_segment(deadline)? {
            Some(segment) => Ok(segment),
            None => {
                self.metrics.incr_timeouts();
                Err(BufferError::PoolExhausted)
            }
        }
    }

    /// Parks until a segment is recycled. `Ok(None)` means the deadline
    /// passed with the free list still empty.
    pub(crate) fn wait_for_segment(
        &self,
        deadline: Option<Instant>,
    ) -> BufferResult<Option<SegmentPtr>> {
        let mut guard = self.wait_lock.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if self.is_shutdown() {
                break Err(BufferError::ShutdownInProgress);
            }
            if let Some(segment) = self.free.pop() {
                break Ok(Some(segment));
            }
            match deadline {
                None => self.available.wait(&mut guard),
                Some(deadline) => {
                    if self.available.wait_until(&mut guard, deadline).timed_out() {
                        break Ok(self.free.pop());
                    }
                }
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Takes exactly `n` segments in one step, waiting while fewer are free.
    ///
    /// Nothing is held while waiting, so concurrent reservations can never
    /// split the pool between them and stall each other.
    pub(crate) fn reserve(&self, n: usize) -> BufferResult<Vec<SegmentPtr>> {
        let mut guard = self.wait_lock.lock();
        self.reserving.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if self.is_shutdown() {
                break Err(BufferError::ShutdownInProgress);
            }
            if self.free.len() >= n {
                let mut taken = Vec::with_capacity(n);
                while taken.len() < n {
                    match self.free.pop() {
                        Some(segment) => taken.push(segment),
                        None => break,
                    }
                }
                if taken.len() == n {
                    break Ok(taken);
                }
                // A non-blocking acquirer raced us; hand everything back.
                for segment in taken {
                    let _ = self.free.push(segment);
                }
                self.available.notify_all();
            }
            trace!(n, free = self.free.len(), "waiting to reserve segments");
            self.reservable.wait(&mut guard);
        };
        self.reserving.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// True while some thread is parked in [`wait_for_segment`](Self::wait_for_segment).
    pub(crate) fn has_waiters(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn recycle_pooled(&self, segment: SegmentPtr) {
        if self.free.push(segment).is_err() {
            panic!("buffer free list overflow: a segment was recycled twice");
        }
        self.metrics.incr_recycled();
        // Pairs with the SeqCst increments of `waiting` and `reserving`.
        fence(Ordering::SeqCst);
        let waiting = self.waiting.load(Ordering::SeqCst) > 0;
        let reserving = self.reserving.load(Ordering::SeqCst) > 0;
        if waiting || reserving {
            let _guard = self.wait_lock.lock();
            if waiting {
                self.available.notify_one();
            }
            if reserving {
                self.reservable.notify_all();
            }
        }
    }

    pub(crate) fn release_unpooled(&self, size: usize) {
        self.unpooled_bytes.fetch_sub(size, Ordering::Relaxed);
        self.unpooled_outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn register_pool(&self, pool: &Arc<LocalShared>) {
        let mut pools = self.pools.lock();
        pools.retain(|weak| weak.strong_count() > 0);
        pools.push(Arc::downgrade(pool));
    }

    fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!(
                outstanding_pooled = self.outstanding_pooled(),
                outstanding_unpooled = self.outstanding_unpooled(),
                "buffer manager shutting down"
            );
        }
        {
            let _guard = self.wait_lock.lock();
            self.available.notify_all();
            self.reservable.notify_all();
        }
        let pools: Vec<Arc<LocalShared>> =
            self.pools.lock().iter().filter_map(Weak::upgrade).collect();
        for pool in pools {
            pool.wake_all();
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.region.as_ptr(), self.region_layout) };
    }
}

struct ManagerInner {
    shared: Arc<PoolShared>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.begin_shutdown();
        let pooled = shared.outstanding_pooled();
        let unpooled = shared.outstanding_unpooled();
        if pooled == 0 && unpooled == 0 {
            return;
        }
        // Outstanding handles keep the region alive until they are released.
        error!(pooled, unpooled, "buffer manager dropped with outstanding buffers");
        if pooled > 0 && !std::thread::panicking() {
            panic!("{}", BufferError::BufferLeak { pooled, unpooled });
        }
    }
}

/// Owner of a fixed pool of equally sized memory segments.
///
/// All segments are carved out of one region allocated at construction, so
/// acquisition and release never touch the allocator. The free list is a
/// lock-free queue; callers that find it empty either get `None`
/// ([`get_buffer_no_blocking`](Self::get_buffer_no_blocking)) or park on a
/// condition variable until another thread releases a buffer. That stall is
/// the data plane's backpressure.
///
/// Cloning the manager clones a handle; the pool is torn down with the last
/// handle. Every buffer must be released before that point: a manager that
/// goes away with outstanding pooled buffers panics. The region itself stays
/// alive until the last outstanding handle is released.
///
/// # Example
///
/// ```rust
/// use bop_buffer::BufferManager;
///
/// let manager = BufferManager::with_capacity(4096, 2).unwrap();
/// let a = manager.get_buffer_blocking().unwrap();
/// let b = manager.get_buffer_blocking().unwrap();
/// assert!(manager.get_buffer_no_blocking().is_none());
/// drop(a);
/// assert!(manager.get_buffer_no_blocking().is_some());
/// # drop(b);
/// ```
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<ManagerInner>,
}

impl BufferManager {
    pub fn new(config: BufferManagerConfig) -> BufferResult<Self> {
        let shared = PoolShared::allocate(config)?;
        debug!(
            buffer_size = config.buffer_size,
            number_of_buffers = config.number_of_buffers,
            alignment = config.alignment,
            "buffer manager created"
        );
        Ok(Self {
            inner: Arc::new(ManagerInner { shared }),
        })
    }

    pub fn with_capacity(buffer_size: usize, number_of_buffers: usize) -> BufferResult<Self> {
        Self::new(BufferManagerConfig::new(buffer_size, number_of_buffers))
    }

    #[inline]
    pub(crate) fn shared(&self) -> &PoolShared {
        &self.inner.shared
    }

    #[inline]
    fn pooled(&self, segment: SegmentPtr) -> TupleBuffer {
        self.shared().metrics().incr_pooled_acquisitions(1);
        let recycler = Recycler::Pool(Arc::clone(&self.inner.shared));
        unsafe { MemorySegment::activate(segment, recycler) }
    }

    pub fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        let segment = self.shared().acquire(None)?;
        Ok(self.pooled(segment))
    }

    pub fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        match self.shared().try_acquire() {
            Ok(Some(segment)) => Some(self.pooled(segment)),
            Ok(None) => {
                self.shared().metrics().incr_exhausted();
                None
            }
            Err(_) => None,
        }
    }

    pub fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        let segment = self.shared().acquire(Some(Instant::now() + timeout))?;
        Ok(self.pooled(segment))
    }

    /// Allocates a one-off buffer of `size` bytes outside the fixed pool.
    ///
    /// Used for payloads larger than the pooled buffer size. The allocation
    /// is freed when its last handle is released and never enters the free
    /// list.
    pub fn get_unpooled_buffer(&self, size: usize) -> BufferResult<TupleBuffer> {
        let shared = self.shared();
        if shared.is_shutdown() {
            return Err(BufferError::ShutdownInProgress);
        }
        let layout = Layout::from_size_align(size.max(1), shared.config.alignment)
            .map_err(|_| BufferError::OutOfMemory { requested: size })?;
        let data = NonNull::new(unsafe { alloc(layout) })
            .ok_or(BufferError::OutOfMemory { requested: size })?;
        let segment = Box::new(MemorySegment::owning(data, size, layout));
        let segment = SegmentPtr(NonNull::from(Box::leak(segment)));

        shared.unpooled_outstanding.fetch_add(1, Ordering::AcqRel);
        shared.unpooled_bytes.fetch_add(size, Ordering::Relaxed);
        shared.metrics().incr_unpooled_allocations();
        trace!(size, "allocated unpooled buffer");
        let recycler = Recycler::Unpooled(Arc::clone(&self.inner.shared));
        Ok(unsafe { MemorySegment::activate(segment, recycler) })
    }

    /// Wraps externally owned memory in a [`TupleBuffer`].
    ///
    /// When the last handle is released, `recycler` is notified instead of
    /// the segment returning to the pool.
    ///
    /// # Safety
    /// `data` must be valid for reads and writes of `len` bytes until
    /// `recycler` is called, and must not be accessed mutably elsewhere while
    /// handles exist.
    pub unsafe fn wrap_memory(
        data: NonNull<u8>,
        len: usize,
        recycler: Arc<dyn BufferRecycler>,
    ) -> TupleBuffer {
        let segment = Box::new(MemorySegment::borrowed(data, len));
        let segment = SegmentPtr(NonNull::from(Box::leak(segment)));
        unsafe { MemorySegment::activate(segment, Recycler::External(recycler)) }
    }

    /// Creates a per-thread pool refilled in batches from this manager.
    pub fn create_local_buffer_pool(
        &self,
        config: LocalBufferPoolConfig,
    ) -> BufferResult<LocalBufferPool> {
        LocalBufferPool::new(self.clone(), config)
    }

    /// Creates a pool that exclusively reserves `number_of_buffers` segments.
    pub fn create_fixed_size_buffer_pool(
        &self,
        number_of_buffers: usize,
    ) -> BufferResult<FixedSizeBufferPool> {
        FixedSizeBufferPool::new(self.clone(), number_of_buffers)
    }

    pub fn buffer_size(&self) -> usize {
        self.shared().config.buffer_size
    }

    pub fn number_of_pooled_buffers(&self) -> usize {
        self.shared().config.number_of_buffers
    }

    /// Segments currently in the global free list.
    pub fn available_buffers(&self) -> usize {
        self.shared().available()
    }

    pub fn outstanding_unpooled(&self) -> usize {
        self.shared().outstanding_unpooled()
    }

    pub fn unpooled_bytes(&self) -> usize {
        self.shared().unpooled_bytes.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> BufferManagerMetricsSnapshot {
        self.shared().metrics().snapshot()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared().is_shutdown()
    }

    /// Enters the terminal shutdown state.
    ///
    /// Blocked and future blocking acquisitions fail with
    /// `ShutdownInProgress`. Returns `BufferLeak` when buffers are still
    /// outstanding; buffers held by live local pools count as outstanding.
    pub fn shutdown(&self) -> BufferResult<()> {
        let shared = self.shared();
        shared.begin_shutdown();
        let pooled = shared.outstanding_pooled();
        let unpooled = shared.outstanding_unpooled();
        if pooled > 0 || unpooled > 0 {
            error!(pooled, unpooled, "buffer leak detected at shutdown");
            return Err(BufferError::BufferLeak { pooled, unpooled });
        }
        Ok(())
    }
}

impl BufferProvider for BufferManager {
    fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        BufferManager::get_buffer_blocking(self)
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        BufferManager::get_buffer_no_blocking(self)
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        BufferManager::get_buffer_timeout(self, timeout)
    }

    fn get_unpooled_buffer(&self, size: usize) -> BufferResult<TupleBuffer> {
        BufferManager::get_unpooled_buffer(self, size)
    }

    fn buffer_size(&self) -> usize {
        BufferManager::buffer_size(self)
    }

    fn available_buffers(&self) -> usize {
        BufferManager::available_buffers(self)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("buffer_size", &self.buffer_size())
            .field("number_of_buffers", &self.number_of_pooled_buffers())
            .field("available", &self.available_buffers())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
