//! Buffer pools layered on top of the [`BufferManager`].
//!
//! [`LocalBufferPool`] amortizes contention on the global free list by
//! pulling segments in batches and keeping recycled ones close to the thread
//! that uses them. [`FixedSizeBufferPool`] reserves a fixed share of the
//! manager up front so one consumer cannot starve the others.
//!
//! Buffers issued by either pool remember the pool, and return to it when
//! their last handle is released. Once a pool is dropped its cache drains
//! back to the manager and later releases bypass it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::LocalBufferPoolConfig;
use crate::error::{BufferError, BufferResult};
use crate::manager::BufferManager;
use crate::provider::BufferProvider;
use crate::segment::{MemorySegment, Recycler, SegmentPtr};
use crate::tuple_buffer::TupleBuffer;

#[derive(Debug, Clone, Copy)]
enum PoolKind {
    Local(LocalBufferPoolConfig),
    Fixed,
}

/// State shared by a pool handle and every buffer it issued.
pub(crate) struct LocalShared {
    manager: BufferManager,
    kind: PoolKind,
    cache: ArrayQueue<SegmentPtr>,
    closed: AtomicBool,
    wait_lock: Mutex<()>,
    available: Condvar,
    waiting: CachePadded<AtomicUsize>,
}

impl LocalShared {
    fn new(manager: BufferManager, kind: PoolKind, capacity: usize) -> Self {
        Self {
            manager,
            kind,
            cache: ArrayQueue::new(capacity),
            closed: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            available: Condvar::new(),
            waiting: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Takes back a segment whose last handle was released.
    pub(crate) fn recycle(&self, segment: SegmentPtr) {
        let global = self.manager.shared();
        if self.closed.load(Ordering::Acquire) {
            global.recycle_pooled(segment);
            return;
        }
        // A thread parked on the manager needs the segment more than our cache.
        if matches!(self.kind, PoolKind::Local(_)) && global.has_waiters() {
            global.recycle_pooled(segment);
            return;
        }
        if let Err(segment) = self.cache.push(segment) {
            global.recycle_pooled(segment);
            return;
        }
        // Pairs with the fences in `close` and `LocalBufferPool::park`: either
        // we see the flag or waiter, or they see our segment.
        fence(Ordering::SeqCst);
        if self.closed.load(Ordering::Relaxed) {
            self.drain_to_global();
            return;
        }
        if self.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        match self.kind {
            // A blocked local pool is parked on the manager; hand it a
            // segment there.
            PoolKind::Local(_) => {
                if let Some(segment) = self.cache.pop() {
                    global.recycle_pooled(segment);
                }
            }
            PoolKind::Fixed => {
                let _guard = self.wait_lock.lock();
                self.available.notify_one();
            }
        }
    }

    /// Wakes every thread parked on this pool's condition variable.
    pub(crate) fn wake_all(&self) {
        let _guard = self.wait_lock.lock();
        self.available.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let drained = self.drain_to_global();
        self.wake_all();
        debug!(kind = ?self.kind, drained, "buffer pool closed");
    }

    fn drain_to_global(&self) -> usize {
        let global = self.manager.shared();
        let mut drained = 0;
        while let Some(segment) = self.cache.pop() {
            global.recycle_pooled(segment);
            drained += 1;
        }
        drained
    }

    fn issue(self: &Arc<Self>, segment: SegmentPtr) -> TupleBuffer {
        unsafe { MemorySegment::activate(segment, Recycler::Local(Arc::clone(self))) }
    }
}

impl Drop for LocalShared {
    fn drop(&mut self) {
        self.drain_to_global();
    }
}

/// Per-thread cache of segments refilled in batches from a
/// [`BufferManager`].
///
/// # Example
///
/// ```rust
/// use bop_buffer::{BufferManager, LocalBufferPoolConfig};
///
/// let manager = BufferManager::with_capacity(1024, 32).unwrap();
/// let pool = manager
///     .create_local_buffer_pool(LocalBufferPoolConfig { batch_size: 8, max_cached: 16 })
///     .unwrap();
/// let buffer = pool.get_buffer_no_blocking().unwrap();
/// assert_eq!(manager.available_buffers(), 24);
/// drop(buffer);
/// assert_eq!(pool.cached(), 8);
/// ```
pub struct LocalBufferPool {
    shared: Arc<LocalShared>,
    config: LocalBufferPoolConfig,
}

impl LocalBufferPool {
    pub(crate) fn new(manager: BufferManager, config: LocalBufferPoolConfig) -> BufferResult<Self> {
        config.validate()?;
        if manager.is_shutdown() {
            return Err(BufferError::ShutdownInProgress);
        }
        let shared = Arc::new(LocalShared::new(
            manager,
            PoolKind::Local(config),
            config.max_cached,
        ));
        Ok(Self { shared, config })
    }

    /// Segments currently parked in this pool's cache.
    pub fn cached(&self) -> usize {
        self.shared.cache.len()
    }

    pub fn config(&self) -> LocalBufferPoolConfig {
        self.config
    }

    fn try_get(&self) -> BufferResult<Option<TupleBuffer>> {
        if self.shared.manager.is_shutdown() {
            return Err(BufferError::ShutdownInProgress);
        }
        if let Some(segment) = self.shared.cache.pop() {
            return Ok(Some(self.shared.issue(segment)));
        }
        Ok(self.refill().map(|segment| self.shared.issue(segment)))
    }

    /// Pulls up to one batch from the manager; returns one segment to issue
    /// and caches the rest.
    fn refill(&self) -> Option<SegmentPtr> {
        let global = self.shared.manager.shared();
        let mut first = None;
        let taken = global.try_acquire_batch(self.config.batch_size, |segment| {
            if first.is_none() {
                first = Some(segment);
            } else if let Err(segment) = self.shared.cache.push(segment) {
                global.recycle_pooled(segment);
            }
        });
        if taken > 0 {
            global.metrics().incr_pooled_acquisitions(taken as u64);
            trace!(taken, "local buffer pool refilled");
        }
        first
    }

    fn get_until(&self, deadline: Option<Instant>) -> BufferResult<TupleBuffer> {
        if let Some(buffer) = self.try_get()? {
            return Ok(buffer);
        }
        let shared = &self.shared;
        shared.manager.shared().metrics().incr_blocked_waits();
        shared.waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.park(deadline);
        shared.waiting.fetch_sub(1, Ordering::SeqCst);
        result.map(|segment| shared.issue(segment))
    }

    /// Waits on the manager's condition variable. Releases into this pool's
    /// cache are forwarded to the manager while `waiting` is raised.
    fn park(&self, deadline: Option<Instant>) -> BufferResult<SegmentPtr> {
        fence(Ordering::SeqCst);
        if let Some(segment) = self.shared.cache.pop() {
            return Ok(segment);
        }
        let global = self.shared.manager.shared();
        match global.wait_for_segment(deadline)? {
            Some(segment) => {
                global.metrics().incr_pooled_acquisitions(1);
                Ok(segment)
            }
            None => {
                global.metrics().incr_timeouts();
                Err(BufferError::PoolExhausted)
            }
        }
    }

    pub fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        self.get_until(None)
    }

    pub fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        match self.try_get() {
            Ok(Some(buffer)) => Some(buffer),
            Ok(None) => {
                self.shared.manager.shared().metrics().incr_exhausted();
                None
            }
            Err(_) => None,
        }
    }

    pub fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        self.get_until(Some(Instant::now() + timeout))
    }
}

impl Drop for LocalBufferPool {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl BufferProvider for LocalBufferPool {
    fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        LocalBufferPool::get_buffer_blocking(self)
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        LocalBufferPool::get_buffer_no_blocking(self)
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        LocalBufferPool::get_buffer_timeout(self, timeout)
    }

    fn get_unpooled_buffer(&self, size: usize) -> BufferResult<TupleBuffer> {
        self.shared.manager.get_unpooled_buffer(size)
    }

    fn buffer_size(&self) -> usize {
        self.shared.manager.buffer_size()
    }

    fn available_buffers(&self) -> usize {
        self.cached() + self.shared.manager.available_buffers()
    }
}

/// Pool owning an exclusive reservation of `n` segments.
///
/// Acquisition never touches the manager's free list again, which isolates
/// the consumer from every other pool user. When all reserved segments are in
/// use, blocking acquisition waits for one of them to come back.
pub struct FixedSizeBufferPool {
    shared: Arc<LocalShared>,
    reserved: usize,
}

impl FixedSizeBufferPool {
    pub(crate) fn new(manager: BufferManager, reserved: usize) -> BufferResult<Self> {
        if reserved == 0 || reserved > manager.number_of_pooled_buffers() {
            return Err(BufferError::invalid_config(format!(
                "fixed pool size {} must be in 1..={}",
                reserved,
                manager.number_of_pooled_buffers()
            )));
        }
        let segments = manager.shared().reserve(reserved)?;
        let shared = Arc::new(LocalShared::new(manager, PoolKind::Fixed, reserved));
        for segment in segments {
            let _ = shared.cache.push(segment);
        }
        let global = shared.manager.shared();
        global.register_pool(&shared);
        global.metrics().incr_pooled_acquisitions(reserved as u64);
        debug!(reserved, "fixed-size buffer pool created");
        Ok(Self { shared, reserved })
    }

    /// Number of segments reserved at creation.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    fn try_get(&self) -> BufferResult<Option<TupleBuffer>> {
        if self.shared.manager.is_shutdown() {
            return Err(BufferError::ShutdownInProgress);
        }
        Ok(self
            .shared
            .cache
            .pop()
            .map(|segment| self.shared.issue(segment)))
    }

    fn get_until(&self, deadline: Option<Instant>) -> BufferResult<TupleBuffer> {
        if let Some(buffer) = self.try_get()? {
            return Ok(buffer);
        }
        let shared = &self.shared;
        let mut guard = shared.wait_lock.lock();
        shared.waiting.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if shared.manager.is_shutdown() {
                break Err(BufferError::ShutdownInProgress);
            }
            if let Some(segment) = shared.cache.pop() {
                break Ok(segment);
            }
            match deadline {
                None => shared.available.wait(&mut guard),
                Some(deadline) => {
                    if shared.available.wait_until(&mut guard, deadline).timed_out() {
                        break shared.cache.pop().ok_or(BufferError::PoolExhausted);
                    }
                }
            }
        };
        shared.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        result.map(|segment| shared.issue(segment))
    }

    pub fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        self.get_until(None)
    }

    pub fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        self.try_get().ok().flatten()
    }

    pub fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        self.get_until(Some(Instant::now() + timeout))
    }
}

impl Drop for FixedSizeBufferPool {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl BufferProvider for FixedSizeBufferPool {
    fn get_buffer_blocking(&self) -> BufferResult<TupleBuffer> {
        FixedSizeBufferPool::get_buffer_blocking(self)
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        FixedSizeBufferPool::get_buffer_no_blocking(self)
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> BufferResult<TupleBuffer> {
        FixedSizeBufferPool::get_buffer_timeout(self, timeout)
    }

    fn get_unpooled_buffer(&self, size: usize) -> BufferResult<TupleBuffer> {
        self.shared.manager.get_unpooled_buffer(size)
    }

    fn buffer_size(&self) -> usize {
        self.shared.manager.buffer_size()
    }

    fn available_buffers(&self) -> usize {
        self.shared.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(manager: &BufferManager, batch_size: usize, max_cached: usize) -> LocalBufferPool {
        manager
            .create_local_buffer_pool(LocalBufferPoolConfig {
                batch_size,
                max_cached,
            })
            .expect("local pool")
    }

    #[test]
    fn refill_pulls_one_batch() {
        let manager = BufferManager::with_capacity(64, 20).expect("manager");
        let pool = local(&manager, 4, 8);
        let first = pool.get_buffer_no_blocking().expect("buffer");
        assert_eq!(manager.available_buffers(), 16);
        assert_eq!(pool.cached(), 3);
        assert_eq!(manager.metrics().pooled_acquisitions, 4);

        let _rest: Vec<_> = (0..3)
            .map(|_| pool.get_buffer_no_blocking().expect("cached"))
            .collect();
        assert_eq!(pool.cached(), 0);
        assert_eq!(manager.available_buffers(), 16);
        drop(first);
        assert_eq!(pool.cached(), 1);
    }

    #[test]
    fn overflow_returns_to_manager() {
        let manager = BufferManager::with_capacity(64, 10).expect("manager");
        let pool = local(&manager, 2, 2);
        let buffers: Vec<_> = (0..6)
            .map(|_| pool.get_buffer_no_blocking().expect("buffer"))
            .collect();
        assert_eq!(manager.available_buffers(), 4);
        drop(buffers);
        assert_eq!(pool.cached(), 2);
        assert_eq!(manager.available_buffers(), 8);
    }

    #[test]
    fn dropping_pool_drains_cache_and_redirects_releases() {
        let manager = BufferManager::with_capacity(64, 8).expect("manager");
        let pool = local(&manager, 4, 4);
        let held = pool.get_buffer_no_blocking().expect("buffer");
        assert_eq!(pool.cached(), 3);
        drop(pool);
        assert_eq!(manager.available_buffers(), 7);
        drop(held);
        assert_eq!(manager.available_buffers(), 8);
        assert_eq!(manager.shutdown(), Ok(()));
    }

    #[test]
    fn local_timeout_when_everything_is_held() {
        let manager = BufferManager::with_capacity(64, 2).expect("manager");
        let pool = local(&manager, 2, 2);
        let _a = pool.get_buffer_blocking().expect("a");
        let _b = pool.get_buffer_blocking().expect("b");
        let err = pool
            .get_buffer_timeout(Duration::from_millis(20))
            .expect_err("exhausted");
        assert_eq!(err, BufferError::PoolExhausted);
    }

    #[test]
    fn blocked_local_pool_takes_release_into_its_own_cache() {
        let manager = BufferManager::with_capacity(64, 2).expect("manager");
        let pool = Arc::new(local(&manager, 2, 2));
        let a = pool.get_buffer_blocking().expect("a");
        let b = pool.get_buffer_blocking().expect("b");
        assert_eq!(pool.cached(), 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                pool.get_buffer_blocking()
                    .map(|buffer| buffer.buffer_size())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        drop(a);
        assert_eq!(waiter.join().expect("join"), Ok(64));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(b);
        assert_eq!(pool.cached() + manager.available_buffers(), 2);
    }

    #[test]
    fn fixed_pool_reservation_is_all_or_nothing() {
        let manager = BufferManager::with_capacity(64, 4).expect("manager");
        let held: Vec<_> = (0..2)
            .map(|_| manager.get_buffer_blocking().expect("held"))
            .collect();
        let creator = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                manager
                    .create_fixed_size_buffer_pool(3)
                    .map(|fixed| fixed.reserved())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        // Waiting to reserve holds nothing back from other acquirers.
        assert_eq!(manager.available_buffers(), 2);
        let borrowed = manager.get_buffer_no_blocking().expect("still free");
        drop(borrowed);

        drop(held);
        assert_eq!(creator.join().expect("join"), Ok(3));
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn fixed_pool_reserves_and_isolates() {
        let manager = BufferManager::with_capacity(64, 6).expect("manager");
        let fixed = manager.create_fixed_size_buffer_pool(4).expect("fixed");
        assert_eq!(fixed.reserved(), 4);
        assert_eq!(manager.available_buffers(), 2);
        assert_eq!(BufferProvider::available_buffers(&fixed), 4);

        let held: Vec<_> = (0..4)
            .map(|_| fixed.get_buffer_no_blocking().expect("reserved"))
            .collect();
        assert!(fixed.get_buffer_no_blocking().is_none());
        assert_eq!(manager.available_buffers(), 2);

        drop(held);
        assert_eq!(BufferProvider::available_buffers(&fixed), 4);
        assert_eq!(manager.available_buffers(), 2);

        drop(fixed);
        assert_eq!(manager.available_buffers(), 6);
    }

    #[test]
    fn fixed_pool_rejects_oversized_reservation() {
        let manager = BufferManager::with_capacity(64, 2).expect("manager");
        assert!(matches!(
            manager.create_fixed_size_buffer_pool(3),
            Err(BufferError::InvalidConfig(_))
        ));
        assert!(matches!(
            manager.create_fixed_size_buffer_pool(0),
            Err(BufferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fixed_pool_blocking_wakes_on_release() {
        let manager = BufferManager::with_capacity(64, 2).expect("manager");
        let fixed = Arc::new(manager.create_fixed_size_buffer_pool(1).expect("fixed"));
        let held = fixed.get_buffer_blocking().expect("held");

        let waiter = {
            let fixed = Arc::clone(&fixed);
            std::thread::spawn(move || fixed.get_buffer_blocking().map(|b| b.buffer_size()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().expect("join"), Ok(64));
    }
}
