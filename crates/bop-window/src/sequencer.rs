//! Lock-free contiguous-watermark tracking.
//!
//! Upstream stages stamp every buffer with a sequence number and a
//! watermark. Buffers overtake each other on their way through worker
//! threads, so the watermark a window operator may act on is the one carried
//! by the highest sequence number below which *every* number has been seen.
//!
//! ```text
//!  block 0                      block 1
//!  ┌───┬───┬───┬───┬─ … ─┐  next ┌───┬───┬─ … ─┐
//!  │ ✓ │ ✓ │ ✓ │   │     │ ────▶ │ ✓ │   │     │
//!  └───┴───┴───┴───┴─ … ─┘       └───┴───┴─ … ─┘
//!                ▲ cursor (first unfilled slot)
//! ```
//!
//! Slots live in fixed-size blocks linked by CAS-installed `next` pointers.
//! A writer fills its own slot, then helps move the shared cursor past every
//! filled slot, raising `current` as it goes. Writers never wait on each
//! other. Once the cursor leaves a block behind, the block is unlinked and
//! handed to the epoch collector, so memory stays bounded by the spread of
//! in-flight sequence numbers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use tracing::{trace, warn};

use crate::config::SequencerConfig;

const BLOCK_SLOTS: u64 = 1024;

struct Slot {
    value: AtomicU64,
    filled: AtomicBool,
}

struct Block {
    base: u64,
    slots: Box<[Slot]>,
    next: Atomic<Block>,
}

impl Block {
    fn new(base: u64) -> Block {
        let slots = (0..BLOCK_SLOTS)
            .map(|_| Slot {
                value: AtomicU64::new(0),
                filled: AtomicBool::new(false),
            })
            .collect();
        Block {
            base,
            slots,
            next: Atomic::null(),
        }
    }

    #[inline]
    fn contains(&self, seq: u64) -> bool {
        seq >= self.base && seq - self.base < BLOCK_SLOTS
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq - self.base) as usize]
    }
}

/// Tracks the value attached to the highest contiguous sequence number.
///
/// `update` may be called concurrently from any number of threads, each with
/// a distinct sequence number. A number that is never written stalls the
/// sequencer for good; [`current_sequence`](Self::current_sequence) shows
/// where it is stuck.
///
/// # Example
///
/// ```rust
/// use bop_window::WatermarkSequencer;
///
/// let sequencer = WatermarkSequencer::new();
/// sequencer.update(1, 100);
/// assert_eq!(sequencer.current(), 0);
/// sequencer.update(0, 50);
/// assert_eq!(sequencer.current(), 100);
/// assert_eq!(sequencer.current_sequence(), Some(1));
/// ```
pub struct WatermarkSequencer {
    /// Oldest linked block. Holds the cursor or an earlier slot and only
    /// moves forward; never null.
    frontier: Atomic<Block>,
    /// First sequence number not yet known to be contiguous.
    cursor: CachePadded<AtomicU64>,
    current: CachePadded<AtomicU64>,
    linked_blocks: AtomicUsize,
    first_sequence: u64,
}

impl Default for WatermarkSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl WatermarkSequencer {
    pub fn new() -> Self {
        Self::with_config(SequencerConfig::default())
    }

    pub fn with_config(config: SequencerConfig) -> Self {
        Self {
            frontier: Atomic::new(Block::new(config.first_sequence)),
            cursor: CachePadded::new(AtomicU64::new(config.first_sequence)),
            current: CachePadded::new(AtomicU64::new(0)),
            linked_blocks: AtomicUsize::new(1),
            first_sequence: config.first_sequence,
        }
    }

    /// Value carried by the highest contiguous sequence number, or 0 before
    /// the first number arrives.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Highest sequence number below which every number has been written.
    pub fn current_sequence(&self) -> Option<u64> {
        let cursor = self.cursor.load(Ordering::SeqCst);
        (cursor > self.first_sequence).then(|| cursor - 1)
    }

    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }

    /// Blocks still reachable from the frontier.
    pub fn linked_blocks(&self) -> usize {
        self.linked_blocks.load(Ordering::Relaxed)
    }

    /// Records `value` for `seq` and returns the contiguous value after the
    /// write has been folded in.
    pub fn update(&self, seq: u64, value: u64) -> u64 {
        if seq < self.cursor.load(Ordering::SeqCst) {
            warn!(seq, value, "ignoring sequence number at or behind the cursor");
            return self.current();
        }
        let guard = &epoch::pin();
        let Some(block) = self.locate(seq, guard) else {
            warn!(seq, value, "ignoring sequence number behind the frontier");
            return self.current();
        };
        let slot = block.slot(seq);
        if slot.filled.load(Ordering::Acquire) {
            warn!(seq, value, "ignoring duplicate sequence number");
            return self.current();
        }
        slot.value.store(value, Ordering::Relaxed);
        slot.filled.store(true, Ordering::SeqCst);
        self.advance(guard);
        self.current()
    }

    /// Finds the block for `seq`, installing missing blocks on the way.
    /// Returns `None` when `seq` lies before the frontier block.
    fn locate<'g>(&self, seq: u64, guard: &'g Guard) -> Option<&'g Block> {
        // SAFETY: the frontier is never null, and pinned readers keep retired
        // blocks alive.
        let mut block = unsafe { self.frontier.load(Ordering::Acquire, guard).deref() };
        if seq < block.base {
            return None;
        }
        while !block.contains(seq) {
            block = self.next_or_install(block, guard);
        }
        Some(block)
    }

    fn next_or_install<'g>(&self, block: &'g Block, guard: &'g Guard) -> &'g Block {
        let next = block.next.load(Ordering::Acquire, guard);
        if let Some(next) = unsafe { next.as_ref() } {
            return next;
        }
        let base = block.base + BLOCK_SLOTS;
        match block.next.compare_exchange(
            Shared::null(),
            Owned::new(Block::new(base)),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(installed) => {
                self.linked_blocks.fetch_add(1, Ordering::Relaxed);
                trace!(base, "installed sequencer block");
                unsafe { installed.deref() }
            }
            // Another writer installed the block first; ours drops with the error.
            Err(lost) => unsafe { lost.current.deref() },
        }
    }

    /// Finds the block for `seq` without installing anything, moving the
    /// frontier forward past blocks the cursor has left behind.
    fn find<'g>(&self, seq: u64, guard: &'g Guard) -> Option<&'g Block> {
        let start = self.frontier.load(Ordering::Acquire, guard);
        let mut found = start;
        let mut block = unsafe { start.deref() };
        if seq < block.base {
            return None;
        }
        while !block.contains(seq) {
            let next = block.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return None;
            }
            found = next;
            block = unsafe { next.deref() };
        }
        if found != start
            && self
                .frontier
                .compare_exchange(start, found, Ordering::AcqRel, Ordering::Relaxed, guard)
                .is_ok()
        {
            self.retire(start, found, guard);
        }
        Some(block)
    }

    /// Hands every block from `from` up to, not including, `to` to the epoch
    /// collector. Only the thread whose CAS unlinked the range calls this.
    fn retire<'g>(&self, from: Shared<'g, Block>, to: Shared<'g, Block>, guard: &'g Guard) {
        let mut block = from;
        let mut retired = 0;
        while block != to {
            let next = unsafe { block.deref() }.next.load(Ordering::Acquire, guard);
            // SAFETY: the frontier has moved past `block`, so no new reader
            // can reach it; readers pinned earlier delay the free.
            unsafe { guard.defer_destroy(block) };
            retired += 1;
            block = next;
        }
        self.linked_blocks.fetch_sub(retired, Ordering::Relaxed);
        trace!(retired, "retired sequencer blocks");
    }

    /// Moves the cursor past every filled slot.
    fn advance(&self, guard: &Guard) {
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            let Some(block) = self.find(cursor, guard) else {
                return;
            };
            let slot = block.slot(cursor);
            if !slot.filled.load(Ordering::SeqCst) {
                return;
            }
            let value = slot.value.load(Ordering::Relaxed);
            if self
                .cursor
                .compare_exchange(cursor, cursor + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.current.fetch_max(value, Ordering::AcqRel);
            }
        }
    }
}

impl Drop for WatermarkSequencer {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers; retired blocks
        // are already owned by the collector.
        unsafe {
            let guard = epoch::unprotected();
            let mut block = self.frontier.load(Ordering::Relaxed, guard);
            while !block.is_null() {
                let next = block.deref().next.load(Ordering::Relaxed, guard);
                drop(block.into_owned());
                block = next;
            }
        }
    }
}

impl std::fmt::Debug for WatermarkSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkSequencer")
            .field("current", &self.current())
            .field("current_sequence", &self.current_sequence())
            .field("linked_blocks", &self.linked_blocks())
            .finish()
    }
}
