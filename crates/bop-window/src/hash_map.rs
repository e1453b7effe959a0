//! Keyed partial-aggregate state stored in buffer-pool pages.
//!
//! Entries have a fixed layout and are appended to pages obtained from a
//! [`BufferProvider`]; an entry never moves once written, so growth only
//! rebuilds the bucket index.
//!
//! ```text
//!  entry: ┌──────────┬──────────┬──────────┬─────────────────────┐
//!         │ hash u64 │ key u64  │ next u64 │ value (padded to 8) │
//!         └──────────┴──────────┴──────────┴─────────────────────┘
//! ```
//!
//! `next` is the index of the following entry in the same bucket chain, or
//! `NO_ENTRY`.

use std::sync::Arc;

use bop_buffer::{BufferProvider, TupleBuffer};
use tracing::trace;

use crate::error::WindowResult;

const HASH_OFFSET: usize = 0;
const KEY_OFFSET: usize = 8;
const NEXT_OFFSET: usize = 16;
const ENTRY_HEADER_BYTES: usize = 24;
const NO_ENTRY: u64 = u64::MAX;
const INITIAL_BUCKETS: usize = 16;

/// Bytes one entry occupies for values of `value_size` bytes.
pub(crate) const fn entry_size(value_size: usize) -> usize {
    ENTRY_HEADER_BYTES + value_size.next_multiple_of(8)
}

/// Finalizer of MurmurHash3; spreads sequential keys across buckets.
#[inline]
fn hash_key(key: u64) -> u64 {
    let mut h = key;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

#[inline]
fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

/// Chained hash map from `u64` keys to fixed-size byte values.
///
/// Pages are unpooled buffers sized `page_size`, allocated on demand and
/// released when the map is dropped. Values are handed out as byte slices;
/// interpreting them is up to the aggregation that owns the map.
pub struct ChainedHashMap {
    provider: Arc<dyn BufferProvider>,
    value_size: usize,
    entry_size: usize,
    entries_per_page: usize,
    page_size: usize,
    pages: Vec<TupleBuffer>,
    buckets: Vec<u64>,
    len: usize,
}

impl ChainedHashMap {
    /// Creates an empty map. No memory is requested until the first insert.
    ///
    /// `page_size` must hold at least one entry.
    pub fn new(provider: Arc<dyn BufferProvider>, value_size: usize, page_size: usize) -> Self {
        let entry_size = entry_size(value_size);
        Self {
            provider,
            value_size,
            entry_size,
            entries_per_page: (page_size / entry_size).max(1),
            page_size: page_size.max(entry_size),
            pages: Vec::new(),
            buckets: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Pages currently allocated from the provider.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    fn locate(&self, index: u64) -> (usize, usize) {
        let index = index as usize;
        (
            index / self.entries_per_page,
            (index % self.entries_per_page) * self.entry_size,
        )
    }

    #[inline]
    fn entry(&self, index: u64) -> &[u8] {
        let (page, offset) = self.locate(index);
        &self.pages[page].as_slice()[offset..offset + self.entry_size]
    }

    #[inline]
    fn entry_mut(&mut self, index: u64) -> &mut [u8] {
        let (page, offset) = self.locate(index);
        let entry_size = self.entry_size;
        // SAFETY: pages are never cloned out of the map, so this is the only
        // handle that can reach the payload.
        let bytes = unsafe { self.pages[page].as_mut_slice_unchecked() };
        &mut bytes[offset..offset + entry_size]
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: u64) -> Option<u64> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let mut index = self.buckets[self.bucket_of(hash)];
        while index != NO_ENTRY {
            let entry = self.entry(index);
            if read_u64(entry, HASH_OFFSET) == hash && read_u64(entry, KEY_OFFSET) == key {
                return Some(index);
            }
            index = read_u64(entry, NEXT_OFFSET);
        }
        None
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        let index = self.find(key)?;
        let value_size = self.value_size;
        Some(&self.entry(index)[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + value_size])
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut [u8]> {
        let index = self.find(key)?;
        let value_size = self.value_size;
        Some(&mut self.entry_mut(index)[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + value_size])
    }

    /// Returns the value for `key`, inserting one initialized by `init` when
    /// the key is new. `init` receives zeroed bytes.
    pub fn find_or_insert_with<F>(&mut self, key: u64, init: F) -> WindowResult<&mut [u8]>
    where
        F: FnOnce(&mut [u8]),
    {
        let index = match self.find(key) {
            Some(index) => index,
            None => self.insert_new(key, init)?,
        };
        let value_size = self.value_size;
        Ok(&mut self.entry_mut(index)[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + value_size])
    }

    fn insert_new<F>(&mut self, key: u64, init: F) -> WindowResult<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        if self.len == self.pages.len() * self.entries_per_page {
            let page = self.provider.get_unpooled_buffer(self.page_size)?;
            self.pages.push(page);
            trace!(pages = self.pages.len(), "hash map allocated state page");
        }
        if self.buckets.is_empty() {
            self.buckets = vec![NO_ENTRY; INITIAL_BUCKETS];
        } else if self.len + 1 > self.buckets.len() / 4 * 3 {
            self.rehash(self.buckets.len() * 2);
        }

        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);
        let head = self.buckets[bucket];
        let index = self.len as u64;
        let value_size = self.value_size;
        let entry = self.entry_mut(index);
        entry.fill(0);
        write_u64(entry, HASH_OFFSET, hash);
        write_u64(entry, KEY_OFFSET, key);
        write_u64(entry, NEXT_OFFSET, head);
        init(&mut entry[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + value_size]);

        self.buckets[bucket] = index;
        self.len += 1;
        Ok(index)
    }

    fn rehash(&mut self, buckets: usize) {
        self.buckets = vec![NO_ENTRY; buckets];
        for index in 0..self.len as u64 {
            let hash = read_u64(self.entry(index), HASH_OFFSET);
            let bucket = self.bucket_of(hash);
            let head = self.buckets[bucket];
            write_u64(self.entry_mut(index), NEXT_OFFSET, head);
            self.buckets[bucket] = index;
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        (0..self.len as u64).map(move |index| {
            let entry = self.entry(index);
            (
                read_u64(entry, KEY_OFFSET),
                &entry[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + self.value_size],
            )
        })
    }
}

impl std::fmt::Debug for ChainedHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedHashMap")
            .field("len", &self.len)
            .field("value_size", &self.value_size)
            .field("pages", &self.pages.len())
            .finish()
    }
}
