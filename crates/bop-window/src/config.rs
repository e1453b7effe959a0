use serde::{Deserialize, Serialize};

use crate::error::{WindowError, WindowResult};
use crate::hash_map::entry_size;

/// Default window length, in timestamp units.
const DEFAULT_WINDOW_SIZE: u64 = 1_000;

/// Default bytes of partial-aggregate state per key.
const DEFAULT_VALUE_SIZE: usize = 8;

/// Default size of each state page allocated for a slice.
const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Window shape and per-slice state layout of a
/// [`KeyedThreadLocalSliceStore`](crate::KeyedThreadLocalSliceStore).
///
/// `window_size == window_slide` describes tumbling windows; a slide smaller
/// than the size describes sliding windows, which are cut into finer slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceStoreConfig {
    pub window_size: u64,
    pub window_slide: u64,
    /// Bytes of aggregate state stored per key.
    pub value_size: usize,
    /// Bytes per state page; every page holds a whole number of entries.
    pub page_size: usize,
}

impl Default for SliceStoreConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            window_slide: DEFAULT_WINDOW_SIZE,
            value_size: DEFAULT_VALUE_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SliceStoreConfig {
    pub fn tumbling(window_size: u64) -> Self {
        Self {
            window_size,
            window_slide: window_size,
            ..Self::default()
        }
    }

    pub fn sliding(window_size: u64, window_slide: u64) -> Self {
        Self {
            window_size,
            window_slide,
            ..Self::default()
        }
    }

    pub fn with_value_size(mut self, value_size: usize) -> Self {
        self.value_size = value_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> WindowResult<()> {
        if self.window_slide == 0 || self.window_slide > self.window_size {
            return Err(WindowError::invalid_config(format!(
                "window_slide {} must be in 1..={}",
                self.window_slide, self.window_size
            )));
        }
        if self.value_size == 0 {
            return Err(WindowError::invalid_config("value_size must be > 0"));
        }
        let entry = entry_size(self.value_size);
        if self.page_size < entry {
            return Err(WindowError::invalid_config(format!(
                "page_size {} cannot hold one {}-byte entry",
                self.page_size, entry
            )));
        }
        Ok(())
    }
}

/// Numbering of a [`WatermarkSequencer`](crate::WatermarkSequencer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Sequence number of the first expected write.
    pub first_sequence: u64,
}

impl SequencerConfig {
    pub fn starting_at(first_sequence: u64) -> Self {
        Self { first_sequence }
    }
}
