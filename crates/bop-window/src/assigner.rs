use serde::{Deserialize, Serialize};

use crate::error::{WindowError, WindowResult};

/// Maps event timestamps onto slice boundaries.
///
/// A slice is the largest time range that belongs to the same set of
/// windows. For tumbling windows every slice is a window; for sliding
/// windows slices are cut at both slide boundaries and window ends, so each
/// window is a union of whole slices. Boundaries are half-open:
/// `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceAssigner {
    window_size: u64,
    window_slide: u64,
}

impl SliceAssigner {
    pub fn new(window_size: u64, window_slide: u64) -> WindowResult<Self> {
        if window_slide == 0 || window_slide > window_size {
            return Err(WindowError::invalid_config(format!(
                "window_slide {window_slide} must be in 1..={window_size}"
            )));
        }
        Ok(Self {
            window_size,
            window_slide,
        })
    }

    pub fn tumbling(window_size: u64) -> WindowResult<Self> {
        Self::new(window_size, window_size)
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn window_slide(&self) -> u64 {
        self.window_slide
    }

    pub fn is_tumbling(&self) -> bool {
        self.window_size == self.window_slide
    }

    /// Start of the slice containing `ts`.
    pub fn slice_start_ts(&self, ts: u64) -> u64 {
        let prev_slide_start = ts - ts % self.window_slide;
        let prev_window_start = if ts < self.window_size {
            prev_slide_start
        } else {
            ts - (ts - self.window_size) % self.window_slide
        };
        prev_slide_start.max(prev_window_start)
    }

    /// Exclusive end of the slice containing `ts`, clamped to `u64::MAX`.
    pub fn slice_end_ts(&self, ts: u64) -> u64 {
        let next_slide_end = (ts - ts % self.window_slide).saturating_add(self.window_slide);
        let next_window_end = if ts < self.window_size {
            self.window_size
        } else {
            (ts - (ts - self.window_size) % self.window_slide).saturating_add(self.window_slide)
        };
        next_slide_end.min(next_window_end)
    }
}
