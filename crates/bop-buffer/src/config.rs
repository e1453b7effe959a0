use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::{BufferError, BufferResult};

/// Default payload size of a pooled segment (4 KiB).
const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Default number of segments carved out of the pool region.
const DEFAULT_NUMBER_OF_BUFFERS: usize = 1024;

/// Default alignment of every segment payload.
///
/// One cache line, so adjacent segments written by different workers never
/// share a line.
const DEFAULT_ALIGNMENT: usize = 64;

/// Default number of segments a local pool pulls from the manager per refill.
const DEFAULT_LOCAL_BATCH_SIZE: usize = 16;

/// Default number of recycled segments a local pool keeps before handing the
/// surplus back to the manager.
const DEFAULT_LOCAL_MAX_CACHED: usize = 64;

/// Logical upstream source whose sequence and watermark progress is tracked
/// independently.
///
/// # Example
///
/// ```rust
/// use bop_buffer::OriginId;
///
/// let origin = OriginId::new(7);
/// assert_eq!(origin.as_u64(), 7);
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OriginId(pub u64);

impl OriginId {
    /// Origin used by buffers that were never stamped by a source.
    pub const INVALID: OriginId = OriginId(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for OriginId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Sizing of the fixed segment pool owned by a [`BufferManager`].
///
/// The pool is allocated once, up front, as a single region of
/// `buffer_size * number_of_buffers` bytes. Its size bounds the memory the
/// data plane can hold in flight; exhausting it stalls producers.
///
/// [`BufferManager`]: crate::BufferManager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferManagerConfig {
    /// Payload bytes per pooled segment.
    pub buffer_size: usize,
    /// Number of pooled segments.
    pub number_of_buffers: usize,
    /// Alignment of each segment payload. Must be a power of two.
    pub alignment: usize,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            number_of_buffers: DEFAULT_NUMBER_OF_BUFFERS,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl BufferManagerConfig {
    pub fn new(buffer_size: usize, number_of_buffers: usize) -> Self {
        Self {
            buffer_size,
            number_of_buffers,
            ..Self::default()
        }
    }

    /// Segment stride inside the pool region: the buffer size rounded up to
    /// the alignment.
    pub fn segment_stride(&self) -> usize {
        self.buffer_size.next_multiple_of(self.alignment)
    }

    /// Total bytes of the pool region, or `None` if it overflows `usize`.
    pub fn region_bytes(&self) -> Option<usize> {
        self.segment_stride().checked_mul(self.number_of_buffers)
    }

    pub fn validate(&self) -> BufferResult<()> {
        if self.buffer_size == 0 {
            return Err(BufferError::invalid_config("buffer_size must be > 0"));
        }
        if self.number_of_buffers == 0 {
            return Err(BufferError::invalid_config("number_of_buffers must be > 0"));
        }
        if self.number_of_buffers > u32::MAX as usize {
            return Err(BufferError::invalid_config(format!(
                "number_of_buffers {} exceeds {}",
                self.number_of_buffers,
                u32::MAX
            )));
        }
        if !self.alignment.is_power_of_two() {
            return Err(BufferError::invalid_config(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Refill and caching policy of a [`LocalBufferPool`].
///
/// [`LocalBufferPool`]: crate::LocalBufferPool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBufferPoolConfig {
    /// Segments pulled from the manager's free list per refill.
    pub batch_size: usize,
    /// Recycled segments kept locally; the surplus returns to the manager.
    pub max_cached: usize,
}

impl Default for LocalBufferPoolConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_LOCAL_BATCH_SIZE,
            max_cached: DEFAULT_LOCAL_MAX_CACHED,
        }
    }
}

impl LocalBufferPoolConfig {
    pub fn validate(&self) -> BufferResult<()> {
        if self.batch_size == 0 {
            return Err(BufferError::invalid_config("batch_size must be > 0"));
        }
        if self.max_cached < self.batch_size {
            return Err(BufferError::invalid_config(format!(
                "max_cached {} must be >= batch_size {}",
                self.max_cached, self.batch_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BufferManagerConfig::default().validate().expect("manager");
        LocalBufferPoolConfig::default().validate().expect("local");
    }

    #[test]
    fn stride_rounds_up_to_alignment() {
        let cfg = BufferManagerConfig {
            buffer_size: 100,
            number_of_buffers: 3,
            alignment: 64,
        };
        assert_eq!(cfg.segment_stride(), 128);
        assert_eq!(cfg.region_bytes(), Some(384));
    }

    #[test]
    fn rejects_bad_manager_config() {
        let zero = BufferManagerConfig::new(0, 10);
        assert!(matches!(zero.validate(), Err(BufferError::InvalidConfig(_))));

        let empty = BufferManagerConfig::new(4096, 0);
        assert!(matches!(empty.validate(), Err(BufferError::InvalidConfig(_))));

        let mut odd = BufferManagerConfig::default();
        odd.alignment = 48;
        assert!(matches!(odd.validate(), Err(BufferError::InvalidConfig(_))));
    }

    #[test]
    fn overflowing_region_reports_none() {
        let cfg = BufferManagerConfig::new(usize::MAX / 2, 4);
        assert_eq!(cfg.region_bytes(), None);
    }

    #[test]
    fn local_config_requires_cache_to_hold_a_batch() {
        let cfg = LocalBufferPoolConfig {
            batch_size: 8,
            max_cached: 4,
        };
        assert!(matches!(cfg.validate(), Err(BufferError::InvalidConfig(_))));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: BufferManagerConfig =
            serde_json::from_str(r#"{"number_of_buffers": 10}"#).expect("parse");
        assert_eq!(cfg.number_of_buffers, 10);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.alignment, DEFAULT_ALIGNMENT);
    }
}
