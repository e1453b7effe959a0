use std::fmt::Display;

use bop_buffer::{BufferError, OriginId};

/// A specialized error type for windowing operations.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// A record arrived at or behind the store's watermark. The caller must
    /// route it to its late-data path.
    #[error("late record: timestamp {ts} is not after watermark {watermark}")]
    LateData { ts: u64, watermark: u64 },
    /// A watermark update named an origin the processor does not track.
    #[error("unknown origin {0}")]
    UnknownOrigin(OriginId),
    /// The timestamp is so close to `u64::MAX` that no slice end lies after it.
    #[error("timestamp {0} has no slice end after it")]
    TimestampOutOfRange(u64),
    /// A slice would overlap or break the end-timestamp order of its store.
    #[error("slice [{start}, {end}) overlaps an existing slice or breaks slice order")]
    SliceOrder { start: u64, end: u64 },
    /// The merge stage dropped its receiving end.
    #[error("slice merge channel closed")]
    MergeChannelClosed,
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Slice state could not be allocated.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl WindowError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }
}

/// A Result type alias for windowing operations.
pub type WindowResult<T> = Result<T, WindowError>;
