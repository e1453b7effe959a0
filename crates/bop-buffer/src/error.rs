use std::fmt::Display;

/// A specialized error type for buffer pool operations.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The pool region (or an unpooled buffer) could not be allocated.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },
    /// No segment became available before the caller's deadline.
    #[error("buffer pool exhausted")]
    PoolExhausted,
    /// The manager has entered its terminal shutdown state.
    #[error("buffer manager shutdown in progress")]
    ShutdownInProgress,
    /// Buffers were still referenced when the manager shut down.
    #[error("buffer leak: {pooled} pooled and {unpooled} unpooled buffers outstanding")]
    BufferLeak { pooled: usize, unpooled: usize },
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BufferError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Returns true when retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}

/// A Result type alias for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;
