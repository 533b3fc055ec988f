use std::time::Duration;

use gpudrv_frame::FrameError;

/// Errors that can occur in queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Frame-level validation failed (e.g. invalid payload length).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The payload exceeds the per-entry cap.
    #[error("queue entry too large ({size} bytes, max {max})")]
    CapacityExceeded { size: usize, max: usize },

    /// The head entry does not fit the caller's limit and was left queued.
    #[error("head entry is {len} bytes, caller accepts at most {limit}")]
    EntryTooLarge { len: usize, limit: usize },

    /// Memory for the entry copy could not be reserved.
    #[error("failed to allocate {size} bytes for queue entry")]
    AllocationFailed { size: usize },

    /// A blocking pop was cancelled or the queue was closed while waiting.
    #[error("wait cancelled")]
    Cancelled,

    /// A blocking pop waited longer than the configured timeout.
    #[error("wait timed out after {0:?}")]
    TimedOut(Duration),

    /// The queue no longer accepts entries.
    #[error("queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;
