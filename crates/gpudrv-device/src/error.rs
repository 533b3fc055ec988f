use std::path::PathBuf;

use gpudrv_frame::FrameError;
use gpudrv_queue::QueueError;

/// Errors that can occur in device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Frame-level error (invalid length, truncation, malformed header).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Queue-level error (cancelled, timed out, shut down).
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The read buffer cannot hold the frame about to be delivered.
    #[error("output buffer too small ({capacity} bytes, frame needs {required})")]
    OutputTooSmall { required: usize, capacity: usize },

    /// A control request named a mode that does not exist.
    #[error("invalid mode value {0}")]
    InvalidMode(u8),

    /// Failed to bind the device socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the device socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// An I/O error occurred on the device socket.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something that is not a valid request or response.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server failed a request for a reason it could not classify.
    #[error("device internal error")]
    Internal,
}

impl DeviceError {
    /// Whether the error means a blocking read was interrupted rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeviceError::Queue(QueueError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
