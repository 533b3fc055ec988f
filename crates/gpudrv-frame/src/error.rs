use crate::codec::HEADER_SIZE;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a full header were supplied.
    #[error("malformed frame: header needs {HEADER_SIZE} bytes, got {available}")]
    MalformedFrame { available: usize },

    /// The declared payload length is zero or above the cap.
    #[error("invalid payload length {length} (must be 1..={max})")]
    InvalidLength { length: u64, max: usize },

    /// The buffer ends before the payload the header declares.
    #[error("truncated frame: need {expected} bytes, buffer holds {actual}")]
    Truncated { expected: usize, actual: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
