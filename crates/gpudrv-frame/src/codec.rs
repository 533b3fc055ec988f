use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: a single little-endian u64 payload length.
pub const HEADER_SIZE: usize = 8;

/// Hard cap on a single payload: 16 MiB.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest frame that can appear on the channel (header + max payload).
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

/// A single framed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The payload bytes. Never empty for a frame that passed validation.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload length as carried in the header.
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode header + payload into a fresh buffer.
    pub fn to_wire(&self) -> Vec<u8> {
        encode_to_vec(&self.payload)
    }
}

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────────┬──────────────────┐
/// │ Length (8B LE u64)   │ Payload          │
/// │                      │ (Length bytes)   │
/// └──────────────────────┴──────────────────┘
/// ```
///
/// The payload length is not checked here; callers validate first.
pub fn encode(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u64_le(payload.len() as u64);
    dst.put_slice(payload);
}

/// Encode a payload into a newly allocated `Vec`.
pub fn encode_to_vec(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read the declared payload length from the start of `src`.
pub fn decode_header(src: &[u8]) -> Result<u64> {
    let header: [u8; HEADER_SIZE] = src
        .get(..HEADER_SIZE)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(FrameError::MalformedFrame {
            available: src.len(),
        })?;
    Ok(u64::from_le_bytes(header))
}

/// Check a declared length against the 16 MiB cap.
///
/// Returns the length as `usize` on success.
pub fn validate(length: u64) -> Result<usize> {
    validate_with_limit(length, MAX_PAYLOAD)
}

/// Check a declared length against an explicit cap.
pub fn validate_with_limit(length: u64, max: usize) -> Result<usize> {
    match usize::try_from(length) {
        Ok(len) if len > 0 && len <= max => Ok(len),
        _ => Err(FrameError::InvalidLength { length, max }),
    }
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// An invalid length is reported as soon as the header is visible.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let payload_len = validate_with_limit(decode_header(src)?, max_payload)?;

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { payload }))
}

/// Configuration for frame readers and writers.
///
/// Socket timeouts belong to the stream owner, not the codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD,
        }
    }
}
