//! Length-prefixed frames for the gpudrv job broker.
//!
//! Every unit exchanged over the broker channel is framed as:
//! - An 8-byte little-endian payload length
//! - The payload itself (1 ..= 16 MiB)
//!
//! [`FrameReader`] and [`FrameWriter`] hide partial reads and writes so
//! callers always deal in whole frames.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_header, encode, encode_to_vec, validate, validate_with_limit, Frame,
    FrameConfig, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
