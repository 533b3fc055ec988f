//! Request/response messages exchanged over the device socket.
//!
//! Every message travels as one frame. A request payload is an opcode byte
//! followed by its body; a response payload is a tag byte followed by its
//! body. Integers in bodies are little-endian `u64`.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use gpudrv_frame::{FrameConfig, FrameError, MAX_FRAME_SIZE, MAX_PAYLOAD};
use gpudrv_queue::QueueError;

use crate::error::{DeviceError, Result};

/// Largest socket message: a tag or opcode byte plus one device frame.
pub const MAX_MESSAGE: usize = 1 + MAX_FRAME_SIZE;

/// Frame configuration for both ends of the device socket.
pub fn frame_config() -> FrameConfig {
    FrameConfig {
        max_payload_size: MAX_MESSAGE,
    }
}

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Write = 1,
    Publish = 2,
    Read = 3,
    GetMode = 4,
    SetMode = 5,
    TakeJob = 6,
    TakeResult = 7,
}

impl TryFrom<u8> for Opcode {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Write),
            2 => Ok(Opcode::Publish),
            3 => Ok(Opcode::Read),
            4 => Ok(Opcode::GetMode),
            5 => Ok(Opcode::SetMode),
            6 => Ok(Opcode::TakeJob),
            7 => Ok(Opcode::TakeResult),
            other => Err(DeviceError::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Submit a job. Body is a device frame.
    Write(Bytes),
    /// Publish a result. Body is a device frame.
    Publish(Bytes),
    /// Receive the next frame into a buffer of `capacity` bytes.
    Read { capacity: u64 },
    GetMode,
    /// Raw mode value; range checking happens on the server.
    SetMode(u8),
    /// Receive the next submission only.
    TakeJob { capacity: u64 },
    /// Receive the next result only. A `timeout_ms` of 0 waits indefinitely.
    TakeResult { capacity: u64, timeout_ms: u64 },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Write(_) => Opcode::Write,
            Request::Publish(_) => Opcode::Publish,
            Request::Read { .. } => Opcode::Read,
            Request::GetMode => Opcode::GetMode,
            Request::SetMode(_) => Opcode::SetMode,
            Request::TakeJob { .. } => Opcode::TakeJob,
            Request::TakeResult { .. } => Opcode::TakeResult,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.body_len());
        out.put_u8(self.opcode() as u8);
        match self {
            Request::Write(frame) | Request::Publish(frame) => out.put_slice(frame),
            Request::Read { capacity } | Request::TakeJob { capacity } => {
                out.put_u64_le(*capacity)
            }
            Request::TakeResult {
                capacity,
                timeout_ms,
            } => {
                out.put_u64_le(*capacity);
                out.put_u64_le(*timeout_ms);
            }
            Request::GetMode => {}
            Request::SetMode(raw) => out.put_u8(*raw),
        }
        out.freeze()
    }

    pub fn decode(message: Bytes) -> Result<Self> {
        let (&op, _) = message
            .split_first()
            .ok_or_else(|| DeviceError::Protocol("empty request".to_string()))?;
        let body = message.slice(1..);
        match Opcode::try_from(op)? {
            Opcode::Write => Ok(Request::Write(body)),
            Opcode::Publish => Ok(Request::Publish(body)),
            Opcode::Read => Ok(Request::Read {
                capacity: read_u64(&body, "READ")?,
            }),
            Opcode::GetMode => expect_empty(&body, "GET_MODE").map(|()| Request::GetMode),
            Opcode::SetMode => match body.as_ref() {
                [raw] => Ok(Request::SetMode(*raw)),
                _ => Err(DeviceError::Protocol(format!(
                    "SET_MODE body must be 1 byte, got {}",
                    body.len()
                ))),
            },
            Opcode::TakeJob => Ok(Request::TakeJob {
                capacity: read_u64(&body, "TAKE_JOB")?,
            }),
            Opcode::TakeResult => {
                if body.len() != 16 {
                    return Err(DeviceError::Protocol(format!(
                        "TAKE_RESULT body must be 16 bytes, got {}",
                        body.len()
                    )));
                }
                Ok(Request::TakeResult {
                    capacity: read_u64(&body[..8], "TAKE_RESULT")?,
                    timeout_ms: read_u64(&body[8..], "TAKE_RESULT")?,
                })
            }
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Request::Write(frame) | Request::Publish(frame) => frame.len(),
            Request::Read { .. } | Request::TakeJob { .. } => 8,
            Request::TakeResult { .. } => 16,
            Request::GetMode => 0,
            Request::SetMode(_) => 1,
        }
    }
}

const TAG_WRITTEN: u8 = 0;
const TAG_FRAME: u8 = 1;
const TAG_MODE: u8 = 2;
const TAG_ACK: u8 = 3;
const TAG_ERROR: u8 = 0x80;

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bytes accepted by a WRITE or PUBLISH.
    Written(u64),
    /// A delivered device frame (header + payload).
    Frame(Bytes),
    Mode(u8),
    Ack,
    Error { code: ErrorCode, detail: u64 },
}

impl Response {
    /// Build an error response describing `err`.
    pub fn from_error(err: &DeviceError) -> Self {
        let (code, detail) = ErrorCode::classify(err);
        Response::Error { code, detail }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Response::Written(n) => {
                out.put_u8(TAG_WRITTEN);
                out.put_u64_le(*n);
            }
            Response::Frame(frame) => {
                out.reserve(1 + frame.len());
                out.put_u8(TAG_FRAME);
                out.put_slice(frame);
            }
            Response::Mode(raw) => {
                out.put_u8(TAG_MODE);
                out.put_u8(*raw);
            }
            Response::Ack => out.put_u8(TAG_ACK),
            Response::Error { code, detail } => {
                out.put_u8(TAG_ERROR);
                out.put_u8(*code as u8);
                out.put_u64_le(*detail);
            }
        }
        out.freeze()
    }

    pub fn decode(message: Bytes) -> Result<Self> {
        let (&tag, _) = message
            .split_first()
            .ok_or_else(|| DeviceError::Protocol("empty response".to_string()))?;
        let body = message.slice(1..);
        match tag {
            TAG_WRITTEN => Ok(Response::Written(read_u64(&body, "WRITTEN")?)),
            TAG_FRAME => Ok(Response::Frame(body)),
            TAG_MODE => match body.as_ref() {
                [raw] => Ok(Response::Mode(*raw)),
                _ => Err(DeviceError::Protocol("MODE body must be 1 byte".to_string())),
            },
            TAG_ACK => expect_empty(&body, "ACK").map(|()| Response::Ack),
            TAG_ERROR => match body.as_ref() {
                [code, rest @ ..] if rest.len() == 8 => Ok(Response::Error {
                    code: ErrorCode::try_from(*code)?,
                    detail: read_u64(rest, "ERROR")?,
                }),
                _ => Err(DeviceError::Protocol("ERROR body must be 9 bytes".to_string())),
            },
            other => Err(DeviceError::Protocol(format!("unknown response tag {other:#04x}"))),
        }
    }
}

/// Error codes carried in an ERROR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidLength = 1,
    Truncated = 2,
    /// Detail: the buffer size the frame needs.
    OutputTooSmall = 3,
    Cancelled = 4,
    /// Detail: the timeout in milliseconds.
    TimedOut = 5,
    ShutDown = 6,
    InvalidMode = 7,
    Malformed = 8,
    Internal = 9,
}

impl TryFrom<u8> for ErrorCode {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => ErrorCode::InvalidLength,
            2 => ErrorCode::Truncated,
            3 => ErrorCode::OutputTooSmall,
            4 => ErrorCode::Cancelled,
            5 => ErrorCode::TimedOut,
            6 => ErrorCode::ShutDown,
            7 => ErrorCode::InvalidMode,
            8 => ErrorCode::Malformed,
            9 => ErrorCode::Internal,
            other => {
                return Err(DeviceError::Protocol(format!("unknown error code {other}")));
            }
        })
    }
}

impl ErrorCode {
    /// Map a local error to its wire code and detail value.
    pub fn classify(err: &DeviceError) -> (Self, u64) {
        match err {
            DeviceError::Frame(frame) | DeviceError::Queue(QueueError::Frame(frame)) => {
                classify_frame(frame)
            }
            DeviceError::Queue(queue) => match queue {
                QueueError::Cancelled => (ErrorCode::Cancelled, 0),
                QueueError::TimedOut(after) => (ErrorCode::TimedOut, millis(*after)),
                QueueError::Closed => (ErrorCode::ShutDown, 0),
                QueueError::CapacityExceeded { size, .. } => {
                    (ErrorCode::InvalidLength, *size as u64)
                }
                QueueError::EntryTooLarge { len, .. } => (
                    ErrorCode::OutputTooSmall,
                    (gpudrv_frame::HEADER_SIZE + len) as u64,
                ),
                QueueError::AllocationFailed { .. } | QueueError::Frame(_) => {
                    (ErrorCode::Internal, 0)
                }
            },
            DeviceError::OutputTooSmall { required, .. } => {
                (ErrorCode::OutputTooSmall, *required as u64)
            }
            DeviceError::InvalidMode(raw) => (ErrorCode::InvalidMode, u64::from(*raw)),
            DeviceError::Protocol(_) => (ErrorCode::Malformed, 0),
            _ => (ErrorCode::Internal, 0),
        }
    }

    /// Rebuild the local error for a remote code.
    ///
    /// `context` is the size the client knows locally: the bytes it sent for
    /// a write, or the buffer capacity for a read.
    pub fn into_error(self, detail: u64, context: usize) -> DeviceError {
        let detail_usize = usize::try_from(detail).unwrap_or(usize::MAX);
        match self {
            ErrorCode::InvalidLength => FrameError::InvalidLength {
                length: detail,
                max: MAX_PAYLOAD,
            }
            .into(),
            ErrorCode::Truncated => FrameError::Truncated {
                expected: detail_usize,
                actual: context,
            }
            .into(),
            ErrorCode::OutputTooSmall => DeviceError::OutputTooSmall {
                required: detail_usize,
                capacity: context,
            },
            ErrorCode::Cancelled => QueueError::Cancelled.into(),
            ErrorCode::TimedOut => QueueError::TimedOut(Duration::from_millis(detail)).into(),
            ErrorCode::ShutDown => QueueError::Closed.into(),
            ErrorCode::InvalidMode => {
                DeviceError::InvalidMode(u8::try_from(detail).unwrap_or(u8::MAX))
            }
            ErrorCode::Malformed => {
                DeviceError::Protocol("server rejected the request as malformed".to_string())
            }
            ErrorCode::Internal => DeviceError::Internal,
        }
    }
}

fn classify_frame(err: &FrameError) -> (ErrorCode, u64) {
    match err {
        FrameError::InvalidLength { length, .. } => (ErrorCode::InvalidLength, *length),
        FrameError::Truncated { expected, .. } => (ErrorCode::Truncated, *expected as u64),
        FrameError::MalformedFrame { available } => (ErrorCode::Malformed, *available as u64),
        FrameError::Io(_) | FrameError::ConnectionClosed => (ErrorCode::Internal, 0),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn read_u64(body: &[u8], what: &str) -> Result<u64> {
    let raw: [u8; 8] = body.try_into().map_err(|_| {
        DeviceError::Protocol(format!("{what} body must be 8 bytes, got {}", body.len()))
    })?;
    Ok(u64::from_le_bytes(raw))
}

fn expect_empty(body: &[u8], what: &str) -> Result<()> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::Protocol(format!(
            "{what} carries no body, got {} bytes",
            body.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use gpudrv_frame::encode_to_vec;

    use super::*;

    #[test]
    fn request_layout_is_opcode_then_body() {
        let read = Request::Read { capacity: 64 }.encode();
        assert_eq!(read[0], 3);
        assert_eq!(&read[1..], &64u64.to_le_bytes());

        let write = Request::Write(Bytes::from(encode_to_vec(b"job"))).encode();
        assert_eq!(write[0], 1);
        assert_eq!(&write[1..], encode_to_vec(b"job").as_slice());

        assert_eq!(Request::SetMode(3).encode().as_ref(), &[5, 3]);
        assert_eq!(Request::GetMode.encode().as_ref(), &[4]);
    }

    #[test]
    fn request_decode_parses_each_opcode() {
        let frame = Bytes::from(encode_to_vec(b"x"));
        for req in [
            Request::Write(frame.clone()),
            Request::Publish(frame),
            Request::Read { capacity: 4096 },
            Request::GetMode,
            Request::SetMode(9),
            Request::TakeJob { capacity: 64 },
            Request::TakeResult {
                capacity: 64,
                timeout_ms: 250,
            },
        ] {
            assert_eq!(Request::decode(req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn request_decode_rejects_garbage() {
        for raw in [&[][..], &[0], &[42], &[3, 1, 2], &[4, 0], &[5], &[7, 0, 0, 0, 0, 0, 0, 0, 0]] {
            let err = Request::decode(Bytes::copy_from_slice(raw)).unwrap_err();
            assert!(matches!(err, DeviceError::Protocol(_)), "{raw:?}");
        }
    }

    #[test]
    fn error_response_layout() {
        let resp = Response::Error {
            code: ErrorCode::OutputTooSmall,
            detail: 18,
        };
        let wire = resp.encode();
        assert_eq!(wire[0], 0x80);
        assert_eq!(wire[1], 3);
        assert_eq!(&wire[2..], &18u64.to_le_bytes());
        assert_eq!(Response::decode(wire).unwrap(), resp);
    }

    #[test]
    fn response_decode_rejects_unknown_tag() {
        let err = Response::decode(Bytes::from_static(&[0x7f])).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
        let err = Response::decode(Bytes::from_static(&[0x80, 77, 0, 0, 0, 0, 0, 0, 0, 0]))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn classify_maps_local_errors() {
        let cases: Vec<(DeviceError, ErrorCode, u64)> = vec![
            (
                FrameError::InvalidLength { length: 0, max: MAX_PAYLOAD }.into(),
                ErrorCode::InvalidLength,
                0,
            ),
            (
                FrameError::Truncated { expected: 13, actual: 12 }.into(),
                ErrorCode::Truncated,
                13,
            ),
            (
                DeviceError::OutputTooSmall { required: 18, capacity: 12 },
                ErrorCode::OutputTooSmall,
                18,
            ),
            (QueueError::Cancelled.into(), ErrorCode::Cancelled, 0),
            (
                QueueError::TimedOut(Duration::from_millis(250)).into(),
                ErrorCode::TimedOut,
                250,
            ),
            (QueueError::Closed.into(), ErrorCode::ShutDown, 0),
            (DeviceError::InvalidMode(7), ErrorCode::InvalidMode, 7),
            (DeviceError::Protocol("bad".into()), ErrorCode::Malformed, 0),
            (DeviceError::Internal, ErrorCode::Internal, 0),
        ];
        for (err, code, detail) in cases {
            assert_eq!(ErrorCode::classify(&err), (code, detail), "{err}");
        }
    }

    #[test]
    fn into_error_restores_variants() {
        assert!(ErrorCode::Cancelled.into_error(0, 0).is_cancelled());
        assert!(matches!(
            ErrorCode::OutputTooSmall.into_error(18, 12),
            DeviceError::OutputTooSmall { required: 18, capacity: 12 }
        ));
        assert!(matches!(
            ErrorCode::Truncated.into_error(13, 12),
            DeviceError::Frame(FrameError::Truncated { expected: 13, actual: 12 })
        ));
        assert!(matches!(
            ErrorCode::TimedOut.into_error(5, 0),
            DeviceError::Queue(QueueError::TimedOut(d)) if d == Duration::from_millis(5)
        ));
        assert!(matches!(
            ErrorCode::ShutDown.into_error(0, 0),
            DeviceError::Queue(QueueError::Closed)
        ));
        assert!(matches!(
            ErrorCode::InvalidMode.into_error(4, 0),
            DeviceError::InvalidMode(4)
        ));
    }

    #[test]
    fn frame_config_fits_largest_message() {
        assert_eq!(frame_config().max_payload_size, 1 + 8 + MAX_PAYLOAD);
    }
}
