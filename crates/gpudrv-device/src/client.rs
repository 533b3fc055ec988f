use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use gpudrv_frame::{
    decode_header, encode_to_vec, validate, Frame, FrameError, FrameReader, FrameWriter,
    HEADER_SIZE,
};
use gpudrv_queue::QueueError;
use tracing::{debug, warn};

use crate::endpoint::frame_payload;
use crate::error::{DeviceError, Result};
use crate::mode::Mode;
use crate::protocol::{self, Request, Response};
use crate::socket::DeviceSocket;

/// Blocking connection to a [`DeviceServer`](crate::DeviceServer).
///
/// Mirrors [`ChannelHandle`](crate::ChannelHandle): remote failures come
/// back as the same error variants a local handle would return.
pub struct DeviceClient {
    reader: FrameReader<UnixStream>,
    writer: FrameWriter<UnixStream>,
    path: PathBuf,
    read_timeout: Option<Duration>,
    abandoned: bool,
}

impl DeviceClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = DeviceSocket::connect(&path)?;
        let config = protocol::frame_config();
        Ok(Self {
            reader: FrameReader::with_config(stream.try_clone()?, config.clone()),
            writer: FrameWriter::with_config(stream, config),
            path,
            read_timeout: None,
            abandoned: false,
        })
    }

    /// Bound how long any single response may take.
    ///
    /// A request that times out closes the connection, so the server drops
    /// the pending read instead of dequeuing an entry for it. Later calls
    /// fail with `ConnectionClosed`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)?;
        self.read_timeout = timeout;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Submit the device frame in `buf`. Returns `8 + length`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let payload = frame_payload(buf)?;
        let frame = Bytes::copy_from_slice(&buf[..HEADER_SIZE + payload.len()]);
        let sent = frame.len();
        self.expect_written(Request::Write(frame), sent)
    }

    /// Frame `payload` and submit it.
    pub fn submit(&mut self, payload: &[u8]) -> Result<usize> {
        self.write(&frame_bytes(payload)?)
    }

    /// Frame `payload` and publish it as a result.
    pub fn publish(&mut self, payload: &[u8]) -> Result<usize> {
        let frame = Bytes::from(frame_bytes(payload)?);
        let sent = frame.len();
        self.expect_written(Request::Publish(frame), sent)
    }

    /// Receive the next frame into `buf` as header + payload.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let frame = self.recv_wire(buf.len())?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    /// Receive the next frame whose wire size fits in `capacity` bytes.
    pub fn recv(&mut self, capacity: usize) -> Result<Frame> {
        let wire = self.recv_wire(capacity)?;
        Ok(Frame::new(wire.slice(HEADER_SIZE..)))
    }

    /// Receive the next submission, never a result.
    pub fn take_job(&mut self, capacity: usize) -> Result<Frame> {
        let request = Request::TakeJob {
            capacity: capacity as u64,
        };
        let wire = self.deliver(request, capacity)?;
        Ok(Frame::new(wire.slice(HEADER_SIZE..)))
    }

    /// Receive the next result, never a submission.
    ///
    /// `timeout` bounds the wait on the server; `None` waits until a result
    /// arrives or the server shuts down.
    pub fn take_result(&mut self, capacity: usize, timeout: Option<Duration>) -> Result<Frame> {
        let timeout_ms = timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1))
            .unwrap_or(0);
        let request = Request::TakeResult {
            capacity: capacity as u64,
            timeout_ms,
        };
        let wire = self.deliver(request, capacity)?;
        Ok(Frame::new(wire.slice(HEADER_SIZE..)))
    }

    pub fn get_mode(&mut self) -> Result<Mode> {
        match self.call(Request::GetMode, 0)? {
            Response::Mode(raw) => Mode::try_from(raw),
            other => Err(unexpected("GET_MODE", &other)),
        }
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.set_mode_raw(mode.as_u8())
    }

    /// Send an unchecked mode value; the server decides whether it is valid.
    pub fn set_mode_raw(&mut self, raw: u8) -> Result<()> {
        match self.call(Request::SetMode(raw), 0)? {
            Response::Ack => Ok(()),
            other => Err(unexpected("SET_MODE", &other)),
        }
    }

    /// A handle that can close this connection from another thread,
    /// unblocking a pending [`recv`](Self::recv).
    pub fn closer(&self) -> Result<Closer> {
        Ok(Closer {
            stream: self.writer.get_ref().try_clone()?,
        })
    }

    fn recv_wire(&mut self, capacity: usize) -> Result<Bytes> {
        let request = Request::Read {
            capacity: capacity as u64,
        };
        self.deliver(request, capacity)
    }

    fn deliver(&mut self, request: Request, capacity: usize) -> Result<Bytes> {
        let op = request.opcode();
        let wire = match self.call(request, capacity)? {
            Response::Frame(wire) => wire,
            other => return Err(unexpected(&format!("{op:?}"), &other)),
        };

        let length = validate(decode_header(&wire)?)?;
        if wire.len() != HEADER_SIZE + length || wire.len() > capacity {
            return Err(DeviceError::Protocol(format!(
                "server delivered {} bytes for a {length}-byte frame into {capacity}",
                wire.len()
            )));
        }
        Ok(wire)
    }

    fn expect_written(&mut self, request: Request, sent: usize) -> Result<usize> {
        let op = request.opcode();
        match self.call(request, sent)? {
            Response::Written(n) => Ok(n as usize),
            other => Err(unexpected(&format!("{op:?}"), &other)),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// `context` is the local size an error detail refers to.
    fn call(&mut self, request: Request, context: usize) -> Result<Response> {
        match self.raw_call(&request.encode())? {
            Response::Error { code, detail } => {
                debug!(?code, detail, "device request failed");
                Err(code.into_error(detail, context))
            }
            response => Ok(response),
        }
    }

    pub(crate) fn raw_call(&mut self, message: &[u8]) -> Result<Response> {
        if self.abandoned {
            return Err(FrameError::ConnectionClosed.into());
        }
        self.writer.send(message)?;
        match self.reader.read_frame() {
            Ok(frame) => Response::decode(frame.payload),
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                // The response may still arrive; hang up so the server
                // cancels the read rather than delivering into a dead socket.
                self.abandoned = true;
                let _ = self.writer.get_ref().shutdown(Shutdown::Both);
                warn!(path = ?self.path, "response timed out, connection closed");
                Err(QueueError::TimedOut(self.read_timeout.unwrap_or_default()).into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("path", &self.path)
            .finish()
    }
}

/// Closes a [`DeviceClient`] connection from another thread.
#[derive(Debug)]
pub struct Closer {
    stream: UnixStream,
}

impl Closer {
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn frame_bytes(payload: &[u8]) -> Result<Vec<u8>> {
    validate(payload.len() as u64)?;
    Ok(encode_to_vec(payload))
}

fn unexpected(op: &str, response: &Response) -> DeviceError {
    let tag = match response {
        Response::Written(_) => "WRITTEN",
        Response::Frame(_) => "FRAME",
        Response::Mode(_) => "MODE",
        Response::Ack => "ACK",
        Response::Error { .. } => "ERROR",
    };
    DeviceError::Protocol(format!("unexpected {tag} response to {op}"))
}
