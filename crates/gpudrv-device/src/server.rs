use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use gpudrv_frame::{Frame, FrameError, FrameReader, FrameWriter};
use gpudrv_queue::{CancelToken, ManagerConfig, QueueManager};
use tracing::{debug, info, warn};

use crate::endpoint::{Channel, ChannelConfig, ChannelHandle};
use crate::error::{DeviceError, Result};
use crate::mode::{Mode, ModeRegister};
use crate::protocol::{self, ErrorCode, Request, Response};
use crate::socket::{DeviceSocket, HangupWatch};

/// Settings applied when the server binds.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Permission bits for the socket file. Default: `0o600`.
    pub socket_mode: u32,
    pub channel: ChannelConfig,
    pub manager: ManagerConfig,
    pub initial_mode: Mode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_mode: DeviceSocket::DEFAULT_MODE,
            channel: ChannelConfig::default(),
            manager: ManagerConfig::default(),
            initial_mode: Mode::default(),
        }
    }
}

/// Serves one broker channel on a Unix domain socket.
///
/// Each accepted connection gets its own thread and its own
/// [`ChannelHandle`]. A connection carries one request at a time.
pub struct DeviceServer {
    socket: DeviceSocket,
    channel: Channel,
    modes: Arc<ModeRegister>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    stopping: AtomicBool,
    next_conn: AtomicU64,
    live: Mutex<Vec<(u64, UnixStream)>>,
}

impl Shared {
    fn live(&self) -> MutexGuard<'_, Vec<(u64, UnixStream)>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, id: u64) {
        self.live().retain(|(conn, _)| *conn != id);
    }
}

impl DeviceServer {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_config(path, ServerConfig::default())
    }

    pub fn bind_with_config(path: impl AsRef<Path>, config: ServerConfig) -> Result<Self> {
        let socket = DeviceSocket::bind_with_mode(path, config.socket_mode)?;
        let manager = Arc::new(QueueManager::with_config(config.manager));
        Ok(Self {
            socket,
            channel: Channel::with_config(manager, config.channel),
            modes: Arc::new(ModeRegister::new(config.initial_mode)),
            shared: Arc::new(Shared::default()),
        })
    }

    /// Serve an existing channel instead of the one created at bind.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Share a mode register with other parts of the process.
    pub fn with_modes(mut self, modes: Arc<ModeRegister>) -> Self {
        self.modes = modes;
        self
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn modes(&self) -> &Arc<ModeRegister> {
        &self.modes
    }

    /// A handle that stops [`serve`](Self::serve) from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            path: self.socket.path().to_path_buf(),
            manager: Arc::clone(self.channel.manager()),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept and serve connections until shut down.
    ///
    /// Returns after every connection thread has finished.
    pub fn serve(&self) -> Result<()> {
        info!(path = ?self.path(), "device server accepting connections");
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let stream = match self.socket.accept() {
                Ok(stream) => stream,
                Err(_) if self.shared.stopping.load(Ordering::SeqCst) => break,
                Err(DeviceError::Io(err)) if err.kind() == std::io::ErrorKind::Interrupted => {
                    continue
                }
                Err(err) => {
                    warn!(error = %err, "accept failed; stopping server");
                    self.shutdown_handle().shutdown();
                    join_all(workers);
                    return Err(err);
                }
            };

            let id = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
            {
                let mut live = self.shared.live();
                if self.shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                live.push((id, stream.try_clone()?));
            }

            let handle = self.channel.open();
            let modes = Arc::clone(&self.modes);
            let shared = Arc::clone(&self.shared);
            let worker = thread::Builder::new()
                .name(format!("gpudrv-conn-{id}"))
                .spawn(move || {
                    match serve_connection(stream, &handle, &modes) {
                        Ok(()) => debug!(conn = id, "connection closed"),
                        Err(err) => debug!(conn = id, error = %err, "connection ended"),
                    }
                    shared.forget(id);
                })?;
            workers.push(worker);
            workers.retain(|w| !w.is_finished());
        }

        join_all(workers);
        info!(path = ?self.path(), "device server stopped");
        Ok(())
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            warn!("connection thread panicked");
        }
    }
}

/// Stops a running [`DeviceServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    path: PathBuf,
    manager: Arc<QueueManager>,
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Stop accepting, cancel every blocked read and close live connections.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let report = self.manager.shutdown();
        let live: Vec<_> = self.shared.live().drain(..).collect();
        info!(
            connections = live.len(),
            submissions_dropped = report.submissions_dropped,
            results_dropped = report.results_dropped,
            "device server shutting down"
        );
        for (_, stream) in live {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Wake the accept loop.
        let _ = UnixStream::connect(&self.path);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("path", &self.path)
            .field("stopping", &self.is_shutdown())
            .finish()
    }
}

fn serve_connection(stream: UnixStream, handle: &ChannelHandle, modes: &ModeRegister) -> Result<()> {
    let config = protocol::frame_config();
    let mut reader = FrameReader::with_config(stream.try_clone()?, config.clone());
    let mut writer = FrameWriter::with_config(stream.try_clone()?, config);
    let watch = HangupWatch::spawn(&stream)?;

    loop {
        let message = match reader.read_frame() {
            Ok(frame) => frame.payload,
            Err(FrameError::ConnectionClosed) => return Ok(()),
            Err(err @ (FrameError::InvalidLength { .. } | FrameError::MalformedFrame { .. })) => {
                // The byte stream can no longer be trusted; report and hang up.
                warn!(error = %err, "unframeable request, closing connection");
                let reply = Response::Error {
                    code: ErrorCode::Malformed,
                    detail: 0,
                };
                writer.send(&reply.encode())?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let response = match Request::decode(message) {
            Ok(request) => dispatch(request, handle, modes, &watch),
            Err(err) => Response::from_error(&err),
        };
        if let Response::Error { code, detail } = &response {
            debug!(?code, detail, "request failed");
        }
        writer.send(&response.encode())?;
    }
}

fn dispatch(
    request: Request,
    handle: &ChannelHandle,
    modes: &ModeRegister,
    watch: &HangupWatch,
) -> Response {
    let outcome = match request {
        Request::Write(frame) => handle.write(&frame).map(|n| Response::Written(n as u64)),
        Request::Publish(frame) => handle.publish(&frame).map(|n| Response::Written(n as u64)),
        Request::Read { capacity } => deliver(watch, |cancel| {
            handle.recv_frame(clamp(capacity), cancel)
        }),
        Request::TakeJob { capacity } => deliver(watch, |cancel| {
            handle.take_job(clamp(capacity), cancel)
        }),
        Request::TakeResult {
            capacity,
            timeout_ms,
        } => deliver(watch, |cancel| {
            let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
            handle.take_result(clamp(capacity), timeout, cancel)
        }),
        Request::GetMode => Ok(Response::Mode(modes.get_mode().as_u8())),
        Request::SetMode(raw) => modes.set_raw(raw).map(|_| Response::Ack),
    };
    outcome.unwrap_or_else(|err| Response::from_error(&err))
}

/// Run a blocking receive while watching for the peer to hang up.
fn deliver(
    watch: &HangupWatch,
    receive: impl FnOnce(&CancelToken) -> Result<Frame>,
) -> Result<Response> {
    let cancel = CancelToken::new();
    // Nothing may be dequeued for a reader that already left.
    let _armed = watch.arm(cancel.clone());
    let frame = receive(&cancel)?;
    Ok(Response::Frame(Bytes::from(frame.to_wire())))
}

fn clamp(capacity: u64) -> usize {
    usize::try_from(capacity).unwrap_or(usize::MAX)
}
