use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpudrv_queue::CancelToken;
use tracing::{debug, info};

use crate::error::{DeviceError, Result};

/// Filesystem socket that stands in for the broker's device node.
///
/// The socket file is removed on drop unless something else has replaced it.
pub struct DeviceSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: (u64, u64),
}

impl DeviceSocket {
    /// Permissions applied to a freshly bound socket.
    pub const DEFAULT_MODE: u32 = 0o600;

    // `sockaddr_un.sun_path` capacity, including the trailing NUL.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_MODE)
    }

    /// Bind at `path` and set its permission bits to `mode`.
    ///
    /// A leftover socket at `path` is replaced. Any other kind of file is
    /// left alone and the bind fails.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(DeviceError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: io::Error| DeviceError::Bind {
            path: path.clone(),
            source,
        };

        match fs::symlink_metadata(&path) {
            Ok(existing) if existing.file_type().is_socket() => {
                debug!(?path, "removing stale device socket");
                fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a unix socket",
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, mode = %format!("{mode:o}"), "device socket bound");
        Ok(Self {
            listener,
            identity: (created.dev(), created.ino()),
            path,
        })
    }

    /// Block until a client connects.
    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept()?;
        debug!(peer_pid = ?peer_pid(&stream), "device connection accepted");
        Ok(stream)
    }

    pub fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| DeviceError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "connected to device socket");
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceSocket {
    fn drop(&mut self) {
        let Ok(current) = fs::symlink_metadata(&self.path) else {
            return;
        };
        if current.file_type().is_socket() && (current.dev(), current.ino()) == self.identity {
            debug!(path = ?self.path, "removing device socket");
            let _ = fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "device socket was replaced; leaving it");
        }
    }
}

impl std::fmt::Debug for DeviceSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSocket")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: `cred` and `len` point to writable memory of the advertised size
    // and the descriptor stays open for the borrow of `stream`.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
            &mut len,
        )
    };
    (rc == 0).then_some(cred.pid as u32)
}

#[cfg(not(target_os = "linux"))]
fn peer_pid(_stream: &UnixStream) -> Option<u32> {
    None
}

const HANGUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Nothing to read yet.
    Idle,
    /// The peer closed its end.
    HungUp,
    /// The peer sent more bytes while its request is outstanding.
    Pending,
}

/// Watches one connection for the peer hanging up while a read blocks.
///
/// One thread per connection. It sleeps on a condvar until a blocked read
/// [`arm`](Self::arm)s it, then polls the socket until the read ends. An
/// armed token is cancelled if the peer closes its end. Data sent while a
/// request is outstanding disarms the watch, since those bytes belong to
/// the connection reader.
pub(crate) struct HangupWatch {
    shared: Arc<WatchShared>,
    thread: Option<JoinHandle<()>>,
}

struct WatchShared {
    slot: Mutex<WatchSlot>,
    changed: Condvar,
}

#[derive(Default)]
struct WatchSlot {
    armed: Option<(u64, CancelToken)>,
    next_generation: u64,
    closed: bool,
}

impl WatchShared {
    fn slot(&self) -> MutexGuard<'_, WatchSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disarm(&self, generation: u64) {
        let mut slot = self.slot();
        if matches!(slot.armed, Some((current, _)) if current == generation) {
            slot.armed = None;
        }
    }
}

impl HangupWatch {
    pub(crate) fn spawn(stream: &UnixStream) -> io::Result<Self> {
        let stream = stream.try_clone()?;
        let shared = Arc::new(WatchShared {
            slot: Mutex::new(WatchSlot::default()),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name("gpudrv-hangup".to_string())
            .spawn(move || watch_loop(&stream, &worker))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Watch for a hang-up until the returned guard is dropped.
    pub(crate) fn arm(&self, cancel: CancelToken) -> Armed<'_> {
        let mut slot = self.shared.slot();
        let generation = slot.next_generation;
        slot.next_generation += 1;
        slot.armed = Some((generation, cancel));
        drop(slot);
        self.shared.changed.notify_all();
        Armed {
            shared: &self.shared,
            generation,
        }
    }
}

impl Drop for HangupWatch {
    fn drop(&mut self) {
        self.shared.slot().closed = true;
        self.shared.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Disarms its [`HangupWatch`] on drop.
pub(crate) struct Armed<'a> {
    shared: &'a WatchShared,
    generation: u64,
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        self.shared.disarm(self.generation);
    }
}

fn watch_loop(stream: &UnixStream, shared: &WatchShared) {
    loop {
        let (generation, cancel) = {
            let mut slot = shared.slot();
            loop {
                if slot.closed {
                    return;
                }
                if let Some(armed) = &slot.armed {
                    break armed.clone();
                }
                slot = shared
                    .changed
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match peer_state(stream, HANGUP_POLL) {
            PeerState::Idle => {}
            PeerState::HungUp => {
                let slot = shared.slot();
                if matches!(slot.armed, Some((current, _)) if current == generation) {
                    drop(slot);
                    debug!("peer hung up during blocked read");
                    cancel.cancel();
                    return;
                }
            }
            PeerState::Pending => shared.disarm(generation),
        }
    }
}

fn peer_state(stream: &UnixStream, timeout: Duration) -> PeerState {
    let fd = stream.as_raw_fd();
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pfd` is one valid pollfd and `fd` is open while `stream` lives.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc == 0 {
        return PeerState::Idle;
    }
    if rc < 0 {
        return transient_or_hangup(io::Error::last_os_error());
    }
    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return PeerState::HungUp;
    }

    let mut byte = 0u8;
    // SAFETY: the buffer is one writable byte; MSG_PEEK leaves it queued.
    let n = unsafe {
        libc::recv(
            fd,
            (&mut byte as *mut u8).cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match n {
        0 => PeerState::HungUp,
        n if n > 0 => PeerState::Pending,
        _ => transient_or_hangup(io::Error::last_os_error()),
    }
}

fn transient_or_hangup(err: io::Error) -> PeerState {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => PeerState::Idle,
        _ => PeerState::HungUp,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Instant;

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gpudrv-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect_and_cleanup() {
        let dir = scratch_dir("sock-basic");
        let path = dir.join("dev.sock");

        let socket = DeviceSocket::bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let client_path = path.clone();
        let client = thread::spawn(move || {
            let mut stream = DeviceSocket::connect(&client_path).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        let mut conn = socket.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();

        drop(socket);
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = scratch_dir("sock-stale");
        let path = dir.join("dev.sock");

        let first = DeviceSocket::bind(&path).unwrap();
        // Leak the first listener's file by forgetting its cleanup.
        std::mem::forget(first);

        let second = DeviceSocket::bind(&path).unwrap();
        assert!(DeviceSocket::connect(&path).is_ok());
        drop(second);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = scratch_dir("sock-file");
        let path = dir.join("dev.sock");
        fs::write(&path, b"not a socket").unwrap();

        let err = DeviceSocket::bind(&path).unwrap_err();
        assert!(matches!(err, DeviceError::Bind { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"not a socket");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_long_path() {
        let path = format!("/tmp/{}.sock", "d".repeat(200));
        assert!(matches!(
            DeviceSocket::bind(&path),
            Err(DeviceError::PathTooLong { .. })
        ));
    }

    #[test]
    fn drop_keeps_replaced_path() {
        let dir = scratch_dir("sock-replaced");
        let path = dir.join("dev.sock");

        let socket = DeviceSocket::bind(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::write(&path, b"replacement").unwrap();

        drop(socket);
        assert!(path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = scratch_dir("sock-missing");
        let err = DeviceSocket::connect(dir.join("absent.sock")).unwrap_err();
        assert!(matches!(err, DeviceError::Connect { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn hangup_watch_cancels_on_peer_close() {
        let (server, client) = UnixStream::pair().unwrap();
        let cancel = CancelToken::new();
        let watch = HangupWatch::spawn(&server).unwrap();
        let _armed = watch.arm(cancel.clone());

        thread::sleep(Duration::from_millis(20));
        assert!(!cancel.is_cancelled());
        drop(client);

        let start = Instant::now();
        while !cancel.is_cancelled() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn hangup_watch_ignores_pending_data() {
        let (mut server, mut client) = UnixStream::pair().unwrap();
        let cancel = CancelToken::new();
        let watch = HangupWatch::spawn(&server).unwrap();
        let armed = watch.arm(cancel.clone());

        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(armed);
        drop(watch);

        // The peeked byte is still there for the connection reader.
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn disarmed_watch_leaves_token_alone() {
        let (server, client) = UnixStream::pair().unwrap();
        let watch = HangupWatch::spawn(&server).unwrap();

        let first = CancelToken::new();
        drop(watch.arm(first.clone()));
        drop(client);
        thread::sleep(Duration::from_millis(150));
        assert!(!first.is_cancelled());

        // A later read on the same connection still sees the hang-up.
        let second = CancelToken::new();
        let _armed = watch.arm(second.clone());
        let start = Instant::now();
        while !second.is_cancelled() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(second.is_cancelled());
    }

    #[test]
    fn idle_watch_is_dropped_promptly() {
        let (server, _client) = UnixStream::pair().unwrap();
        let watch = HangupWatch::spawn(&server).unwrap();

        let start = Instant::now();
        drop(watch);
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn peer_state_reports_idle_then_hangup() {
        let (server, client) = UnixStream::pair().unwrap();
        assert_eq!(
            peer_state(&server, Duration::from_millis(1)),
            PeerState::Idle
        );
        drop(client);
        assert_eq!(
            peer_state(&server, Duration::from_millis(50)),
            PeerState::HungUp
        );
    }
}
