use std::fmt;
use std::io;

use gpudrv_compute::ComputeError;
use gpudrv_device::DeviceError;
use gpudrv_frame::FrameError;
use gpudrv_queue::QueueError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
pub const CANCELLED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        io::ErrorKind::AddrInUse => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn queue_error(context: &str, err: QueueError) -> CliError {
    let code = match &err {
        QueueError::Frame(_) | QueueError::EntryTooLarge { .. } => DATA_INVALID,
        QueueError::CapacityExceeded { .. } => DATA_INVALID,
        QueueError::TimedOut(_) => TIMEOUT,
        QueueError::Cancelled | QueueError::Closed => CANCELLED,
        QueueError::AllocationFailed { .. } => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn device_error(context: &str, err: DeviceError) -> CliError {
    match err {
        DeviceError::Frame(err) => frame_error(context, err),
        DeviceError::Queue(err) => queue_error(context, err),
        DeviceError::Bind { source, .. }
        | DeviceError::Connect { source, .. }
        | DeviceError::Io(source) => io_error(context, source),
        DeviceError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        DeviceError::OutputTooSmall { .. } | DeviceError::InvalidMode(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        DeviceError::Protocol(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        DeviceError::Internal => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

pub fn compute_error(context: &str, err: ComputeError) -> CliError {
    let code = match err {
        ComputeError::NotInitialized(_) => INTERNAL,
        _ => DATA_INVALID,
    };
    CliError::new(code, format!("{context}: {err}"))
}
