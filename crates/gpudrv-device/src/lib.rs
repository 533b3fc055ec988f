//! The gpudrv broker device.
//!
//! A [`Channel`] binds the frame codec to a shared [`QueueManager`] and hands
//! out identity-free [`ChannelHandle`]s that producers and the consumer read
//! and write concurrently. [`DeviceServer`] exposes a channel on a Unix
//! domain socket so separate processes can open it; [`DeviceClient`] is the
//! matching connector.
//!
//! [`QueueManager`]: gpudrv_queue::QueueManager

pub mod endpoint;
pub mod error;
pub mod mode;
pub mod protocol;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;
#[cfg(unix)]
pub mod socket;

pub use endpoint::{Channel, ChannelConfig, ChannelHandle, ShortReadPolicy};
pub use error::{DeviceError, Result};
pub use mode::{Mode, ModeRegister};
pub use protocol::{ErrorCode, Opcode, Request, Response};

#[cfg(unix)]
pub use client::DeviceClient;
#[cfg(unix)]
pub use server::{DeviceServer, ServerConfig, ShutdownHandle};
#[cfg(unix)]
pub use socket::DeviceSocket;
