//! Single-channel job broker between producers and a compute daemon.
//!
//! Producers submit length-prefixed jobs into one shared channel; a consumer
//! takes them in FIFO order, runs them and publishes results back into the
//! same channel.
//!
//! # Crate Structure
//!
//! - [`frame`]: 8-byte little-endian length framing
//! - [`queue`]: bounded FIFO queues and the two-queue manager
//! - [`device`]: channel endpoint, mode register and the Unix socket service
//! - [`compute`]: job backends (behind `compute` feature)

/// Re-export frame types.
pub mod frame {
    pub use gpudrv_frame::*;
}

/// Re-export queue types.
pub mod queue {
    pub use gpudrv_queue::*;
}

/// Re-export device types.
pub mod device {
    pub use gpudrv_device::*;
}

/// Re-export compute backends (requires `compute` feature).
#[cfg(feature = "compute")]
pub mod compute {
    pub use gpudrv_compute::*;
}
