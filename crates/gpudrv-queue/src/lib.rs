//! Job queues for the gpudrv broker.
//!
//! A [`QueueManager`] owns two [`BoundedQueue`]s: *submissions* pushed by
//! producers and *results* pushed by the consumer. Receiving prefers a
//! pending result and otherwise blocks for the next submission until a
//! [`CancelToken`] fires or the manager shuts down.

pub mod cancel;
pub mod error;
pub mod manager;
pub mod queue;

pub use cancel::CancelToken;
pub use error::{QueueError, Result};
pub use manager::{ManagerConfig, ManagerState, PendingCounts, QueueManager, ShutdownReport};
pub use queue::BoundedQueue;
