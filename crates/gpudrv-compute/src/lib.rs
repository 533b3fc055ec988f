//! Compute backends for the gpudrv consumer daemon.
//!
//! A backend takes one job payload and returns the result payload. The
//! broker never looks inside either.

pub mod backend;
pub mod error;
pub mod vecadd;

pub use backend::{ComputeBackend, Profile};
pub use error::{ComputeError, Result};
pub use vecadd::{decode_f32s, encode_f32s, encode_vecadd_job, VecAddBackend};
