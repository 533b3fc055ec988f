use serde::Serialize;

use crate::error::Result;

/// Timing of the most recent job, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Profile {
    pub kernel_ms: f64,
    pub transfer_ms: f64,
}

/// Something that can execute job payloads.
///
/// Lifecycle is `init`, any number of `run_job` calls, then `cleanup`.
/// `cleanup` may be followed by another `init`.
pub trait ComputeBackend: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Acquire whatever the backend needs. Calling twice is harmless.
    fn init(&mut self) -> Result<()>;

    /// Run one job and return its result payload.
    fn run_job(&mut self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Release resources acquired by `init`.
    fn cleanup(&mut self);

    /// Timing of the last successful `run_job`.
    fn last_profile(&self) -> Profile;
}
