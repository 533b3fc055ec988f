/// Errors that can occur while running a compute job.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// `run_job` was called before `init` or after `cleanup`.
    #[error("backend {0} is not initialized")]
    NotInitialized(&'static str),

    /// The job payload is empty.
    #[error("job payload is empty")]
    EmptyJob,

    /// The payload length is not a whole number of `f32` values.
    #[error("job payload is {0} bytes, not a multiple of 4")]
    Misaligned(usize),

    /// The payload cannot be split into two equal-length operands.
    #[error("job carries {0} values, expected an even count")]
    OddElementCount(usize),
}

pub type Result<T> = std::result::Result<T, ComputeError>;
