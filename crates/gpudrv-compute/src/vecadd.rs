use std::time::Instant;

use tracing::{debug, info};

use crate::backend::{ComputeBackend, Profile};
use crate::error::{ComputeError, Result};

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Element-wise `a + b` over two little-endian `f32` arrays.
///
/// A job payload is `a` followed by `b`, both of the same length. The
/// result payload is `c` in the same encoding.
#[derive(Debug, Default)]
pub struct VecAddBackend {
    ready: bool,
    profile: Profile,
}

impl VecAddBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.ready
    }
}

impl ComputeBackend for VecAddBackend {
    fn name(&self) -> &'static str {
        "cpu-vecadd"
    }

    fn init(&mut self) -> Result<()> {
        if !self.ready {
            self.ready = true;
            info!(backend = self.name(), "compute backend initialized");
        }
        Ok(())
    }

    fn run_job(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.ready {
            return Err(ComputeError::NotInitialized(self.name()));
        }

        let started = Instant::now();
        let values = decode_f32s(payload)?;
        if values.is_empty() {
            return Err(ComputeError::EmptyJob);
        }
        if values.len() % 2 != 0 {
            return Err(ComputeError::OddElementCount(values.len()));
        }
        let (a, b) = values.split_at(values.len() / 2);
        let unpacked = started.elapsed();

        let kernel_start = Instant::now();
        let c: Vec<f32> = a.iter().zip(b).map(|(x, y)| x + y).collect();
        let kernel = kernel_start.elapsed();

        let pack_start = Instant::now();
        let out = encode_f32s(&c);
        let packed = pack_start.elapsed();

        self.profile = Profile {
            kernel_ms: kernel.as_secs_f64() * 1e3,
            transfer_ms: (unpacked + packed).as_secs_f64() * 1e3,
        };
        debug!(n = c.len(), kernel_ms = self.profile.kernel_ms, "vecadd job done");
        Ok(out)
    }

    fn cleanup(&mut self) {
        if self.ready {
            self.ready = false;
            info!(backend = self.name(), "compute backend released");
        }
    }

    fn last_profile(&self) -> Profile {
        self.profile
    }
}

/// Build a vector-add job payload from two operands.
///
/// Operands of different lengths are truncated to the shorter one.
pub fn encode_vecadd_job(a: &[f32], b: &[f32]) -> Vec<u8> {
    let n = a.len().min(b.len());
    let mut out = Vec::with_capacity(2 * n * F32_SIZE);
    for v in a[..n].iter().chain(&b[..n]) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Encode values as consecutive little-endian `f32`s.
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode consecutive little-endian `f32`s.
pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % F32_SIZE != 0 {
        return Err(ComputeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(F32_SIZE)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
