use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DeviceError;

/// Compute mode advertised to producers and the consumer.
///
/// Mode is a plain register: it never touches the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Mode {
    Cpu = 1,
    #[default]
    Gpu = 2,
    Hybrid = 3,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Cpu, Mode::Gpu, Mode::Hybrid];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Cpu => "cpu",
            Mode::Gpu => "gpu",
            Mode::Hybrid => "hybrid",
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Mode::Cpu),
            2 => Ok(Mode::Gpu),
            3 => Ok(Mode::Hybrid),
            other => Err(DeviceError::InvalidMode(other)),
        }
    }
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> Self {
        mode.as_u8()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(raw) = s.parse::<u8>() {
            return Mode::try_from(raw).map_err(|err| err.to_string());
        }
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Mode::Cpu),
            "gpu" => Ok(Mode::Gpu),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(format!(
                "unknown mode '{other}' (expected cpu, gpu or hybrid)"
            )),
        }
    }
}

/// Shared mode register.
#[derive(Debug)]
pub struct ModeRegister {
    current: AtomicU8,
}

impl ModeRegister {
    pub fn new(initial: Mode) -> Self {
        Self {
            current: AtomicU8::new(initial.as_u8()),
        }
    }

    pub fn get_mode(&self) -> Mode {
        // Only valid discriminants are ever stored.
        Mode::try_from(self.current.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Set the mode from a raw control value.
    ///
    /// Out-of-range values fail with `InvalidMode` and leave the mode unchanged.
    pub fn set_raw(&self, value: u8) -> crate::Result<Mode> {
        let mode = Mode::try_from(value)?;
        self.set_mode(mode);
        Ok(mode)
    }

    pub fn set_mode(&self, mode: Mode) {
        let previous = self.current.swap(mode.as_u8(), Ordering::AcqRel);
        if previous != mode.as_u8() {
            info!(mode = %mode, "compute mode changed");
        }
    }
}

impl Default for ModeRegister {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}
