//! Device identifiers.

use std::fmt;

/// Identifies where a matrix lives or where work should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceId {
    /// Host compute. Never equal to any accelerator id.
    Cpu,
    /// Accelerator with the given enumeration index.
    Gpu(usize),
    /// Storage is managed externally; the runtime's ambient device applies.
    Managed,
}

/// The CPU sentinel returned whenever no accelerator can be used.
pub const CPU_DEVICE: DeviceId = DeviceId::Cpu;

impl DeviceId {
    /// Accelerator index, if this id names one.
    pub fn ordinal(self) -> Option<usize> {
        match self {
            Self::Gpu(index) => Some(index),
            Self::Cpu | Self::Managed => None,
        }
    }

    /// Whether this is the CPU sentinel.
    pub fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(index) => write!(f, "gpu:{index}"),
            Self::Managed => write!(f, "managed"),
        }
    }
}

impl From<usize> for DeviceId {
    fn from(index: usize) -> Self {
        Self::Gpu(index)
    }
}
