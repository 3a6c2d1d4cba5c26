//! Host-side error types
//!
//! Guest-visible faults never show up here: they are [`crate::Trap`] values
//! delivered to the guest. These types cover setup and administration.

use std::fmt;

/// Rejected machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoHarts,
    TooManyHarts(usize),
    RamEmpty,
    RamMisaligned { base: u64, size: u64 },
    RamOutsideEnvelope { end: u64, phys_bits: u32 },
    TlbSize(usize),
    ModeUnsupported(&'static str),
    ZeroTimerFrequency,
    ClintOverlapsRam { base: u64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoHarts => write!(f, "machine needs at least one hart"),
            ConfigError::TooManyHarts(n) => write!(f, "too many harts: {}", n),
            ConfigError::RamEmpty => write!(f, "RAM size must be non-zero"),
            ConfigError::RamMisaligned { base, size } => {
                write!(f, "RAM region {:#x}+{:#x} is not page aligned", base, size)
            }
            ConfigError::RamOutsideEnvelope { end, phys_bits } => {
                write!(f, "RAM end {:#x} exceeds the {}-bit physical address space", end, phys_bits)
            }
            ConfigError::TlbSize(n) => write!(f, "TLB size {} must be a power of two >= 2", n),
            ConfigError::ModeUnsupported(what) => write!(f, "unsupported configuration: {}", what),
            ConfigError::ZeroTimerFrequency => write!(f, "timer frequency must be non-zero"),
            ConfigError::ClintOverlapsRam { base } => {
                write!(f, "CLINT at {:#x} overlaps RAM", base)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure of an administrative machine operation.
#[derive(Debug)]
pub enum MachineError {
    Config(ConfigError),
    OutOfMemory { bytes: u64 },
    HartsRunning,
    HartPanicked(usize),
    Thread(String),
    DeviceOverlap { name: String, base: u64, size: u64 },
    NoSuchDevice(String),
    ImageOutOfRange { addr: u64, len: u64 },
    Image(String),
    Snapshot(String),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::Config(e) => write!(f, "configuration error: {}", e),
            MachineError::OutOfMemory { bytes } => {
                write!(f, "failed to allocate {} bytes of guest memory", bytes)
            }
            MachineError::HartsRunning => write!(f, "operation requires all harts to be paused"),
            MachineError::HartPanicked(id) => write!(f, "hart {} thread panicked", id),
            MachineError::Thread(e) => write!(f, "failed to spawn hart thread: {}", e),
            MachineError::DeviceOverlap { name, base, size } => {
                write!(f, "device {} at {:#x}+{:#x} overlaps an existing mapping", name, base, size)
            }
            MachineError::NoSuchDevice(name) => write!(f, "no device named {}", name),
            MachineError::ImageOutOfRange { addr, len } => {
                write!(f, "image {:#x}+{:#x} does not fit in RAM", addr, len)
            }
            MachineError::Image(e) => write!(f, "image error: {}", e),
            MachineError::Snapshot(e) => write!(f, "snapshot error: {}", e),
        }
    }
}

impl std::error::Error for MachineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MachineError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for MachineError {
    fn from(e: ConfigError) -> Self {
        MachineError::Config(e)
    }
}
