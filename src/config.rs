//! Machine configuration
//!
//! One immutable object built before the machine exists. Harts never consult
//! it directly; they get a copy of [`HartCaps`] at construction.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::PAGE_MASK;

pub const MAX_HARTS: usize = 256;

/// Default CLINT placement (matches the QEMU virt machine).
pub const CLINT_BASE: u64 = 0x0200_0000;

/// What happens to an access that lands inside the physical address space
/// but hits neither RAM nor a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnmappedPolicy {
    /// Raise an access fault.
    #[default]
    Fault,
    /// Read zero, silently drop writes (what some real boards do).
    ZeroDiscard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub harts: usize,
    pub rv64: bool,
    pub fpu: bool,
    pub ram_base: u64,
    pub ram_size: u64,
    /// Allow Sv48 in satp (RV64 only).
    pub sv48: bool,
    /// Allow Sv57 in satp (RV64 only, needs `sv48`).
    pub sv57: bool,
    pub jit: bool,
    pub tlb_size: usize,
    pub timer_freq: u64,
    /// Time only moves when written or advanced explicitly.
    pub manual_timer: bool,
    pub unmapped_policy: UnmappedPolicy,
    pub reset_pc: u64,
    pub clint_base: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            harts: 1,
            rv64: true,
            fpu: false,
            ram_base: 0x8000_0000,
            ram_size: 64 << 20,
            sv48: true,
            sv57: false,
            jit: false,
            tlb_size: 256,
            timer_freq: 10_000_000,
            manual_timer: false,
            unmapped_policy: UnmappedPolicy::Fault,
            reset_pc: 0x8000_0000,
            clint_base: Some(CLINT_BASE),
        }
    }
}

impl MachineConfig {
    /// Width of the physical address space: 34 bits for Sv32, 56 otherwise.
    pub fn phys_bits(&self) -> u32 {
        if self.rv64 {
            56
        } else {
            34
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harts == 0 {
            return Err(ConfigError::NoHarts);
        }
        if self.harts > MAX_HARTS {
            return Err(ConfigError::TooManyHarts(self.harts));
        }
        if self.ram_size == 0 {
            return Err(ConfigError::RamEmpty);
        }
        if (self.ram_base | self.ram_size) & PAGE_MASK != 0 {
            return Err(ConfigError::RamMisaligned { base: self.ram_base, size: self.ram_size });
        }
        let end = self
            .ram_base
            .checked_add(self.ram_size)
            .ok_or(ConfigError::RamOutsideEnvelope { end: u64::MAX, phys_bits: self.phys_bits() })?;
        if end > (1u64 << self.phys_bits()) {
            return Err(ConfigError::RamOutsideEnvelope { end, phys_bits: self.phys_bits() });
        }
        if self.tlb_size < 2 || !self.tlb_size.is_power_of_two() {
            return Err(ConfigError::TlbSize(self.tlb_size));
        }
        if !self.rv64 && (self.sv48 || self.sv57) {
            return Err(ConfigError::ModeUnsupported("Sv48/Sv57 on a 32-bit hart"));
        }
        if self.sv57 && !self.sv48 {
            return Err(ConfigError::ModeUnsupported("Sv57 without Sv48"));
        }
        if self.timer_freq == 0 {
            return Err(ConfigError::ZeroTimerFrequency);
        }
        if let Some(base) = self.clint_base {
            let clint_end = base.saturating_add(crate::devices::clint::CLINT_SIZE);
            if base < end && self.ram_base < clint_end {
                return Err(ConfigError::ClintOverlapsRam { base });
            }
        }
        Ok(())
    }

    /// Convenience for a 32-bit machine with everything else defaulted.
    pub fn rv32() -> Self {
        MachineConfig { rv64: false, sv48: false, sv57: false, ..Default::default() }
    }
}

/// Read-only capability flags a hart is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HartCaps {
    pub rv64: bool,
    pub fpu: bool,
    pub sv48: bool,
    pub sv57: bool,
    pub jit: bool,
    pub unmapped_policy: UnmappedPolicy,
    pub phys_bits: u32,
}

impl From<&MachineConfig> for HartCaps {
    fn from(config: &MachineConfig) -> Self {
        HartCaps {
            rv64: config.rv64,
            fpu: config.fpu,
            sv48: config.sv48,
            sv57: config.sv57,
            jit: config.jit,
            unmapped_policy: config.unmapped_policy,
            phys_bits: config.phys_bits(),
        }
    }
}
