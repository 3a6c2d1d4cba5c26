//! RISC-V virtual hart engine
//!
//! Runs guest code on one native thread per hart. Each hart owns its
//! register file, CSR bank, a per-access-kind TLB and a block cache; harts
//! share guest RAM and the MMIO device list, and signal each other only
//! through atomics (pending interrupts, pause/preempt events).
//!
//! Devices, GUI backends and native code generation live outside this crate;
//! the only in-tree device is the CLINT, which the machine uses to deliver
//! timer and software interrupts across harts.

pub mod config;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod image;
pub mod machine;
pub mod memory;
pub mod snapshot;
pub mod timer;

pub use config::{HartCaps, MachineConfig, UnmappedPolicy};
pub use cpu::csr::CsrOp;
pub use cpu::mmu::{AccessType, SatpMode};
pub use cpu::trap::Trap;
pub use cpu::{Hart, HartShared, PrivilegeLevel};
pub use error::{ConfigError, MachineError};
pub use machine::Machine;
pub use memory::mmio::{MmioBus, MmioDevice, MmioHandler};
pub use memory::{AmoOp, GuestMemory};
pub use snapshot::MachineSnapshot;
pub use timer::MachineTimer;

/// Guest page size is fixed at 4 KiB for every addressing mode.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
