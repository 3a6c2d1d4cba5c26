//! Virtual hart
//!
//! A [`Hart`] is owned and mutated by exactly one thread. Everything other
//! harts (or the host) may touch lives in its [`HartShared`] half, which
//! is made only of atomics plus the sleep/wake primitive.

pub mod access;
pub mod amo;
pub mod compressed;
pub mod csr;
pub mod decode;
pub mod dispatch;
pub mod execute;
pub mod jit;
pub mod mmu;
pub mod tlb;
pub mod trap;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::HartCaps;
use crate::memory::mmio::MmioBus;
use crate::memory::GuestMemory;
use crate::timer::MachineTimer;

use self::amo::Reservation;
use self::csr::CsrBank;
use self::jit::{BlockBuilder, BlockCache};
use self::mmu::SatpMode;
use self::tlb::Tlb;

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PrivilegeLevel {
    /// Decode an MPP/SPP field. The reserved value 2 maps to User; callers
    /// never store it (MPP is WARL).
    pub fn from_bits(val: u64) -> Self {
        match val & 3 {
            3 => PrivilegeLevel::Machine,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::User,
        }
    }
}

/// Cross-hart event flags
pub const EVENT_PAUSE: u32 = 1 << 0;
pub const EVENT_PREEMPT: u32 = 1 << 1;

/// The part of a hart other threads may touch.
pub struct HartShared {
    id: usize,
    /// Raised interrupt lines, in `mip` bit layout.
    pending: AtomicU64,
    events: AtomicU32,
    running: AtomicBool,
    mtimecmp: AtomicU64,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
}

impl HartShared {
    pub fn new(id: usize) -> Self {
        HartShared {
            id,
            pending: AtomicU64::new(0),
            events: AtomicU32::new(0),
            running: AtomicBool::new(false),
            mtimecmp: AtomicU64::new(u64::MAX),
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn raise_interrupt(&self, bits: u64) {
        let old = self.pending.fetch_or(bits, Ordering::AcqRel);
        if old & bits != bits {
            self.wake();
        }
    }

    pub fn clear_interrupt(&self, bits: u64) {
        self.pending.fetch_and(!bits, Ordering::AcqRel);
    }

    pub(crate) fn set_pending(&self, value: u64) {
        self.pending.store(value, Ordering::Release);
    }

    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp.load(Ordering::Acquire)
    }

    pub fn set_mtimecmp(&self, value: u64) {
        self.mtimecmp.store(value, Ordering::Release);
        self.wake();
    }

    /// Ask the hart thread to stop at its next check point.
    pub fn request_pause(&self) {
        self.running.store(false, Ordering::Release);
        self.events.fetch_or(EVENT_PAUSE, Ordering::AcqRel);
        self.wake();
    }

    /// Ask the hart to leave its inner loop once (e.g. to pick up new state).
    pub fn request_preempt(&self) {
        self.events.fetch_or(EVENT_PREEMPT, Ordering::AcqRel);
        self.wake();
    }

    #[inline]
    pub fn has_events(&self) -> bool {
        self.events.load(Ordering::Acquire) != 0
    }

    pub fn take_events(&self) -> u32 {
        self.events.swap(0, Ordering::AcqRel)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Wake the hart if it sleeps in WFI. Taking the lock orders this
    /// notification after the sleeper's last check of its wake condition.
    pub fn wake(&self) {
        let _guard = self.sleep_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sleep_cv.notify_all();
    }

    /// Block for at most `timeout` unless `idle` already reports false.
    pub(crate) fn sleep(&self, timeout: Duration, idle: impl Fn(&HartShared) -> bool) {
        let guard = self.sleep_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !idle(self) {
            return;
        }
        let _ = self.sleep_cv.wait_timeout(guard, timeout);
    }
}

/// Per-hart counters. Plain integers: only the owning thread writes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HartStats {
    pub retired: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub pt_reads: u64,
    pub traps: u64,
    pub interrupts: u64,
    pub blocks_compiled: u64,
    pub blocks_executed: u64,
}

/// Virtual CPU state
pub struct Hart {
    /// Program counter
    pub pc: u64,
    /// General purpose registers. On RV32 values are kept sign-extended.
    pub regs: [u64; 32],
    /// FP registers (raw bits), present when the FPU is configured
    pub fregs: Option<Box<[u64; 32]>>,
    /// Control and Status Registers
    pub csr: CsrBank,
    pub(crate) priv_level: PrivilegeLevel,
    pub(crate) mmu_mode: SatpMode,
    pub(crate) tlb: Tlb,
    pub(crate) shared: Arc<HartShared>,

    /// A trap was raised this cycle; `trap_pc` is where execution resumes.
    pub(crate) trap_pending: bool,
    pub(crate) trap_pc: u64,
    pub(crate) reservation: Option<Reservation>,
    pub(crate) wfi: bool,
    /// Re-evaluate interrupts before the next instruction.
    pub(crate) irq_check: bool,
    pub(crate) since_timer: u32,

    pub(crate) ram: Arc<GuestMemory>,
    pub(crate) mmio: Arc<MmioBus>,
    pub(crate) timer: Arc<MachineTimer>,
    pub(crate) caps: HartCaps,

    pub(crate) blocks: BlockCache,
    pub(crate) builder: Option<BlockBuilder>,
    pub(crate) code_epoch: u64,

    pub(crate) stats: HartStats,
}

impl Hart {
    pub fn new(
        shared: Arc<HartShared>,
        caps: HartCaps,
        ram: Arc<GuestMemory>,
        mmio: Arc<MmioBus>,
        timer: Arc<MachineTimer>,
        tlb_size: usize,
    ) -> Self {
        let code_epoch = ram.code_epoch();
        Hart {
            pc: ram.base(),
            regs: [0; 32],
            fregs: caps.fpu.then(|| Box::new([0u64; 32])),
            csr: CsrBank::default(),
            priv_level: PrivilegeLevel::Machine,
            mmu_mode: SatpMode::Bare,
            tlb: Tlb::new(tlb_size),
            shared,
            trap_pending: false,
            trap_pc: 0,
            reservation: None,
            wfi: false,
            irq_check: false,
            since_timer: 0,
            ram,
            mmio,
            timer,
            caps,
            blocks: BlockCache::new(),
            builder: None,
            code_epoch,
            stats: HartStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id()
    }

    pub fn shared(&self) -> &Arc<HartShared> {
        &self.shared
    }

    pub fn caps(&self) -> &HartCaps {
        &self.caps
    }

    pub fn stats(&self) -> HartStats {
        self.stats
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.priv_level
    }

    pub fn is_waiting(&self) -> bool {
        self.wfi
    }

    /// Change privilege. Cached translations carry permission results for
    /// the old level, so any change flushes the TLB.
    pub fn set_privilege(&mut self, level: PrivilegeLevel) {
        if level != self.priv_level {
            debug!("hart {}: {:?} -> {:?}", self.id(), self.priv_level, level);
            self.priv_level = level;
            self.tlb.flush();
        }
    }

    /// Flush one page (`Some(vaddr)`) or the whole TLB.
    pub fn flush_tlb(&mut self, vaddr: Option<u64>) {
        match vaddr {
            Some(va) => self.tlb.flush_page(self.xlen_addr(va) >> crate::PAGE_SHIFT),
            None => self.tlb.flush(),
        }
    }

    /// Swap in a new device list. Only called while the hart is paused.
    pub fn set_mmio(&mut self, mmio: Arc<MmioBus>) {
        self.mmio = mmio;
        self.tlb.flush();
    }

    /// Architectural reset: M-mode, registers cleared, execution at `pc`.
    pub fn reset(&mut self, pc: u64) {
        self.pc = self.xlen_addr(pc);
        self.regs = [0; 32];
        if let Some(f) = self.fregs.as_mut() {
            **f = [0; 32];
        }
        self.csr = CsrBank::default();
        self.priv_level = PrivilegeLevel::Machine;
        self.mmu_mode = SatpMode::Bare;
        self.tlb.flush();
        self.trap_pending = false;
        self.reservation = None;
        self.wfi = false;
        self.irq_check = false;
        self.blocks.invalidate_all();
        self.builder = None;
        self.shared.set_pending(0);
        self.shared.set_mtimecmp(u64::MAX);
    }

    /// Truncate an address to XLEN.
    #[inline(always)]
    pub fn xlen_addr(&self, addr: u64) -> u64 {
        if self.caps.rv64 {
            addr
        } else {
            addr & 0xFFFF_FFFF
        }
    }

    /// Normalize an ALU result to XLEN (sign-extended on RV32).
    #[inline(always)]
    pub fn xlen_value(&self, value: u64) -> u64 {
        if self.caps.rv64 {
            value
        } else {
            value as i32 as i64 as u64
        }
    }

    #[inline(always)]
    pub fn xlen_bits(&self) -> u32 {
        if self.caps.rv64 {
            64
        } else {
            32
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::MachineConfig;

    /// A standalone hart over fresh RAM, for unit tests.
    pub fn hart(config: &MachineConfig) -> Hart {
        let ram = Arc::new(GuestMemory::new(config.ram_base, config.ram_size).unwrap());
        let timer = Arc::new(MachineTimer::manual(config.timer_freq));
        let mut hart = Hart::new(
            Arc::new(HartShared::new(0)),
            HartCaps::from(config),
            ram,
            Arc::new(MmioBus::new()),
            timer,
            config.tlb_size,
        );
        hart.reset(config.reset_pc);
        hart
    }

    pub fn rv64() -> Hart {
        hart(&MachineConfig { ram_size: 1 << 20, ..Default::default() })
    }

    pub fn rv32() -> Hart {
        hart(&MachineConfig { ram_size: 1 << 20, ..MachineConfig::rv32() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hart_creation() {
        let hart = testutil::rv64();
        assert_eq!(hart.pc, 0x8000_0000);
        assert_eq!(hart.privilege(), PrivilegeLevel::Machine);
        assert!(hart.fregs.is_none());
    }

    #[test]
    fn test_xlen_helpers() {
        let hart = testutil::rv32();
        assert_eq!(hart.xlen_addr(0xFFFF_FFFF_8000_0000), 0x8000_0000);
        assert_eq!(hart.xlen_value(0x8000_0000), 0xFFFF_FFFF_8000_0000);
        assert_eq!(hart.xlen_bits(), 32);
    }

    #[test]
    fn test_shared_signals() {
        let shared = HartShared::new(3);
        shared.raise_interrupt(1 << 7);
        assert_eq!(shared.pending(), 1 << 7);
        shared.clear_interrupt(1 << 7);
        assert_eq!(shared.pending(), 0);
        shared.request_pause();
        assert!(shared.has_events());
        assert_eq!(shared.take_events(), EVENT_PAUSE);
        assert!(!shared.has_events());
    }

    #[test]
    fn test_sleep_returns_when_not_idle() {
        let shared = HartShared::new(0);
        shared.raise_interrupt(1 << 3);
        let start = std::time::Instant::now();
        shared.sleep(Duration::from_secs(5), |s| s.pending() == 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
