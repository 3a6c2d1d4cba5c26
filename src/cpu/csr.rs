//! Control and Status Registers
//!
//! All accesses go through [`Hart::csr_op`], which applies the address-encoded
//! access rules, the per-register gates (counter enables, TVM, FS, STCE) and
//! then each register's WARL write policy.

use log::debug;
use serde::{Deserialize, Serialize};

use super::mmu::SatpMode;
use super::{Hart, PrivilegeLevel};

// Unprivileged CSRs
pub const CSR_FFLAGS: u32 = 0x001;
pub const CSR_FRM: u32 = 0x002;
pub const CSR_FCSR: u32 = 0x003;
pub const CSR_SEED: u32 = 0x015;
pub const CSR_CYCLE: u32 = 0xC00;
pub const CSR_TIME: u32 = 0xC01;
pub const CSR_INSTRET: u32 = 0xC02;
pub const CSR_HPMCOUNTER31: u32 = 0xC1F;
pub const CSR_CYCLEH: u32 = 0xC80;
pub const CSR_TIMEH: u32 = 0xC81;
pub const CSR_INSTRETH: u32 = 0xC82;
pub const CSR_HPMCOUNTER31H: u32 = 0xC9F;

// Supervisor CSRs
pub const CSR_SSTATUS: u32 = 0x100;
pub const CSR_SIE: u32 = 0x104;
pub const CSR_STVEC: u32 = 0x105;
pub const CSR_SCOUNTEREN: u32 = 0x106;
pub const CSR_SENVCFG: u32 = 0x10A;
pub const CSR_SSCRATCH: u32 = 0x140;
pub const CSR_SEPC: u32 = 0x141;
pub const CSR_SCAUSE: u32 = 0x142;
pub const CSR_STVAL: u32 = 0x143;
pub const CSR_SIP: u32 = 0x144;
pub const CSR_STIMECMP: u32 = 0x14D;
pub const CSR_STIMECMPH: u32 = 0x15D;
pub const CSR_SATP: u32 = 0x180;

// Machine CSRs
pub const CSR_MVENDORID: u32 = 0xF11;
pub const CSR_MARCHID: u32 = 0xF12;
pub const CSR_MIMPID: u32 = 0xF13;
pub const CSR_MHARTID: u32 = 0xF14;
pub const CSR_MCONFIGPTR: u32 = 0xF15;
pub const CSR_MSTATUS: u32 = 0x300;
pub const CSR_MISA: u32 = 0x301;
pub const CSR_MEDELEG: u32 = 0x302;
pub const CSR_MIDELEG: u32 = 0x303;
pub const CSR_MIE: u32 = 0x304;
pub const CSR_MTVEC: u32 = 0x305;
pub const CSR_MCOUNTEREN: u32 = 0x306;
pub const CSR_MENVCFG: u32 = 0x30A;
pub const CSR_MSTATUSH: u32 = 0x310;
pub const CSR_MENVCFGH: u32 = 0x31A;
pub const CSR_MCOUNTINHIBIT: u32 = 0x320;
pub const CSR_MHPMEVENT3: u32 = 0x323;
pub const CSR_MHPMEVENT31: u32 = 0x33F;
pub const CSR_MSCRATCH: u32 = 0x340;
pub const CSR_MEPC: u32 = 0x341;
pub const CSR_MCAUSE: u32 = 0x342;
pub const CSR_MTVAL: u32 = 0x343;
pub const CSR_MIP: u32 = 0x344;
pub const CSR_PMPCFG0: u32 = 0x3A0;
pub const CSR_PMPCFG15: u32 = 0x3AF;
pub const CSR_PMPADDR0: u32 = 0x3B0;
pub const CSR_PMPADDR63: u32 = 0x3EF;
pub const CSR_MCYCLE: u32 = 0xB00;
pub const CSR_MINSTRET: u32 = 0xB02;
pub const CSR_MHPMCOUNTER31: u32 = 0xB1F;
pub const CSR_MCYCLEH: u32 = 0xB80;
pub const CSR_MINSTRETH: u32 = 0xB82;
pub const CSR_MHPMCOUNTER31H: u32 = 0xB9F;

// MSTATUS bits
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP: u64 = 3 << 11;
pub const MSTATUS_FS: u64 = 3 << 13;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;
pub const MSTATUS_TVM: u64 = 1 << 20;
pub const MSTATUS_TW: u64 = 1 << 21;
pub const MSTATUS_TSR: u64 = 1 << 22;
pub const MSTATUS_UXL: u64 = 3 << 32;
pub const MSTATUS_SXL: u64 = 3 << 34;

const MSTATUS_WRITABLE: u64 = MSTATUS_SIE
    | MSTATUS_MIE
    | MSTATUS_SPIE
    | MSTATUS_MPIE
    | MSTATUS_SPP
    | MSTATUS_MPP
    | MSTATUS_MPRV
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_TVM
    | MSTATUS_TW
    | MSTATUS_TSR;
const SSTATUS_WRITABLE: u64 = MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP | MSTATUS_SUM | MSTATUS_MXR;
/// Bits of mstatus that change translation results cached in the TLB.
const MSTATUS_TRANSLATION: u64 = MSTATUS_MPRV | MSTATUS_SUM | MSTATUS_MXR;

// MIP/MIE bits
pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_MEIP: u64 = 1 << 11;
pub const MIP_MASK: u64 = MIP_SSIP | MIP_MSIP | MIP_STIP | MIP_MTIP | MIP_SEIP | MIP_MEIP;

/// Exceptions that may be delegated (everything but M-mode ecall and the
/// reserved causes 10 and 14).
pub const MEDELEG_MASK: u64 = 0xB3FF;
pub const MIDELEG_MASK: u64 = MIP_SSIP | MIP_STIP | MIP_SEIP;

pub const MENVCFG_FIOM: u64 = 1 << 0;
pub const MENVCFG_STCE: u64 = 1 << 63;

const COUNTEREN_MASK: u64 = 0x7;
const COUNTEREN_TM: u64 = 1 << 1;
const MCOUNTINHIBIT_MASK: u64 = 0x5;
pub const MCOUNTINHIBIT_CY: u64 = 1 << 0;
pub const MCOUNTINHIBIT_IR: u64 = 1 << 2;

/// Zkr seed status "ES16": 16 bits of entropy follow.
const SEED_ES16: u64 = 0b10 << 30;

/// CSR operations of the Zicsr instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Swap,
    SetBits,
    ClearBits,
}

/// Stored CSR state. Values are XLEN-wide; RV32 harts only ever hold
/// 32-bit values except in the 64-bit counters and compare registers.
/// `mip` is not here: interrupt lines live in the hart's shared pending
/// mask. Only the software-writable SEIP bit is kept locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrBank {
    pub mstatus: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mie: u64,
    pub mtvec: u64,
    pub mcounteren: u64,
    pub menvcfg: u64,
    pub mcountinhibit: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub stvec: u64,
    pub scounteren: u64,
    pub senvcfg: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub satp: u64,
    pub stimecmp: u64,
    pub fcsr: u64,
    pub mcycle: u64,
    pub minstret: u64,
    /// SEIP as written through `mip`, ORed with the external line on read
    pub seip: bool,
}

impl Default for CsrBank {
    fn default() -> Self {
        CsrBank {
            mstatus: 0,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mtvec: 0,
            mcounteren: 0,
            menvcfg: 0,
            mcountinhibit: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            stvec: 0,
            scounteren: 0,
            senvcfg: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            satp: 0,
            stimecmp: u64::MAX,
            fcsr: 0,
            mcycle: 0,
            minstret: 0,
            seip: false,
        }
    }
}

/// Replace the low or high 32 bits of `reg`.
#[inline]
fn set_half(reg: u64, value: u64, high: bool) -> u64 {
    if high {
        (reg & 0xFFFF_FFFF) | (value << 32)
    } else {
        (reg & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF)
    }
}

/// mtvec/stvec: modes 2 and 3 are reserved, keep the previous mode.
#[inline]
fn legal_tvec(old: u64, value: u64) -> u64 {
    if value & 3 >= 2 {
        (value & !3) | (old & 3)
    } else {
        value
    }
}

impl Hart {
    /// `mip` as seen by this hart: the shared interrupt lines plus the
    /// software-written SEIP bit.
    #[inline]
    pub fn mip(&self) -> u64 {
        let seip = if self.csr.seip { MIP_SEIP } else { 0 };
        (self.shared.pending() | seip) & MIP_MASK
    }

    /// Execute a CSR read/modify/write. On entry `value` holds the operand,
    /// on success it holds the previous register value (XLEN-wide,
    /// zero-extended). `false` means the access is illegal and the caller
    /// must raise an illegal-instruction trap.
    pub fn csr_op(&mut self, csr: u32, value: &mut u64, op: CsrOp) -> bool {
        let csr = csr & 0xFFF;
        let operand = self.xlen_addr(*value);
        let writes = op == CsrOp::Swap || operand != 0;

        // bits 11:10 == 0b11: read-only
        if (csr >> 10) & 3 == 3 && writes {
            return false;
        }
        // bits 9:8: lowest privilege allowed
        if (csr >> 8) & 3 > self.priv_level as u32 {
            return false;
        }
        if csr == CSR_SEED {
            return self.seed(value, op);
        }

        let Some(old) = self.csr_read(csr) else {
            return false;
        };
        if writes {
            let new = match op {
                CsrOp::Swap => operand,
                CsrOp::SetBits => old | operand,
                CsrOp::ClearBits => old & !operand,
            };
            self.csr_write(csr, new);
        }
        *value = old;
        true
    }

    /// Readable mstatus: stored bits plus the fixed XLEN fields and SD.
    pub(crate) fn read_mstatus(&self) -> u64 {
        let mut status = self.csr.mstatus;
        if self.caps.rv64 {
            status |= (2 << 32) | (2 << 34);
        }
        if status & MSTATUS_FS == MSTATUS_FS {
            status |= 1 << (self.xlen_bits() - 1);
        }
        status
    }

    fn sstatus_view(&self) -> u64 {
        let mask = SSTATUS_WRITABLE | MSTATUS_FS | MSTATUS_UXL | 1 << (self.xlen_bits() - 1);
        self.read_mstatus() & mask
    }

    pub(crate) fn misa(&self) -> u64 {
        let ext = |c: u8| 1u64 << (c - b'A');
        let mut isa = ext(b'I') | ext(b'M') | ext(b'A') | ext(b'C') | ext(b'S') | ext(b'U');
        if self.caps.fpu {
            isa |= ext(b'F') | ext(b'D');
        }
        if self.caps.rv64 {
            isa | 2 << 62
        } else {
            isa | 1 << 30
        }
    }

    #[inline]
    pub(crate) fn fpu_enabled(&self) -> bool {
        self.caps.fpu && self.csr.mstatus & MSTATUS_FS != 0
    }

    pub(crate) fn mark_fs_dirty(&mut self) {
        self.csr.mstatus |= MSTATUS_FS;
    }

    pub(crate) fn stce(&self) -> bool {
        self.csr.menvcfg & MENVCFG_STCE != 0
    }

    fn counter_enabled(&self, csr: u32) -> bool {
        let bit = 1u64 << (csr & 0x1F);
        match self.priv_level {
            PrivilegeLevel::Machine => true,
            PrivilegeLevel::Supervisor => self.csr.mcounteren & bit != 0,
            PrivilegeLevel::User => self.csr.mcounteren & bit != 0 && self.csr.scounteren & bit != 0,
        }
    }

    fn counter(&self, idx: u32) -> u64 {
        match idx {
            0 => self.csr.mcycle,
            1 => self.timer.now(),
            2 => self.csr.minstret,
            _ => 0,
        }
    }

    fn stimecmp_enabled(&self) -> bool {
        match self.priv_level {
            PrivilegeLevel::Machine => true,
            _ => self.stce() && self.csr.mcounteren & COUNTEREN_TM != 0,
        }
    }

    fn csr_read(&self, csr: u32) -> Option<u64> {
        let rv64 = self.caps.rv64;
        let value = match csr {
            CSR_FFLAGS | CSR_FRM | CSR_FCSR => {
                if !self.fpu_enabled() {
                    return None;
                }
                match csr {
                    CSR_FFLAGS => self.csr.fcsr & 0x1F,
                    CSR_FRM => (self.csr.fcsr >> 5) & 0x7,
                    _ => self.csr.fcsr & 0xFF,
                }
            }
            CSR_CYCLE..=CSR_HPMCOUNTER31 => {
                if !self.counter_enabled(csr) {
                    return None;
                }
                self.counter(csr & 0x1F)
            }
            CSR_CYCLEH..=CSR_HPMCOUNTER31H => {
                if rv64 || !self.counter_enabled(csr) {
                    return None;
                }
                self.counter(csr & 0x1F) >> 32
            }

            CSR_SSTATUS => self.sstatus_view(),
            CSR_SIE => self.csr.mie & self.csr.mideleg,
            CSR_STVEC => self.csr.stvec,
            CSR_SCOUNTEREN => self.csr.scounteren,
            CSR_SENVCFG => self.csr.senvcfg,
            CSR_SSCRATCH => self.csr.sscratch,
            CSR_SEPC => self.csr.sepc,
            CSR_SCAUSE => self.csr.scause,
            CSR_STVAL => self.csr.stval,
            CSR_SIP => self.mip() & self.csr.mideleg,
            CSR_STIMECMP => {
                if !self.stimecmp_enabled() {
                    return None;
                }
                self.csr.stimecmp
            }
            CSR_STIMECMPH => {
                if rv64 || !self.stimecmp_enabled() {
                    return None;
                }
                self.csr.stimecmp >> 32
            }
            CSR_SATP => {
                if self.priv_level == PrivilegeLevel::Supervisor && self.csr.mstatus & MSTATUS_TVM != 0 {
                    return None;
                }
                self.csr.satp
            }

            CSR_MVENDORID | CSR_MARCHID | CSR_MIMPID | CSR_MCONFIGPTR => 0,
            CSR_MHARTID => self.shared.id() as u64,
            CSR_MSTATUS => self.read_mstatus(),
            CSR_MISA => self.misa(),
            CSR_MEDELEG => self.csr.medeleg,
            CSR_MIDELEG => self.csr.mideleg,
            CSR_MIE => self.csr.mie,
            CSR_MTVEC => self.csr.mtvec,
            CSR_MCOUNTEREN => self.csr.mcounteren,
            CSR_MENVCFG => self.csr.menvcfg,
            CSR_MSTATUSH if !rv64 => 0,
            CSR_MENVCFGH if !rv64 => self.csr.menvcfg >> 32,
            CSR_MCOUNTINHIBIT => self.csr.mcountinhibit,
            CSR_MHPMEVENT3..=CSR_MHPMEVENT31 => 0,
            CSR_MSCRATCH => self.csr.mscratch,
            CSR_MEPC => self.csr.mepc,
            CSR_MCAUSE => self.csr.mcause,
            CSR_MTVAL => self.csr.mtval,
            CSR_MIP => self.mip(),
            CSR_PMPCFG0..=CSR_PMPCFG15 => {
                // odd pmpcfg registers only exist on RV32
                if rv64 && csr & 1 != 0 {
                    return None;
                }
                0
            }
            CSR_PMPADDR0..=CSR_PMPADDR63 => 0,
            CSR_MCYCLE..=CSR_MHPMCOUNTER31 if csr != CSR_MCYCLE + 1 => self.counter(csr & 0x1F),
            CSR_MCYCLEH..=CSR_MHPMCOUNTER31H if !rv64 && csr != CSR_MCYCLEH + 1 => {
                self.counter(csr & 0x1F) >> 32
            }
            _ => return None,
        };
        Some(if rv64 { value } else { value & 0xFFFF_FFFF })
    }

    fn csr_write(&mut self, csr: u32, value: u64) {
        let rv64 = self.caps.rv64;
        match csr {
            CSR_FFLAGS => {
                self.csr.fcsr = (self.csr.fcsr & !0x1F) | (value & 0x1F);
                self.mark_fs_dirty();
            }
            CSR_FRM => {
                self.csr.fcsr = (self.csr.fcsr & !0xE0) | ((value & 0x7) << 5);
                self.mark_fs_dirty();
            }
            CSR_FCSR => {
                self.csr.fcsr = value & 0xFF;
                self.mark_fs_dirty();
            }

            CSR_SSTATUS => {
                let mask = SSTATUS_WRITABLE | if self.caps.fpu { MSTATUS_FS } else { 0 };
                self.write_mstatus((self.csr.mstatus & !mask) | (value & mask));
            }
            CSR_SIE => {
                let mask = self.csr.mideleg & MIP_MASK;
                self.csr.mie = (self.csr.mie & !mask) | (value & mask);
                self.irq_check = true;
            }
            CSR_STVEC => self.csr.stvec = legal_tvec(self.csr.stvec, value),
            CSR_SCOUNTEREN => self.csr.scounteren = value & COUNTEREN_MASK,
            CSR_SENVCFG => self.csr.senvcfg = value & MENVCFG_FIOM,
            CSR_SSCRATCH => self.csr.sscratch = value,
            CSR_SEPC => self.csr.sepc = value & !1,
            CSR_SCAUSE => self.csr.scause = value,
            CSR_STVAL => self.csr.stval = value,
            CSR_SIP => {
                // only SSIP is writable, and only when delegated
                if self.csr.mideleg & MIP_SSIP != 0 {
                    if value & MIP_SSIP != 0 {
                        self.shared.raise_interrupt(MIP_SSIP);
                    } else {
                        self.shared.clear_interrupt(MIP_SSIP);
                    }
                    self.irq_check = true;
                }
            }
            CSR_STIMECMP | CSR_STIMECMPH => {
                self.csr.stimecmp = if rv64 {
                    value
                } else {
                    set_half(self.csr.stimecmp, value, csr == CSR_STIMECMPH)
                };
                self.update_timer_irqs();
                self.irq_check = true;
            }
            CSR_SATP => self.write_satp(value),

            CSR_MSTATUS => {
                let mask = MSTATUS_WRITABLE | if self.caps.fpu { MSTATUS_FS } else { 0 };
                self.write_mstatus((self.csr.mstatus & !mask) | (value & mask));
            }
            CSR_MEDELEG => self.csr.medeleg = value & MEDELEG_MASK,
            CSR_MIDELEG => {
                self.csr.mideleg = value & MIDELEG_MASK;
                self.irq_check = true;
            }
            CSR_MIE => {
                self.csr.mie = value & MIP_MASK;
                self.irq_check = true;
            }
            CSR_MTVEC => self.csr.mtvec = legal_tvec(self.csr.mtvec, value),
            CSR_MCOUNTEREN => self.csr.mcounteren = value & COUNTEREN_MASK,
            CSR_MENVCFG => {
                self.csr.menvcfg = if rv64 {
                    value & (MENVCFG_FIOM | MENVCFG_STCE)
                } else {
                    (self.csr.menvcfg & !0xFFFF_FFFF) | (value & MENVCFG_FIOM)
                };
                self.update_timer_irqs();
            }
            CSR_MENVCFGH => {
                self.csr.menvcfg = (self.csr.menvcfg & 0xFFFF_FFFF) | ((value << 32) & MENVCFG_STCE);
                self.update_timer_irqs();
            }
            CSR_MCOUNTINHIBIT => self.csr.mcountinhibit = value & MCOUNTINHIBIT_MASK,
            CSR_MSCRATCH => self.csr.mscratch = value,
            CSR_MEPC => self.csr.mepc = value & !1,
            CSR_MCAUSE => self.csr.mcause = value,
            CSR_MTVAL => self.csr.mtval = value,
            CSR_MIP => {
                let mut writable = MIP_SSIP;
                if !self.stce() {
                    writable |= MIP_STIP;
                }
                self.shared.raise_interrupt(value & writable);
                self.shared.clear_interrupt(!value & writable);
                // The external SEIP line is never touched from here.
                self.csr.seip = value & MIP_SEIP != 0;
                self.irq_check = true;
            }
            CSR_MCYCLE | CSR_MCYCLEH => {
                self.csr.mcycle = if rv64 { value } else { set_half(self.csr.mcycle, value, csr == CSR_MCYCLEH) };
            }
            CSR_MINSTRET | CSR_MINSTRETH => {
                self.csr.minstret =
                    if rv64 { value } else { set_half(self.csr.minstret, value, csr == CSR_MINSTRETH) };
            }
            // misa, pmp*, mhpm*, mstatush: WARL fields hardwired to their read value
            _ => {}
        }
    }

    pub(crate) fn write_mstatus(&mut self, mut new: u64) {
        let old = self.csr.mstatus;
        if new & MSTATUS_MPP == 2 << 11 {
            new = (new & !MSTATUS_MPP) | (old & MSTATUS_MPP);
        }
        self.csr.mstatus = new;

        let changed = old ^ new;
        let mprv = (old | new) & MSTATUS_MPRV != 0;
        if changed & MSTATUS_TRANSLATION != 0 || (mprv && changed & MSTATUS_MPP != 0) {
            self.tlb.flush();
        }
        if changed & (MSTATUS_MIE | MSTATUS_SIE) != 0 {
            self.irq_check = true;
        }
    }

    fn write_satp(&mut self, value: u64) {
        let Some(mode) = SatpMode::from_satp(value, &self.caps) else {
            debug!("hart {}: satp write {:#x} with unsupported mode ignored", self.id(), value);
            return;
        };
        // ASIDs are not implemented: the field reads as zero.
        self.csr.satp = if self.caps.rv64 {
            value & (0xF << 60 | ((1 << 44) - 1))
        } else {
            value & (1 << 31 | 0x3F_FFFF)
        };
        if mode != self.mmu_mode {
            debug!("hart {}: translation mode {:?} -> {:?}", self.id(), self.mmu_mode, mode);
            self.mmu_mode = mode;
            self.tlb.flush();
        }
    }

    fn seed(&mut self, value: &mut u64, op: CsrOp) -> bool {
        // No mseccfg: only M-mode may sample, and only through a write.
        if self.priv_level != PrivilegeLevel::Machine || op != CsrOp::Swap {
            return false;
        }
        *value = SEED_ES16 | host_entropy16() as u64;
        true
    }
}

#[cfg(target_os = "linux")]
fn host_entropy16() -> u16 {
    let mut buf = [0u8; 2];
    // SAFETY: buf is valid for 2 bytes.
    let n = unsafe { libc::getrandom(buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n == buf.len() as isize {
        u16::from_le_bytes(buf)
    } else {
        fallback_entropy16()
    }
}

#[cfg(not(target_os = "linux"))]
fn host_entropy16() -> u16 {
    fallback_entropy16()
}

fn fallback_entropy16() -> u16 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    if let Ok(t) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        hasher.write_u128(t.as_nanos());
    }
    hasher.finish() as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testutil;

    fn read(hart: &mut Hart, csr: u32) -> Option<u64> {
        let mut v = 0;
        hart.csr_op(csr, &mut v, CsrOp::SetBits).then_some(v)
    }

    fn write(hart: &mut Hart, csr: u32, value: u64) -> bool {
        let mut v = value;
        hart.csr_op(csr, &mut v, CsrOp::Swap)
    }

    const WARL_CSRS: &[u32] = &[
        CSR_SSTATUS,
        CSR_SIE,
        CSR_STVEC,
        CSR_SCOUNTEREN,
        CSR_SENVCFG,
        CSR_SEPC,
        CSR_SIP,
        CSR_SATP,
        CSR_MSTATUS,
        CSR_MISA,
        CSR_MEDELEG,
        CSR_MIDELEG,
        CSR_MIE,
        CSR_MTVEC,
        CSR_MCOUNTEREN,
        CSR_MENVCFG,
        CSR_MCOUNTINHIBIT,
        CSR_MEPC,
        CSR_MIP,
        CSR_PMPADDR0,
    ];

    #[test]
    fn test_warl_write_read_idempotent() {
        for mut hart in [testutil::rv64(), testutil::rv32()] {
            let patterns = [0, u64::MAX, 0x5555_5555_5555_5555, 0xAAAA_AAAA_AAAA_AAAA, 0x8000_0000_0000_1803];
            for &csr in WARL_CSRS {
                for &p in &patterns {
                    assert!(write(&mut hart, csr, p), "write {:#x}", csr);
                    let first = read(&mut hart, csr).unwrap();
                    assert!(write(&mut hart, csr, first));
                    let second = read(&mut hart, csr).unwrap();
                    assert_eq!(first, second, "csr {:#x} pattern {:#x}", csr, p);
                }
            }
        }
    }

    #[test]
    fn test_privilege_gating() {
        let mut hart = testutil::rv64();
        write(&mut hart, CSR_MCOUNTEREN, 7);
        write(&mut hart, CSR_SCOUNTEREN, 7);
        write(&mut hart, CSR_MENVCFG, MENVCFG_STCE);
        let implemented: Vec<u32> = (0..0x1000)
            .filter(|&csr| csr != CSR_SEED && read(&mut hart, csr).is_some())
            // hpmcounter3..31 have no enable bits below M
            .filter(|&csr| !(CSR_CYCLE + 3..=CSR_HPMCOUNTER31).contains(&csr))
            .collect();
        assert!(implemented.contains(&CSR_MSTATUS));
        assert!(implemented.contains(&CSR_CYCLE));

        for level in [PrivilegeLevel::User, PrivilegeLevel::Supervisor, PrivilegeLevel::Machine] {
            hart.set_privilege(level);
            for csr in 0..0x1000u32 {
                let min = (csr >> 8) & 3;
                if min > level as u32 {
                    for op in [CsrOp::Swap, CsrOp::SetBits, CsrOp::ClearBits] {
                        let mut v = 0;
                        assert!(!hart.csr_op(csr, &mut v, op), "csr {:#x} at {:?}", csr, level);
                    }
                } else if implemented.contains(&csr) {
                    assert!(read(&mut hart, csr).is_some(), "csr {:#x} at {:?}", csr, level);
                }
            }
        }
    }

    #[test]
    fn test_read_only_csrs() {
        let mut hart = testutil::rv64();
        assert_eq!(read(&mut hart, CSR_MHARTID), Some(0));
        assert!(!write(&mut hart, CSR_MHARTID, 0));
        let mut v = 1;
        assert!(!hart.csr_op(CSR_MVENDORID, &mut v, CsrOp::SetBits));
        let mut v = 0;
        assert!(hart.csr_op(CSR_CYCLE, &mut v, CsrOp::ClearBits));
    }

    #[test]
    fn test_mstatus_fields() {
        let mut hart = testutil::rv64();
        // MPP = 2 is reserved and keeps the old value (0 after reset)
        write(&mut hart, CSR_MSTATUS, 2 << 11);
        assert_eq!(read(&mut hart, CSR_MSTATUS).unwrap() & MSTATUS_MPP, 0);
        write(&mut hart, CSR_MSTATUS, 1 << 11);
        let status = read(&mut hart, CSR_MSTATUS).unwrap();
        assert_eq!(status & MSTATUS_MPP, 1 << 11);
        assert_eq!(status & (MSTATUS_UXL | MSTATUS_SXL), (2 << 32) | (2 << 34));
        // FS is hardwired off without an FPU
        write(&mut hart, CSR_MSTATUS, MSTATUS_FS);
        assert_eq!(read(&mut hart, CSR_MSTATUS).unwrap() & (MSTATUS_FS | 1 << 63), 0);
        // sstatus is a restricted view
        write(&mut hart, CSR_MSTATUS, MSTATUS_MIE | MSTATUS_SIE);
        assert_eq!(read(&mut hart, CSR_SSTATUS).unwrap() & (MSTATUS_MIE | MSTATUS_SIE), MSTATUS_SIE);
    }

    #[test]
    fn test_fcsr_requires_fs() {
        let cfg = crate::MachineConfig { fpu: true, ram_size: 1 << 20, ..Default::default() };
        let mut hart = testutil::hart(&cfg);
        assert!(read(&mut hart, CSR_FCSR).is_none());
        write(&mut hart, CSR_MSTATUS, 1 << 13);
        assert!(write(&mut hart, CSR_FRM, 3));
        assert_eq!(read(&mut hart, CSR_FCSR), Some(3 << 5));
        let status = read(&mut hart, CSR_MSTATUS).unwrap();
        assert_eq!(status & MSTATUS_FS, MSTATUS_FS);
        assert_ne!(status & (1 << 63), 0);
    }

    #[test]
    fn test_satp_modes() {
        let mut hart = testutil::rv64();
        write(&mut hart, CSR_SATP, 8 << 60 | 0x1234);
        assert_eq!(hart.mmu_mode, SatpMode::Sv39);
        // Sv57 is not enabled: the write is dropped
        write(&mut hart, CSR_SATP, 10 << 60 | 0x99);
        assert_eq!(read(&mut hart, CSR_SATP), Some(8 << 60 | 0x1234));
        // ASID reads as zero
        write(&mut hart, CSR_SATP, 9 << 60 | 0xFFFF << 44 | 0x10);
        assert_eq!(read(&mut hart, CSR_SATP), Some(9 << 60 | 0x10));
        assert_eq!(hart.mmu_mode, SatpMode::Sv48);

        let mut hart = testutil::rv32();
        write(&mut hart, CSR_SATP, 0x8000_0042);
        assert_eq!(hart.mmu_mode, SatpMode::Sv32);
        assert_eq!(read(&mut hart, CSR_SATP), Some(0x8000_0042));
    }

    #[test]
    fn test_satp_tvm() {
        let mut hart = testutil::rv64();
        write(&mut hart, CSR_MSTATUS, MSTATUS_TVM);
        hart.set_privilege(PrivilegeLevel::Supervisor);
        assert!(read(&mut hart, CSR_SATP).is_none());
        hart.set_privilege(PrivilegeLevel::Machine);
        assert!(read(&mut hart, CSR_SATP).is_some());
    }

    #[test]
    fn test_counter_enables() {
        let mut hart = testutil::rv64();
        hart.set_privilege(PrivilegeLevel::User);
        assert!(read(&mut hart, CSR_TIME).is_none());
        hart.set_privilege(PrivilegeLevel::Machine);
        write(&mut hart, CSR_MCOUNTEREN, 2);
        hart.set_privilege(PrivilegeLevel::Supervisor);
        assert!(read(&mut hart, CSR_TIME).is_some());
        assert!(read(&mut hart, CSR_CYCLE).is_none());
        hart.set_privilege(PrivilegeLevel::User);
        assert!(read(&mut hart, CSR_TIME).is_none());
    }

    #[test]
    fn test_rv32_high_halves() {
        let mut hart = testutil::rv32();
        write(&mut hart, CSR_MCYCLEH, 0x12);
        write(&mut hart, CSR_MCYCLE, 0x34);
        assert_eq!(hart.csr.mcycle, 0x12_0000_0034);
        assert_eq!(read(&mut hart, CSR_CYCLEH), Some(0x12));
        let mut hart = testutil::rv64();
        assert!(read(&mut hart, CSR_CYCLEH).is_none());
        assert!(read(&mut hart, CSR_MSTATUSH).is_none());
    }

    #[test]
    fn test_mip_write_keeps_external_seip() {
        let mut hart = testutil::rv64();
        hart.shared().raise_interrupt(MIP_SEIP);
        // a read-modify-write that leaves SEIP clear
        write(&mut hart, CSR_MIP, 0);
        assert_eq!(read(&mut hart, CSR_MIP), Some(MIP_SEIP));
        assert_ne!(hart.shared().pending() & MIP_SEIP, 0);

        // the software bit is ORed in and cleared on its own
        hart.shared().clear_interrupt(MIP_SEIP);
        write(&mut hart, CSR_MIP, MIP_SEIP);
        assert_eq!(read(&mut hart, CSR_MIP), Some(MIP_SEIP));
        assert_eq!(hart.shared().pending() & MIP_SEIP, 0);
        write(&mut hart, CSR_MIP, 0);
        assert_eq!(read(&mut hart, CSR_MIP), Some(0));
    }

    #[test]
    fn test_mip_and_delegated_views() {
        let mut hart = testutil::rv64();
        write(&mut hart, CSR_MIP, MIP_SSIP | MIP_MTIP);
        // MTIP is not software-writable
        assert_eq!(read(&mut hart, CSR_MIP), Some(MIP_SSIP));
        assert_eq!(read(&mut hart, CSR_SIP), Some(0));
        write(&mut hart, CSR_MIDELEG, u64::MAX);
        assert_eq!(read(&mut hart, CSR_MIDELEG), Some(MIDELEG_MASK));
        assert_eq!(read(&mut hart, CSR_SIP), Some(MIP_SSIP));
        write(&mut hart, CSR_SIE, u64::MAX);
        assert_eq!(read(&mut hart, CSR_MIE), Some(MIDELEG_MASK));
    }

    #[test]
    fn test_seed() {
        let mut hart = testutil::rv64();
        let mut v = 0;
        assert!(hart.csr_op(CSR_SEED, &mut v, CsrOp::Swap));
        assert_eq!(v >> 30, 0b10);
        assert!(v < 1 << 32);
        let mut v = 0;
        assert!(!hart.csr_op(CSR_SEED, &mut v, CsrOp::SetBits));
        hart.set_privilege(PrivilegeLevel::Supervisor);
        assert!(!hart.csr_op(CSR_SEED, &mut v, CsrOp::Swap));
    }

    #[test]
    fn test_tvec_reserved_modes() {
        let mut hart = testutil::rv64();
        write(&mut hart, CSR_MTVEC, 0x8000_0101);
        write(&mut hart, CSR_MTVEC, 0x8000_0202);
        assert_eq!(read(&mut hart, CSR_MTVEC), Some(0x8000_0201));
    }
}
