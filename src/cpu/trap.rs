//! Trap handling (exceptions and interrupts)
//!
//! A trap never unwinds: the faulting path returns `Err(Trap)` up to the
//! dispatch loop, which calls [`Hart::trap`] to register it. The loop then
//! commits the new pc before the next instruction.

use log::{debug, trace, warn};

use super::csr::*;
use super::mmu::AccessType;
use super::{Hart, PrivilegeLevel};

/// Exception/interrupt cause. Payloads are the trap value (tval).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    // Exceptions (synchronous)
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),

    // Interrupts (asynchronous)
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

/// Interrupt bits in delivery priority order.
const INTERRUPT_PRIORITY: [u64; 6] = [MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_SSIP, MIP_STIP];

impl Trap {
    /// Cause code without the interrupt bit
    pub fn code(&self) -> u64 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU => 8,
            Trap::EnvironmentCallFromS => 9,
            Trap::EnvironmentCallFromM => 11,
            Trap::InstructionPageFault(_) => 12,
            Trap::LoadPageFault(_) => 13,
            Trap::StorePageFault(_) => 15,

            Trap::SupervisorSoftwareInterrupt => 1,
            Trap::MachineSoftwareInterrupt => 3,
            Trap::SupervisorTimerInterrupt => 5,
            Trap::MachineTimerInterrupt => 7,
            Trap::SupervisorExternalInterrupt => 9,
            Trap::MachineExternalInterrupt => 11,
        }
    }

    /// Get the trap value (bad address, instruction bits, ...)
    pub fn tval(&self) -> u64 {
        match self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v)
            | Trap::InstructionPageFault(v)
            | Trap::LoadPageFault(v)
            | Trap::StorePageFault(v) => *v,
            _ => 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Trap::SupervisorSoftwareInterrupt
                | Trap::MachineSoftwareInterrupt
                | Trap::SupervisorTimerInterrupt
                | Trap::MachineTimerInterrupt
                | Trap::SupervisorExternalInterrupt
                | Trap::MachineExternalInterrupt
        )
    }

    /// Value written to mcause/scause: interrupts set bit XLEN-1.
    pub fn cause(&self, rv64: bool) -> u64 {
        if self.is_interrupt() {
            let bit = if rv64 { 1 << 63 } else { 1 << 31 };
            bit | self.code()
        } else {
            self.code()
        }
    }

    /// Interrupt for an `mip` bit number
    pub fn from_interrupt(code: u64) -> Option<Trap> {
        Some(match code {
            1 => Trap::SupervisorSoftwareInterrupt,
            3 => Trap::MachineSoftwareInterrupt,
            5 => Trap::SupervisorTimerInterrupt,
            7 => Trap::MachineTimerInterrupt,
            9 => Trap::SupervisorExternalInterrupt,
            11 => Trap::MachineExternalInterrupt,
            _ => return None,
        })
    }

    pub fn page_fault(access: AccessType, addr: u64) -> Trap {
        match access {
            AccessType::Instruction => Trap::InstructionPageFault(addr),
            AccessType::Load => Trap::LoadPageFault(addr),
            AccessType::Store => Trap::StorePageFault(addr),
        }
    }

    pub fn access_fault(access: AccessType, addr: u64) -> Trap {
        match access {
            AccessType::Instruction => Trap::InstructionAccessFault(addr),
            AccessType::Load => Trap::LoadAccessFault(addr),
            AccessType::Store => Trap::StoreAccessFault(addr),
        }
    }

    pub fn misaligned(access: AccessType, addr: u64) -> Trap {
        match access {
            AccessType::Instruction => Trap::InstructionAddressMisaligned(addr),
            AccessType::Load => Trap::LoadAddressMisaligned(addr),
            AccessType::Store => Trap::StoreAddressMisaligned(addr),
        }
    }

    pub fn ecall(from: PrivilegeLevel) -> Trap {
        match from {
            PrivilegeLevel::User => Trap::EnvironmentCallFromU,
            PrivilegeLevel::Supervisor => Trap::EnvironmentCallFromS,
            PrivilegeLevel::Machine => Trap::EnvironmentCallFromM,
        }
    }
}

#[inline]
fn with_bit(status: u64, bit: u64, set: bool) -> u64 {
    if set {
        status | bit
    } else {
        status & !bit
    }
}

impl Hart {
    /// Register a trap taken at the current pc. Returns `false` if a trap
    /// is already pending this cycle; the second one is dropped.
    pub fn trap(&mut self, trap: Trap) -> bool {
        if self.trap_pending {
            warn!("hart {}: second trap {:?} in one cycle ignored (pc={:#x})", self.id(), trap, self.pc);
            return false;
        }

        let code = trap.code();
        let interrupt = trap.is_interrupt();
        let deleg = if interrupt { self.csr.mideleg } else { self.csr.medeleg };
        let from = self.priv_level;
        let to_supervisor = from < PrivilegeLevel::Machine && (deleg >> code) & 1 != 0;

        let cause = trap.cause(self.caps.rv64);
        let tval = self.xlen_addr(trap.tval());
        let epc = self.pc;
        let mut status = self.csr.mstatus;

        let (target, tvec) = if to_supervisor {
            self.csr.sepc = epc;
            self.csr.scause = cause;
            self.csr.stval = tval;
            status = with_bit(status, MSTATUS_SPIE, status & MSTATUS_SIE != 0);
            status = with_bit(status, MSTATUS_SPP, from == PrivilegeLevel::Supervisor);
            status &= !MSTATUS_SIE;
            (PrivilegeLevel::Supervisor, self.csr.stvec)
        } else {
            self.csr.mepc = epc;
            self.csr.mcause = cause;
            self.csr.mtval = tval;
            status = with_bit(status, MSTATUS_MPIE, status & MSTATUS_MIE != 0);
            status = (status & !MSTATUS_MPP) | ((from as u64) << 11);
            status &= !MSTATUS_MIE;
            (PrivilegeLevel::Machine, self.csr.mtvec)
        };
        self.csr.mstatus = status;

        // Vectored mode: interrupts jump to base + 4 * cause
        let base = tvec & !3;
        let vector = if interrupt && tvec & 1 != 0 { base + 4 * code } else { base };

        self.set_privilege(target);
        if status & MSTATUS_MPRV != 0 {
            // MPP changed under MPRV
            self.tlb.flush();
        }
        self.trap_pending = true;
        self.trap_pc = self.xlen_addr(vector);
        self.wfi = false;

        self.stats.traps += 1;
        if interrupt {
            self.stats.interrupts += 1;
            debug!("hart {}: interrupt {:?} -> {:?} at {:#x}", self.id(), trap, target, self.trap_pc);
        } else {
            trace!(
                "hart {}: {:?} at pc={:#x} -> {:?} vector {:#x}",
                self.id(),
                trap,
                epc,
                target,
                self.trap_pc
            );
        }
        true
    }

    /// Move to the trap vector if a trap was registered this cycle.
    pub(crate) fn commit_trap(&mut self) -> bool {
        if self.trap_pending {
            self.pc = self.trap_pc;
            self.trap_pending = false;
            true
        } else {
            false
        }
    }

    /// Highest-priority interrupt that is pending, enabled and deliverable
    /// at the current privilege level.
    pub fn pending_interrupt(&self) -> Option<Trap> {
        let pending = self.mip() & self.csr.mie;
        if pending == 0 {
            return None;
        }

        let status = self.csr.mstatus;
        let m_enabled = self.priv_level < PrivilegeLevel::Machine || status & MSTATUS_MIE != 0;
        let s_enabled = self.priv_level < PrivilegeLevel::Supervisor
            || (self.priv_level == PrivilegeLevel::Supervisor && status & MSTATUS_SIE != 0);

        let m_interrupts = pending & !self.csr.mideleg;
        let s_interrupts = pending & self.csr.mideleg;
        let deliverable = if m_enabled && m_interrupts != 0 {
            m_interrupts
        } else if s_enabled && s_interrupts != 0 {
            s_interrupts
        } else {
            return None;
        };

        INTERRUPT_PRIORITY
            .iter()
            .find(|&&bit| deliverable & bit != 0)
            .and_then(|bit| Trap::from_interrupt(bit.trailing_zeros() as u64))
    }

    /// Take a pending interrupt now. Returns `true` if one was taken.
    pub fn check_interrupts(&mut self) -> bool {
        self.irq_check = false;
        match self.pending_interrupt() {
            Some(irq) => {
                self.trap(irq);
                self.commit_trap()
            }
            None => false,
        }
    }

    /// MRET. `None` means illegal at the current privilege.
    pub(crate) fn mret(&mut self) -> Option<u64> {
        if self.priv_level < PrivilegeLevel::Machine {
            return None;
        }
        let old = self.csr.mstatus;
        let mpp = PrivilegeLevel::from_bits(old >> 11);
        let mut status = with_bit(old, MSTATUS_MIE, old & MSTATUS_MPIE != 0);
        status |= MSTATUS_MPIE;
        status &= !MSTATUS_MPP;
        if mpp != PrivilegeLevel::Machine {
            status &= !MSTATUS_MPRV;
        }
        self.csr.mstatus = status;
        self.set_privilege(mpp);
        if old & MSTATUS_MPRV != 0 {
            self.tlb.flush();
        }
        self.irq_check = true;
        Some(self.xlen_addr(self.csr.mepc))
    }

    /// SRET. Illegal from U-mode, and from S-mode when mstatus.TSR is set.
    pub(crate) fn sret(&mut self) -> Option<u64> {
        match self.priv_level {
            PrivilegeLevel::User => return None,
            PrivilegeLevel::Supervisor if self.csr.mstatus & MSTATUS_TSR != 0 => return None,
            _ => {}
        }
        let old = self.csr.mstatus;
        let spp = if old & MSTATUS_SPP != 0 { PrivilegeLevel::Supervisor } else { PrivilegeLevel::User };
        let mut status = with_bit(old, MSTATUS_SIE, old & MSTATUS_SPIE != 0);
        status |= MSTATUS_SPIE;
        status &= !(MSTATUS_SPP | MSTATUS_MPRV);
        self.csr.mstatus = status;
        self.set_privilege(spp);
        if old & MSTATUS_MPRV != 0 {
            self.tlb.flush();
        }
        self.irq_check = true;
        Some(self.xlen_addr(self.csr.sepc))
    }
}
