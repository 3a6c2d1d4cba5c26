//! Sv32/Sv39/Sv48/Sv57 page-table walker
//!
//! One generic walker, parameterized by [`SatpMode`]. It runs only on a TLB
//! miss; the fast path lives in `access.rs`.

use log::trace;
use serde::{Deserialize, Serialize};

use super::csr::{MSTATUS_MXR, MSTATUS_SUM};
use super::trap::Trap;
use super::{Hart, PrivilegeLevel};
use crate::config::HartCaps;
use crate::PAGE_SHIFT;

/// Access type for translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

// PTE bits
pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_G: u64 = 1 << 5;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

/// Address translation scheme selected by satp.MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SatpMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

impl SatpMode {
    /// Decode satp.MODE. `None` for modes this hart does not implement.
    pub fn from_satp(satp: u64, caps: &HartCaps) -> Option<Self> {
        if !caps.rv64 {
            return Some(if satp & (1 << 31) != 0 { SatpMode::Sv32 } else { SatpMode::Bare });
        }
        match satp >> 60 {
            0 => Some(SatpMode::Bare),
            8 => Some(SatpMode::Sv39),
            9 if caps.sv48 => Some(SatpMode::Sv48),
            10 if caps.sv57 => Some(SatpMode::Sv57),
            _ => None,
        }
    }

    pub fn levels(self) -> u32 {
        match self {
            SatpMode::Bare => 0,
            SatpMode::Sv32 => 2,
            SatpMode::Sv39 => 3,
            SatpMode::Sv48 => 4,
            SatpMode::Sv57 => 5,
        }
    }

    /// VPN bits per level
    pub fn vpn_bits(self) -> u32 {
        if self == SatpMode::Sv32 {
            10
        } else {
            9
        }
    }

    pub fn pte_size(self) -> u64 {
        if self == SatpMode::Sv32 {
            4
        } else {
            8
        }
    }

    pub fn va_bits(self) -> u32 {
        PAGE_SHIFT + self.levels() * self.vpn_bits()
    }

    fn ppn_mask(self) -> u64 {
        if self == SatpMode::Sv32 {
            (1 << 22) - 1
        } else {
            (1 << 44) - 1
        }
    }

    fn root(self, satp: u64) -> u64 {
        (satp & self.ppn_mask()) << PAGE_SHIFT
    }
}

/// Leaf permission check for an access at privilege `level`.
fn leaf_permits(pte: u64, access: AccessType, level: PrivilegeLevel, status: u64) -> bool {
    let user_page = pte & PTE_U != 0;
    match level {
        PrivilegeLevel::User if !user_page => return false,
        // S-mode never executes user pages; data needs SUM
        PrivilegeLevel::Supervisor
            if user_page && (access == AccessType::Instruction || status & MSTATUS_SUM == 0) =>
        {
            return false
        }
        _ => {}
    }
    match access {
        AccessType::Instruction => pte & PTE_X != 0,
        AccessType::Load => pte & PTE_R != 0 || (pte & PTE_X != 0 && status & MSTATUS_MXR != 0),
        AccessType::Store => pte & PTE_W != 0,
    }
}

impl Hart {
    /// Walk the guest page tables for `vaddr` as privilege `level` would
    /// see them, setting A (and D for stores) in the leaf. Returns the
    /// physical address.
    pub(crate) fn walk(&mut self, vaddr: u64, access: AccessType, level: PrivilegeLevel) -> Result<u64, Trap> {
        let mode = self.mmu_mode;
        let page_fault = Trap::page_fault(access, vaddr);

        if mode != SatpMode::Sv32 {
            // bits above the VA width must copy the top VA bit
            let unused = 64 - mode.va_bits();
            if (((vaddr << unused) as i64) >> unused) as u64 != vaddr {
                return Err(page_fault);
            }
        }

        let vpn_bits = mode.vpn_bits();
        let pte_size = mode.pte_size();
        let pte_bytes = pte_size as u32;
        let status = self.csr.mstatus;
        let mut table = mode.root(self.csr.satp);

        for depth in (0..mode.levels()).rev() {
            let shift = PAGE_SHIFT + depth * vpn_bits;
            let index = (vaddr >> shift) & ((1 << vpn_bits) - 1);
            let pte_addr = table + index * pte_size;
            let Some(off) = self.ram.offset_of(pte_addr, pte_size) else {
                trace!("hart {}: PTE {:#x} outside RAM", self.id(), pte_addr);
                return Err(Trap::access_fault(access, vaddr));
            };

            // retried only when another hart changes the PTE under us
            table = loop {
                self.stats.pt_reads += 1;
                let pte = self.ram.load(off, pte_bytes).ok_or(Trap::access_fault(access, vaddr))?;

                if pte & PTE_V == 0 || (pte & PTE_W != 0 && pte & PTE_R == 0) {
                    return Err(page_fault);
                }
                // reserved, PBMT and N bits
                if mode != SatpMode::Sv32 && pte >> 54 != 0 {
                    return Err(page_fault);
                }
                let ppn = (pte >> 10) & mode.ppn_mask();

                if pte & (PTE_R | PTE_X) == 0 {
                    // A, D and U are reserved in pointers; a set one is malformed
                    if depth == 0 || pte & (PTE_A | PTE_D | PTE_U) != 0 {
                        return Err(page_fault);
                    }
                    break ppn << PAGE_SHIFT;
                }

                if !leaf_permits(pte, access, level, status) {
                    return Err(page_fault);
                }
                let superpage_ppn_mask = (1u64 << (depth * vpn_bits)) - 1;
                if ppn & superpage_ppn_mask != 0 {
                    return Err(page_fault);
                }

                let want = PTE_A | if access == AccessType::Store { PTE_D } else { 0 };
                if pte & want != want && self.ram.compare_exchange(off, pte_bytes, pte, pte | want).is_err() {
                    continue;
                }

                let offset_mask = (1u64 << shift) - 1;
                let paddr = ((ppn << PAGE_SHIFT) & !offset_mask) | (vaddr & offset_mask);
                trace!(
                    "hart {}: {:?} {:#x} -> {:#x} (level {}, pte {:#x})",
                    self.id(),
                    access,
                    vaddr,
                    paddr,
                    depth,
                    pte | want
                );
                return Ok(paddr);
            };
        }
        Err(page_fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testutil;

    const ROOT: u64 = 0x8001_0000;
    const L1: u64 = 0x8001_1000;
    const L0: u64 = 0x8001_2000;

    fn pointer(table: u64) -> u64 {
        ((table >> 12) << 10) | PTE_V
    }

    fn leaf(pa: u64, flags: u64) -> u64 {
        ((pa >> 12) << 10) | flags | PTE_V
    }

    /// Sv39: VA 0x1000 -> PA 0x8002_0000, VA 0x4000_0000 -> gigapage at 0x8000_0000
    fn sv39_hart(l0_flags: u64) -> Hart {
        let mut hart = testutil::rv64();
        hart.ram.write_u64(ROOT, pointer(L1));
        hart.ram.write_u64(ROOT + 8, leaf(0x8000_0000, PTE_R | PTE_W | PTE_X));
        hart.ram.write_u64(L1, pointer(L0));
        hart.ram.write_u64(L0 + 8, leaf(0x8002_0000, l0_flags));
        hart.csr.satp = 8 << 60 | (ROOT >> 12);
        hart.mmu_mode = SatpMode::Sv39;
        hart
    }

    #[test]
    fn test_mode_decoding() {
        let caps = HartCaps::from(&crate::MachineConfig::default());
        assert_eq!(SatpMode::from_satp(8 << 60, &caps), Some(SatpMode::Sv39));
        assert_eq!(SatpMode::from_satp(9 << 60, &caps), Some(SatpMode::Sv48));
        assert_eq!(SatpMode::from_satp(10 << 60, &caps), None);
        assert_eq!(SatpMode::from_satp(1 << 60, &caps), None);
        assert_eq!(SatpMode::Sv32.va_bits(), 32);
        assert_eq!(SatpMode::Sv57.va_bits(), 57);
    }

    #[test]
    fn test_walk_4k_and_gigapage() {
        let mut hart = sv39_hart(PTE_R | PTE_W);
        let pa = hart.walk(0x1234, AccessType::Load, PrivilegeLevel::Supervisor).unwrap();
        assert_eq!(pa, 0x8002_0234);
        let pa = hart.walk(0x4001_2345, AccessType::Instruction, PrivilegeLevel::Supervisor).unwrap();
        assert_eq!(pa, 0x8001_2345);
        assert_eq!(hart.stats().pt_reads, 4);
    }

    #[test]
    fn test_accessed_dirty_bits() {
        let mut hart = sv39_hart(PTE_R | PTE_W);
        hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor).unwrap();
        let pte = hart.ram.read_u64(L0 + 8).unwrap();
        assert_eq!(pte & (PTE_A | PTE_D), PTE_A);
        hart.walk(0x1000, AccessType::Store, PrivilegeLevel::Supervisor).unwrap();
        let pte = hart.ram.read_u64(L0 + 8).unwrap();
        assert_eq!(pte & (PTE_A | PTE_D), PTE_A | PTE_D);
    }

    #[test]
    fn test_permission_faults() {
        let mut hart = sv39_hart(PTE_R | PTE_X | PTE_U);
        assert_eq!(
            hart.walk(0x1000, AccessType::Store, PrivilegeLevel::User),
            Err(Trap::StorePageFault(0x1000))
        );
        assert!(hart.walk(0x1000, AccessType::Load, PrivilegeLevel::User).is_ok());
        // user page from S-mode needs SUM, and is never executable
        assert_eq!(
            hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor),
            Err(Trap::LoadPageFault(0x1000))
        );
        hart.csr.mstatus |= MSTATUS_SUM;
        assert!(hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor).is_ok());
        assert_eq!(
            hart.walk(0x1000, AccessType::Instruction, PrivilegeLevel::Supervisor),
            Err(Trap::InstructionPageFault(0x1000))
        );
        // supervisor pages are invisible to U-mode
        assert!(hart.walk(0x4000_0000, AccessType::Load, PrivilegeLevel::User).is_err());
    }

    #[test]
    fn test_mxr() {
        let mut hart = sv39_hart(PTE_X);
        assert!(hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor).is_err());
        hart.csr.mstatus |= MSTATUS_MXR;
        assert!(hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor).is_ok());
    }

    #[test]
    fn test_pointer_with_reserved_bits_faults() {
        for bit in [PTE_A, PTE_D, PTE_U] {
            let mut hart = sv39_hart(PTE_R);
            hart.ram.write_u64(L1, pointer(L0) | bit);
            assert_eq!(
                hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor),
                Err(Trap::LoadPageFault(0x1000))
            );
        }
        let mut hart = sv39_hart(PTE_R);
        assert!(hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor).is_ok());
    }

    #[test]
    fn test_malformed_tables() {
        // W without R
        let mut hart = sv39_hart(PTE_W);
        assert!(hart.walk(0x1000, AccessType::Store, PrivilegeLevel::Supervisor).is_err());

        // misaligned megapage
        let mut hart = sv39_hart(PTE_R);
        hart.ram.write_u64(L1, leaf(0x8000_1000, PTE_R));
        assert_eq!(
            hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor),
            Err(Trap::LoadPageFault(0x1000))
        );

        // non-canonical address
        let mut hart = sv39_hart(PTE_R);
        assert!(hart.walk(0x0000_8000_0000_1000, AccessType::Load, PrivilegeLevel::Supervisor).is_err());
        assert!(hart.walk(0xFFFF_FFC0_0000_0000, AccessType::Load, PrivilegeLevel::Supervisor).is_err());

        // root table outside RAM
        let mut hart = sv39_hart(PTE_R);
        hart.csr.satp = 8 << 60 | 0x10;
        assert_eq!(
            hart.walk(0x1000, AccessType::Load, PrivilegeLevel::Supervisor),
            Err(Trap::LoadAccessFault(0x1000))
        );
    }
}
