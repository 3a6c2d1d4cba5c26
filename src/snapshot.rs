//! Machine snapshots
//!
//! Saves hart state plus the non-zero RAM pages, so an idle guest with a
//! large RAM still snapshots small. Devices other than the CLINT (whose
//! state lives in the harts) are not captured.

use serde::{Deserialize, Serialize};

use crate::cpu::csr::CsrBank;
use crate::cpu::mmu::SatpMode;
use crate::cpu::{Hart, PrivilegeLevel};
use crate::error::MachineError;
use crate::memory::GuestMemory;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Architectural state of one hart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HartSnapshot {
    pub pc: u64,
    pub regs: [u64; 32],
    pub fregs: Option<Vec<u64>>,
    pub csr: CsrBank,
    pub privilege: PrivilegeLevel,
    /// Pending interrupt lines (`mip`)
    pub pending: u64,
    pub mtimecmp: u64,
    pub wfi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Version for compatibility checking
    pub version: u32,
    pub rv64: bool,
    pub ram_base: u64,
    pub ram_size: u64,
    /// `mtime` at capture
    pub timer: u64,
    pub harts: Vec<HartSnapshot>,
    /// Non-zero RAM pages as (page index, contents)
    pub pages: Vec<(u64, Vec<u8>)>,
}

impl MachineSnapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, MachineError> {
        let serialized =
            bincode::serialize(self).map_err(|e| MachineError::Snapshot(format!("serialization error: {}", e)))?;
        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| MachineError::Snapshot(format!("compression error: {}", e)))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, MachineError> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| MachineError::Snapshot(format!("decompression error: {}", e)))?;
        let snapshot: MachineSnapshot = bincode::deserialize(&decompressed)
            .map_err(|e| MachineError::Snapshot(format!("deserialization error: {}", e)))?;
        if snapshot.version != Self::VERSION {
            return Err(MachineError::Snapshot(format!("unsupported version {}", snapshot.version)));
        }
        Ok(snapshot)
    }

    /// Copy every non-zero page of `ram`.
    pub(crate) fn capture_pages(ram: &GuestMemory) -> Vec<(u64, Vec<u8>)> {
        let mut pages = Vec::new();
        for page in 0..ram.size() >> PAGE_SHIFT {
            if ram.page_is_zero(page) {
                continue;
            }
            let mut data = vec![0u8; PAGE_SIZE as usize];
            if ram.read(page << PAGE_SHIFT, &mut data) {
                pages.push((page, data));
            }
        }
        pages
    }

    /// Replace RAM contents with the captured pages.
    pub(crate) fn restore_pages(&self, ram: &GuestMemory) -> Result<(), MachineError> {
        ram.clear();
        for (page, data) in &self.pages {
            if data.len() as u64 != PAGE_SIZE || !ram.write(page << PAGE_SHIFT, data) {
                return Err(MachineError::Snapshot(format!("bad page {:#x}", page)));
            }
        }
        Ok(())
    }
}

impl Hart {
    pub fn save_state(&self) -> HartSnapshot {
        HartSnapshot {
            pc: self.pc,
            regs: self.regs,
            fregs: self.fregs.as_ref().map(|f| f.to_vec()),
            csr: self.csr.clone(),
            privilege: self.priv_level,
            pending: self.shared.pending(),
            mtimecmp: self.shared.mtimecmp(),
            wfi: self.wfi,
        }
    }

    /// Load saved state. Translations, blocks and the reservation are
    /// dropped; they are rebuilt from the restored state.
    pub fn restore_state(&mut self, snap: &HartSnapshot) -> Result<(), MachineError> {
        if snap.fregs.is_some() != self.fregs.is_some() {
            return Err(MachineError::Snapshot(format!("hart {}: FPU configuration differs", self.id())));
        }
        if let (Some(dst), Some(src)) = (self.fregs.as_mut(), snap.fregs.as_ref()) {
            if src.len() != 32 {
                return Err(MachineError::Snapshot(format!("hart {}: bad FP register file", self.id())));
            }
            dst.copy_from_slice(src);
        }
        self.pc = snap.pc;
        self.regs = snap.regs;
        self.regs[0] = 0;
        self.csr = snap.csr.clone();
        self.priv_level = snap.privilege;
        self.mmu_mode = SatpMode::from_satp(self.csr.satp, &self.caps).unwrap_or(SatpMode::Bare);
        self.wfi = snap.wfi;
        self.shared.set_pending(snap.pending);
        self.shared.set_mtimecmp(snap.mtimecmp);

        self.tlb.flush();
        self.blocks.invalidate_all();
        self.builder = None;
        self.reservation = None;
        self.trap_pending = false;
        self.irq_check = true;
        self.code_epoch = self.ram.code_epoch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testutil;

    #[test]
    fn test_hart_state_round_trip() {
        let mut hart = testutil::rv64();
        hart.pc = 0x8000_1234;
        hart.regs[5] = 42;
        hart.csr.mscratch = 7;
        hart.set_privilege(PrivilegeLevel::Supervisor);
        hart.shared.raise_interrupt(1 << 9);
        let saved = hart.save_state();

        let mut other = testutil::rv64();
        other.restore_state(&saved).unwrap();
        assert_eq!(other.pc, 0x8000_1234);
        assert_eq!(other.regs[5], 42);
        assert_eq!(other.csr.mscratch, 7);
        assert_eq!(other.privilege(), PrivilegeLevel::Supervisor);
        assert_eq!(other.shared.pending(), 1 << 9);
        assert_eq!(other.save_state(), saved);
    }

    #[test]
    fn test_fpu_mismatch_rejected() {
        let hart = testutil::rv64();
        let saved = HartSnapshot { fregs: Some(vec![0; 32]), ..hart.save_state() };
        let mut other = testutil::rv64();
        assert!(matches!(other.restore_state(&saved), Err(MachineError::Snapshot(_))));
    }

    #[test]
    fn test_pages_and_bytes() {
        let ram = GuestMemory::new(0x8000_0000, 4 * PAGE_SIZE).unwrap();
        assert!(ram.write_u64(0x8000_2008, 0xDEAD_BEEF));
        let snapshot = MachineSnapshot {
            version: MachineSnapshot::VERSION,
            rv64: true,
            ram_base: ram.base(),
            ram_size: ram.size(),
            timer: 99,
            harts: Vec::new(),
            pages: MachineSnapshot::capture_pages(&ram),
        };
        assert_eq!(snapshot.pages.len(), 1);
        assert_eq!(snapshot.pages[0].0, 2);

        let bytes = snapshot.to_bytes().unwrap();
        let decoded = MachineSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, snapshot);

        assert!(ram.write_u64(0x8000_0000, 1));
        decoded.restore_pages(&ram).unwrap();
        assert_eq!(ram.read_u64(0x8000_0000), Some(0));
        assert_eq!(ram.read_u64(0x8000_2008), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(MachineSnapshot::from_bytes(b"not a snapshot").is_err());
    }
}
