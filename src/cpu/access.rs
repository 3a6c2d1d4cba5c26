//! Guest memory access paths: translate, load, store, fetch
//!
//! Everything funnels through [`Hart::translate`]. A TLB hit returns the
//! physical address without touching the page tables; a miss walks them
//! and caches the result if the page is RAM. Device pages are never cached,
//! so every MMIO access goes back through the dispatcher.

use log::debug;

use super::compressed::expand_compressed;
use super::csr::MSTATUS_MPRV;
use super::decode::Fetched;
use super::mmu::{AccessType, SatpMode};
use super::trap::Trap;
use super::{Hart, PrivilegeLevel};
use crate::config::UnmappedPolicy;
use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Where an atomic read-modify-write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RmwTarget {
    /// RAM at offset `off`
    Ram { paddr: u64, off: u64 },
    /// A device; the operation goes through the bounce buffer
    Mmio(u64),
    /// Nothing there, and the unmapped policy says read zero/drop writes
    Void(u64),
}

impl Hart {
    /// Privilege used for translation: loads and stores in M-mode take
    /// mstatus.MPP when MPRV is set.
    #[inline]
    fn effective_privilege(&self, access: AccessType) -> PrivilegeLevel {
        if access != AccessType::Instruction
            && self.priv_level == PrivilegeLevel::Machine
            && self.csr.mstatus & MSTATUS_MPRV != 0
        {
            PrivilegeLevel::from_bits(self.csr.mstatus >> 11)
        } else {
            self.priv_level
        }
    }

    /// Virtual to physical.
    #[inline(always)]
    pub fn translate(&mut self, vaddr: u64, access: AccessType) -> Result<u64, Trap> {
        let vaddr = self.xlen_addr(vaddr);
        if let Some(host) = self.tlb.lookup(vaddr >> PAGE_SHIFT, access) {
            self.stats.tlb_hits += 1;
            return Ok(self.ram.base() + host + (vaddr & PAGE_MASK));
        }
        self.stats.tlb_misses += 1;
        self.translate_slow(vaddr, access)
    }

    #[cold]
    fn translate_slow(&mut self, vaddr: u64, access: AccessType) -> Result<u64, Trap> {
        let level = self.effective_privilege(access);
        let paddr = if level == PrivilegeLevel::Machine || self.mmu_mode == SatpMode::Bare {
            vaddr
        } else {
            self.walk(vaddr, access, level)?
        };

        if paddr >> self.caps.phys_bits != 0 && !self.ram.contains(paddr, 1) {
            debug!("hart {}: {:?} {:#x} outside the physical address space", self.id(), access, paddr);
            return Err(Trap::access_fault(access, vaddr));
        }
        if let Some(host) = self.ram.offset_of(paddr & !PAGE_MASK, PAGE_SIZE) {
            self.tlb.insert(vaddr >> PAGE_SHIFT, access, host);
        }
        Ok(paddr)
    }

    /// Apply the unmapped-address policy to an access that hit nothing.
    fn unmapped(&self, access: AccessType, vaddr: u64, paddr: u64) -> Result<(), Trap> {
        match self.caps.unmapped_policy {
            UnmappedPolicy::Fault => {
                debug!("hart {}: {:?} to unmapped {:#x} (pc={:#x})", self.id(), access, paddr, self.pc);
                Err(Trap::access_fault(access, vaddr))
            }
            UnmappedPolicy::ZeroDiscard => Ok(()),
        }
    }

    /// Read physical memory that is known not to cross a page.
    fn phys_read(&self, paddr: u64, buf: &mut [u8], vaddr: u64) -> Result<(), Trap> {
        if let Some(off) = self.ram.offset_of(paddr, buf.len() as u64) {
            self.ram.read(off, buf);
            return Ok(());
        }
        match self.mmio.read(paddr, buf) {
            Some(true) => Ok(()),
            Some(false) => Err(Trap::LoadAccessFault(vaddr)),
            None => {
                buf.fill(0);
                self.unmapped(AccessType::Load, vaddr, paddr)
            }
        }
    }

    fn phys_write(&self, paddr: u64, buf: &[u8], vaddr: u64) -> Result<(), Trap> {
        if let Some(off) = self.ram.offset_of(paddr, buf.len() as u64) {
            self.ram.write(off, buf);
            return Ok(());
        }
        match self.mmio.write(paddr, buf) {
            Some(true) => Ok(()),
            Some(false) => Err(Trap::StoreAccessFault(vaddr)),
            None => self.unmapped(AccessType::Store, vaddr, paddr),
        }
    }

    /// Can `len` bytes be written at `paddr` without faulting? `Ok(true)`
    /// for RAM, `Ok(false)` for a device or a discarded write.
    fn store_target(&self, paddr: u64, len: u64, vaddr: u64) -> Result<bool, Trap> {
        if self.ram.contains(paddr, len) {
            return Ok(true);
        }
        match self.mmio.find(paddr) {
            Some(dev) if paddr + len <= dev.base + dev.size => Ok(false),
            Some(_) => Err(Trap::StoreAccessFault(vaddr)),
            None => self.unmapped(AccessType::Store, vaddr, paddr).map(|()| false),
        }
    }

    /// Load `size` (1/2/4/8) bytes, zero-extended. Misaligned accesses are
    /// allowed and split at page boundaries.
    ///
    /// A fault on the second half of a split access (load or store)
    /// reports the first byte of that half, the start of the next page,
    /// as the trap value.
    pub fn load(&mut self, vaddr: u64, size: u32) -> Result<u64, Trap> {
        let vaddr = self.xlen_addr(vaddr);
        let in_page = PAGE_SIZE - (vaddr & PAGE_MASK);
        let mut buf = [0u8; 8];

        if size as u64 <= in_page {
            let paddr = self.translate(vaddr, AccessType::Load)?;
            if let Some(value) = self.ram.offset_of(paddr, size as u64).and_then(|off| self.ram.load(off, size)) {
                return Ok(value);
            }
            self.phys_read(paddr, &mut buf[..size as usize], vaddr)?;
            return Ok(u64::from_le_bytes(buf));
        }

        let split = in_page as usize;
        let next = self.xlen_addr(vaddr.wrapping_add(in_page));
        let lo = self.translate(vaddr, AccessType::Load)?;
        let hi = self.translate(next, AccessType::Load)?;
        self.phys_read(lo, &mut buf[..split], vaddr)?;
        self.phys_read(hi, &mut buf[split..size as usize], next)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Store the low `size` bytes of `value`. Both halves of a page-crossing
    /// store are translated and resolved before either is written. Device
    /// halves go first, so a device that refuses the write leaves RAM alone.
    pub fn store(&mut self, vaddr: u64, size: u32, value: u64) -> Result<(), Trap> {
        let vaddr = self.xlen_addr(vaddr);
        let in_page = PAGE_SIZE - (vaddr & PAGE_MASK);

        if size as u64 <= in_page {
            let paddr = self.translate(vaddr, AccessType::Store)?;
            self.break_reservation(paddr, size as u64);
            if let Some(off) = self.ram.offset_of(paddr, size as u64) {
                if self.ram.store(off, size, value) {
                    return Ok(());
                }
            }
            return self.phys_write(paddr, &value.to_le_bytes()[..size as usize], vaddr);
        }

        let split = in_page as usize;
        let next = self.xlen_addr(vaddr.wrapping_add(in_page));
        let lo = self.translate(vaddr, AccessType::Store)?;
        let hi = self.translate(next, AccessType::Store)?;
        let lo_ram = self.store_target(lo, in_page, vaddr)?;
        let hi_ram = self.store_target(hi, size as u64 - in_page, next)?;
        self.break_reservation(lo, in_page);
        self.break_reservation(hi, size as u64 - in_page);

        let bytes = value.to_le_bytes();
        let halves = [(lo, &bytes[..split], vaddr, lo_ram), (hi, &bytes[split..size as usize], next, hi_ram)];
        for &(paddr, buf, va, _) in halves.iter().filter(|h| !h.3) {
            self.phys_write(paddr, buf, va)?;
        }
        for &(paddr, buf, va, _) in halves.iter().filter(|h| h.3) {
            self.phys_write(paddr, buf, va)?;
        }
        Ok(())
    }

    /// A store by this hart kills its own reservation if it overlaps.
    #[inline]
    pub(crate) fn break_reservation(&mut self, paddr: u64, len: u64) {
        if let Some(r) = self.reservation {
            if paddr < r.addr + r.size as u64 && r.addr < paddr + len {
                self.reservation = None;
            }
        }
    }

    fn fetch_half(&mut self, vaddr: u64) -> Result<u16, Trap> {
        let paddr = self.translate(vaddr, AccessType::Instruction)?;
        if let Some(off) = self.ram.offset_of(paddr, 2) {
            return self.ram.load(off, 2).map(|v| v as u16).ok_or(Trap::InstructionAccessFault(vaddr));
        }
        // execute-in-place from a device (boot ROM)
        let mut buf = [0u8; 2];
        match self.mmio.read(paddr, &mut buf) {
            Some(true) => Ok(u16::from_le_bytes(buf)),
            _ => Err(Trap::InstructionAccessFault(vaddr)),
        }
    }

    /// Fetch the instruction at pc. The two halves of a 32-bit instruction
    /// are fetched separately; a fault on the second reports pc+2.
    pub fn fetch(&mut self) -> Result<Fetched, Trap> {
        let pc = self.pc;
        if pc & 1 != 0 {
            return Err(Trap::InstructionAddressMisaligned(pc));
        }
        let lo = self.fetch_half(pc)?;
        if lo & 3 != 3 {
            let inst = expand_compressed(lo, self.caps.rv64).ok_or(Trap::IllegalInstruction(lo as u64))?;
            return Ok(Fetched { inst, raw: lo as u32, len: 2 });
        }
        let hi = self.fetch_half(self.xlen_addr(pc.wrapping_add(2)))?;
        let raw = lo as u32 | (hi as u32) << 16;
        Ok(Fetched { inst: raw, raw, len: 4 })
    }

    /// Resolve the target of an atomic. Alignment is checked before
    /// translation; the access never spans pages.
    pub(crate) fn rmw_target(&mut self, vaddr: u64, size: u32, access: AccessType) -> Result<RmwTarget, Trap> {
        let vaddr = self.xlen_addr(vaddr);
        if vaddr & (size as u64 - 1) != 0 {
            return Err(Trap::misaligned(access, vaddr));
        }
        let paddr = self.translate(vaddr, access)?;
        if let Some(off) = self.ram.offset_of(paddr, size as u64) {
            return Ok(RmwTarget::Ram { paddr, off });
        }
        if self.mmio.find(paddr).is_some() {
            return Ok(RmwTarget::Mmio(paddr));
        }
        self.unmapped(access, vaddr, paddr)?;
        Ok(RmwTarget::Void(paddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testutil;
    use crate::memory::mmio::{MmioBus, MmioDevice, MmioHandler};
    use crate::{GuestMemory, MachineConfig};
    use std::sync::{Arc, Mutex};

    struct Scratch(Mutex<[u8; 16]>);

    impl MmioHandler for Scratch {
        fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
            let regs = self.0.lock().unwrap();
            buf.copy_from_slice(&regs[offset as usize..offset as usize + buf.len()]);
            true
        }

        fn write(&self, offset: u64, buf: &[u8]) -> bool {
            let mut regs = self.0.lock().unwrap();
            regs[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
            true
        }
    }

    #[test]
    fn test_bare_load_store() {
        let mut hart = testutil::rv64();
        hart.store(0x8000_0100, 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(hart.load(0x8000_0100, 8), Ok(0x1122_3344_5566_7788));
        assert_eq!(hart.load(0x8000_0101, 2), Ok(0x6677));
        // second access hits the TLB
        let misses = hart.stats().tlb_misses;
        hart.load(0x8000_0108, 4).unwrap();
        assert_eq!(hart.stats().tlb_misses, misses);
    }

    #[test]
    fn test_page_crossing_in_bare_mode() {
        let mut hart = testutil::rv64();
        hart.store(0x8000_0FFE, 4, 0xAABB_CCDD).unwrap();
        assert_eq!(hart.load(0x8000_0FFE, 2), Ok(0xCCDD));
        assert_eq!(hart.load(0x8000_1000, 2), Ok(0xAABB));
        assert_eq!(hart.load(0x8000_0FFE, 4), Ok(0xAABB_CCDD));
    }

    #[test]
    fn test_unmapped_policy() {
        let mut hart = testutil::rv64();
        assert_eq!(hart.load(0x1000, 4), Err(Trap::LoadAccessFault(0x1000)));
        assert_eq!(hart.store(0x1000, 4, 1), Err(Trap::StoreAccessFault(0x1000)));

        let cfg = MachineConfig {
            ram_size: 1 << 20,
            unmapped_policy: UnmappedPolicy::ZeroDiscard,
            ..Default::default()
        };
        let mut hart = testutil::hart(&cfg);
        assert_eq!(hart.load(0x1000, 4), Ok(0));
        assert_eq!(hart.store(0x1000, 4, 1), Ok(()));
        // outside the physical envelope it is always a fault
        assert_eq!(hart.load(1 << 60, 4), Err(Trap::LoadAccessFault(1 << 60)));
    }

    struct ReadOnly;

    impl MmioHandler for ReadOnly {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> bool {
            buf.fill(0);
            true
        }

        fn write(&self, _offset: u64, _buf: &[u8]) -> bool {
            false
        }
    }

    #[test]
    fn test_split_store_faulting_second_half_writes_nothing() {
        let mut hart = testutil::rv64();
        let end = hart.ram.base() + hart.ram.size();
        hart.store(end - 4, 4, 0x5555_5555).unwrap();

        // nothing mapped past the end of RAM
        assert_eq!(hart.store(end - 4, 8, 0x1111_2222_3333_4444), Err(Trap::StoreAccessFault(end)));
        assert_eq!(hart.load(end - 4, 4), Ok(0x5555_5555));

        // a device there that refuses the write
        let dev = MmioDevice::new("rom", end, 0x1000, Arc::new(ReadOnly));
        hart.set_mmio(Arc::new(MmioBus::new().with_device(dev).unwrap()));
        assert_eq!(hart.store(end - 4, 8, 0x1111_2222_3333_4444), Err(Trap::StoreAccessFault(end)));
        assert_eq!(hart.load(end - 4, 4), Ok(0x5555_5555));
    }

    #[test]
    fn test_mmio_access() {
        let mut hart = testutil::rv64();
        let dev = MmioDevice::new("scratch", 0x1000_0000, 16, Arc::new(Scratch(Mutex::new([0; 16]))));
        hart.set_mmio(Arc::new(MmioBus::new().with_device(dev).unwrap()));
        hart.store(0x1000_0004, 4, 0xCAFE_F00D).unwrap();
        assert_eq!(hart.load(0x1000_0004, 4), Ok(0xCAFE_F00D));
        assert_eq!(hart.load(0x1000_0006, 1), Ok(0xFE));
        // device pages are never cached
        let misses = hart.stats().tlb_misses;
        hart.load(0x1000_0004, 4).unwrap();
        assert_eq!(hart.stats().tlb_misses, misses + 1);
    }

    #[test]
    fn test_fetch_compressed_and_full() {
        let mut hart = testutil::rv64();
        // c.li a0, 1 ; addi a1, zero, 2
        hart.ram.write(0, &[0x05, 0x45, 0x93, 0x05, 0x20, 0x00]);
        let f = hart.fetch().unwrap();
        assert_eq!(f.len, 2);
        assert_eq!(f.inst, 0x0010_0513);
        hart.pc += 2;
        let f = hart.fetch().unwrap();
        assert_eq!(f.len, 4);
        assert_eq!(f.inst, 0x0020_0593);
    }

    #[test]
    fn test_fetch_second_half_fault() {
        let mut hart = testutil::rv64();
        let end = hart.ram.base() + hart.ram.size();
        // 32-bit opcode in the last halfword of RAM
        hart.ram.write(hart.ram.size() - 2, &[0x93, 0x05]);
        hart.pc = end - 2;
        assert_eq!(hart.fetch(), Err(Trap::InstructionAccessFault(end)));
    }

    #[test]
    fn test_rmw_target() {
        let mut hart = testutil::rv64();
        assert_eq!(
            hart.rmw_target(0x8000_0004, 8, AccessType::Store),
            Err(Trap::StoreAddressMisaligned(0x8000_0004))
        );
        assert_eq!(
            hart.rmw_target(0x8000_0008, 8, AccessType::Store),
            Ok(RmwTarget::Ram { paddr: 0x8000_0008, off: 8 })
        );
        let rom = Arc::new(GuestMemory::new(0x2000_0000, 0x1000).unwrap());
        let bus = MmioBus::new().with_device(MmioDevice::direct("rom", 0x2000_0000, rom)).unwrap();
        hart.set_mmio(Arc::new(bus));
        assert_eq!(hart.rmw_target(0x2000_0000, 4, AccessType::Load), Ok(RmwTarget::Mmio(0x2000_0000)));
    }

    #[test]
    fn test_mprv_uses_mpp() {
        let mut hart = testutil::rv64();
        // Sv39 with an empty root table: every translated access faults
        hart.csr.satp = 8 << 60 | (0x8001_0000 >> 12);
        hart.mmu_mode = SatpMode::Sv39;
        assert!(hart.load(0x8000_0000, 4).is_ok());
        hart.write_mstatus(MSTATUS_MPRV | (1 << 11));
        assert_eq!(hart.load(0x8000_0000, 4), Err(Trap::LoadPageFault(0x8000_0000)));
        // fetches ignore MPRV: zeroed RAM decodes as an illegal instruction
        assert_eq!(hart.fetch(), Err(Trap::IllegalInstruction(0)));
    }
}
