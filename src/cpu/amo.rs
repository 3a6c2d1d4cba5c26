//! A extension: LR/SC reservations and read-modify-write AMOs

use super::access::RmwTarget;
use super::mmu::AccessType;
use super::trap::Trap;
use super::Hart;
use crate::memory::AmoOp;

/// An LR reservation: physical address, width and the value LR observed.
/// SC succeeds only if memory still holds `value` at that address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub addr: u64,
    pub value: u64,
    pub size: u32,
}

#[inline]
fn width_mask(size: u32) -> u64 {
    if size == 8 {
        u64::MAX
    } else {
        (1 << (size * 8)) - 1
    }
}

impl Hart {
    fn mmio_read_value(&self, paddr: u64, size: u32) -> Option<u64> {
        let mut buf = [0u8; 8];
        (self.mmio.read(paddr, &mut buf[..size as usize]) == Some(true)).then(|| u64::from_le_bytes(buf))
    }

    fn mmio_write_value(&self, paddr: u64, size: u32, value: u64) -> bool {
        self.mmio.write(paddr, &value.to_le_bytes()[..size as usize]) == Some(true)
    }

    /// LR.W/LR.D. Returns the zero-extended loaded value.
    pub(crate) fn load_reserved(&mut self, vaddr: u64, size: u32) -> Result<u64, Trap> {
        let (addr, value) = match self.rmw_target(vaddr, size, AccessType::Load)? {
            RmwTarget::Ram { paddr, off } => {
                (paddr, self.ram.load(off, size).ok_or(Trap::LoadAccessFault(vaddr))?)
            }
            RmwTarget::Mmio(paddr) => {
                (paddr, self.mmio_read_value(paddr, size).ok_or(Trap::LoadAccessFault(vaddr))?)
            }
            RmwTarget::Void(paddr) => (paddr, 0),
        };
        self.reservation = Some(Reservation { addr, value, size });
        Ok(value)
    }

    /// SC.W/SC.D. `Ok(true)` when the store happened. The reservation is
    /// consumed either way, faults included; a failed SC has no memory
    /// side effects.
    pub(crate) fn store_conditional(&mut self, vaddr: u64, size: u32, value: u64) -> Result<bool, Trap> {
        let reservation = self.reservation.take();
        let target = self.rmw_target(vaddr, size, AccessType::Store)?;
        let Some(reservation) = reservation else {
            return Ok(false);
        };
        let value = value & width_mask(size);
        let matches = |paddr: u64| reservation.addr == paddr && reservation.size == size;

        match target {
            RmwTarget::Ram { paddr, off } => {
                if !matches(paddr) {
                    return Ok(false);
                }
                Ok(self.ram.compare_exchange(off, size, reservation.value, value).is_ok())
            }
            RmwTarget::Mmio(paddr) => {
                if !matches(paddr) {
                    return Ok(false);
                }
                let current = self.mmio_read_value(paddr, size).ok_or(Trap::StoreAccessFault(vaddr))?;
                if current != reservation.value {
                    return Ok(false);
                }
                if !self.mmio_write_value(paddr, size, value) {
                    return Err(Trap::StoreAccessFault(vaddr));
                }
                Ok(true)
            }
            RmwTarget::Void(paddr) => Ok(matches(paddr)),
        }
    }

    /// AMO*.W/AMO*.D. Returns the zero-extended previous value.
    pub(crate) fn amo(&mut self, op: AmoOp, vaddr: u64, size: u32, operand: u64) -> Result<u64, Trap> {
        let operand = operand & width_mask(size);
        match self.rmw_target(vaddr, size, AccessType::Store)? {
            RmwTarget::Ram { paddr, off } => {
                self.break_reservation(paddr, size as u64);
                self.ram.amo(off, size, op, operand).ok_or(Trap::StoreAccessFault(vaddr))
            }
            RmwTarget::Mmio(paddr) => {
                self.break_reservation(paddr, size as u64);
                let old = self.mmio_read_value(paddr, size).ok_or(Trap::StoreAccessFault(vaddr))?;
                let new = op.apply(old, operand, size) & width_mask(size);
                if !self.mmio_write_value(paddr, size, new) {
                    return Err(Trap::StoreAccessFault(vaddr));
                }
                Ok(old)
            }
            RmwTarget::Void(_) => Ok(0),
        }
    }
}
