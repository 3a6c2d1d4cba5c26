//! CLINT - Core Local Interruptor
//!
//! Per-hart software interrupt and timer compare registers plus the shared
//! `mtime`. State lives in each hart's [`HartShared`] so harts can evaluate
//! their own timer without going through MMIO.

use std::sync::Arc;

use crate::cpu::csr::{MIP_MSIP, MIP_MTIP};
use crate::cpu::HartShared;
use crate::memory::mmio::{MmioDevice, MmioHandler};
use crate::timer::MachineTimer;

// CLINT memory map (relative to base)
const MSIP_BASE: u64 = 0x0000; // Machine Software Interrupt Pending, 4 bytes/hart
const MTIMECMP_BASE: u64 = 0x4000; // Machine Timer Compare, 8 bytes/hart
const MTIME_BASE: u64 = 0xBFF8; // Machine Timer

pub const CLINT_SIZE: u64 = 0x10000;

pub struct Clint {
    harts: Vec<Arc<HartShared>>,
    timer: Arc<MachineTimer>,
}

impl Clint {
    pub fn new(harts: Vec<Arc<HartShared>>, timer: Arc<MachineTimer>) -> Self {
        Clint { harts, timer }
    }

    /// Wrap into a bus device at `base`.
    pub fn into_device(self, base: u64) -> MmioDevice {
        MmioDevice::new("clint", base, CLINT_SIZE, Arc::new(self)).with_op_sizes(4, 8)
    }

    fn hart(&self, offset: u64, base: u64, stride: u64) -> Option<&HartShared> {
        let idx = (offset - base) / stride;
        self.harts.get(idx as usize).map(|h| h.as_ref())
    }

    fn msip_range(&self) -> u64 {
        MSIP_BASE + 4 * self.harts.len() as u64
    }

    fn mtimecmp_range(&self) -> u64 {
        MTIMECMP_BASE + 8 * self.harts.len() as u64
    }

    pub fn read32(&self, offset: u64) -> u32 {
        match offset {
            o if o < self.msip_range() => {
                self.hart(o, MSIP_BASE, 4).map_or(0, |h| (h.pending() & MIP_MSIP != 0) as u32)
            }
            o if (MTIMECMP_BASE..self.mtimecmp_range()).contains(&o) => {
                let cmp = self.hart(o, MTIMECMP_BASE, 8).map_or(0, |h| h.mtimecmp());
                if o & 4 == 0 {
                    cmp as u32
                } else {
                    (cmp >> 32) as u32
                }
            }
            MTIME_BASE => self.timer.now() as u32,
            o if o == MTIME_BASE + 4 => (self.timer.now() >> 32) as u32,
            _ => 0,
        }
    }

    pub fn write32(&self, offset: u64, value: u32) {
        match offset {
            o if o < self.msip_range() => {
                if let Some(h) = self.hart(o, MSIP_BASE, 4) {
                    if value & 1 != 0 {
                        h.raise_interrupt(MIP_MSIP);
                    } else {
                        h.clear_interrupt(MIP_MSIP);
                    }
                }
            }
            o if (MTIMECMP_BASE..self.mtimecmp_range()).contains(&o) => {
                if let Some(h) = self.hart(o, MTIMECMP_BASE, 8) {
                    let cmp = h.mtimecmp();
                    let cmp = if o & 4 == 0 {
                        (cmp & 0xFFFF_FFFF_0000_0000) | value as u64
                    } else {
                        (cmp & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32)
                    };
                    self.store_mtimecmp(h, cmp);
                }
            }
            MTIME_BASE => {
                let now = self.timer.now();
                self.timer.set((now & 0xFFFF_FFFF_0000_0000) | value as u64);
                self.kick_all();
            }
            o if o == MTIME_BASE + 4 => {
                let now = self.timer.now();
                self.timer.set((now & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32));
                self.kick_all();
            }
            _ => {}
        }
    }

    /// A new compare value takes effect at once: MTIP follows `mtime >= mtimecmp`.
    fn store_mtimecmp(&self, hart: &HartShared, value: u64) {
        hart.set_mtimecmp(value);
        if self.timer.now() >= value {
            hart.raise_interrupt(MIP_MTIP);
        } else {
            hart.clear_interrupt(MIP_MTIP);
        }
    }

    /// Sleeping harts recompute their deadline after mtime moves.
    fn kick_all(&self) {
        for h in &self.harts {
            h.wake();
        }
    }
}

impl MmioHandler for Clint {
    fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
        match buf.len() {
            4 => buf.copy_from_slice(&self.read32(offset).to_le_bytes()),
            8 => {
                let lo = self.read32(offset) as u64;
                let hi = self.read32(offset + 4) as u64;
                buf.copy_from_slice(&(lo | hi << 32).to_le_bytes());
            }
            _ => return false,
        }
        true
    }

    fn write(&self, offset: u64, buf: &[u8]) -> bool {
        match buf.len() {
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(buf);
                self.write32(offset, u32::from_le_bytes(b));
            }
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(buf);
                let value = u64::from_le_bytes(b);
                // Full-width compare/time writes land in one store.
                if (MTIMECMP_BASE..self.mtimecmp_range()).contains(&offset) {
                    if let Some(h) = self.hart(offset, MTIMECMP_BASE, 8) {
                        self.store_mtimecmp(h, value);
                    }
                } else if offset == MTIME_BASE {
                    self.timer.set(value);
                    self.kick_all();
                } else {
                    self.write32(offset, value as u32);
                    self.write32(offset + 4, (value >> 32) as u32);
                }
            }
            _ => return false,
        }
        true
    }

    fn reset(&self) {
        for h in &self.harts {
            h.clear_interrupt(MIP_MSIP | MIP_MTIP);
            h.set_mtimecmp(u64::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mmio::MmioBus;

    fn setup() -> (Vec<Arc<HartShared>>, Arc<MachineTimer>, MmioBus) {
        let harts: Vec<_> = (0..2).map(|i| Arc::new(HartShared::new(i))).collect();
        let timer = Arc::new(MachineTimer::manual(1_000_000));
        let bus = MmioBus::new()
            .with_device(Clint::new(harts.clone(), timer.clone()).into_device(0x0200_0000))
            .unwrap();
        (harts, timer, bus)
    }

    #[test]
    fn test_msip_targets_one_hart() {
        let (harts, _, bus) = setup();
        assert_eq!(bus.write(0x0200_0004, &1u32.to_le_bytes()), Some(true));
        assert_eq!(harts[0].pending() & MIP_MSIP, 0);
        assert_ne!(harts[1].pending() & MIP_MSIP, 0);
        let mut buf = [0u8; 4];
        bus.read(0x0200_0004, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 1);
        bus.write(0x0200_0004, &0u32.to_le_bytes());
        assert_eq!(harts[1].pending() & MIP_MSIP, 0);
    }

    #[test]
    fn test_mtimecmp_halves_and_full() {
        let (harts, _, bus) = setup();
        bus.write(0x0200_4008, &0x1234u32.to_le_bytes());
        bus.write(0x0200_400C, &0x5u32.to_le_bytes());
        assert_eq!(harts[1].mtimecmp(), 0x5_0000_1234);
        bus.write(0x0200_4000, &0xABCDu64.to_le_bytes());
        assert_eq!(harts[0].mtimecmp(), 0xABCD);
    }

    #[test]
    fn test_mtimecmp_write_updates_mtip() {
        let (harts, timer, bus) = setup();
        timer.advance(50);
        bus.write(0x0200_4000, &10u64.to_le_bytes());
        assert_ne!(harts[0].pending() & MIP_MTIP, 0);
        bus.write(0x0200_4000, &100u64.to_le_bytes());
        assert_eq!(harts[0].pending() & MIP_MTIP, 0);
        assert_eq!(harts[1].pending() & MIP_MTIP, 0);
    }

    #[test]
    fn test_mtime() {
        let (_, timer, bus) = setup();
        timer.advance(77);
        let mut buf = [0u8; 8];
        bus.read(0x0200_BFF8, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), 77);
        bus.write(0x0200_BFF8, &1000u64.to_le_bytes());
        assert_eq!(timer.now(), 1000);
        // byte access is widened to a word
        let mut byte = [0u8; 1];
        bus.read(0x0200_BFF9, &mut byte);
        assert_eq!(byte[0], 0x03);
    }
}
