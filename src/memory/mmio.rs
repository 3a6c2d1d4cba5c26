//! MMIO dispatcher
//!
//! Physical accesses that miss RAM are routed here. The bus is immutable once
//! built: harts hold an `Arc<MmioBus>` and the machine swaps in a new one
//! while every hart is paused.

use std::fmt;
use std::sync::Arc;

use crate::error::MachineError;
use crate::memory::GuestMemory;

/// Largest realigned window an access can be widened to.
const BOUNCE_SIZE: u64 = 16;

/// Device side of the MMIO contract.
///
/// Offsets are relative to the device base. Accesses arrive naturally
/// aligned with a power-of-two length between the device's declared
/// `min_op` and `max_op`. Returning `false` makes the access fault.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> bool;
    fn write(&self, offset: u64, buf: &[u8]) -> bool;
    fn reset(&self) {}
}

#[derive(Clone)]
pub struct MmioDevice {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub min_op: u32,
    pub max_op: u32,
    /// Backing memory for direct-mapped regions (addressed by device offset).
    pub mapping: Option<Arc<GuestMemory>>,
    /// `None` means the region is plain memory served from `mapping`.
    pub handler: Option<Arc<dyn MmioHandler>>,
}

impl fmt::Debug for MmioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioDevice")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("min_op", &self.min_op)
            .field("max_op", &self.max_op)
            .field("direct", &self.handler.is_none())
            .finish()
    }
}

impl MmioDevice {
    pub fn new(name: &str, base: u64, size: u64, handler: Arc<dyn MmioHandler>) -> Self {
        MmioDevice {
            name: name.to_string(),
            base,
            size,
            min_op: 1,
            max_op: 8,
            mapping: None,
            handler: Some(handler),
        }
    }

    /// Plain memory (ROM, framebuffer, ...) mapped at `base`.
    pub fn direct(name: &str, base: u64, mapping: Arc<GuestMemory>) -> Self {
        MmioDevice {
            name: name.to_string(),
            base,
            size: mapping.size(),
            min_op: 1,
            max_op: 8,
            mapping: Some(mapping),
            handler: None,
        }
    }

    /// Restrict the access widths the handler is called with.
    pub fn with_op_sizes(mut self, min_op: u32, max_op: u32) -> Self {
        let min_op = min_op.clamp(1, 8).next_power_of_two();
        let max_op = max_op.clamp(1, 8).next_power_of_two().max(min_op);
        self.min_op = min_op;
        self.max_op = max_op;
        self
    }

    #[inline]
    fn covers(&self, paddr: u64, len: u64) -> bool {
        paddr >= self.base && paddr - self.base + len <= self.size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
        match (&self.handler, &self.mapping) {
            (Some(handler), _) => self.realigned_read(handler.as_ref(), offset, buf),
            (None, Some(mem)) => mem.read(offset, buf),
            (None, None) => false,
        }
    }

    fn write(&self, offset: u64, buf: &[u8]) -> bool {
        match (&self.handler, &self.mapping) {
            (Some(handler), _) => self.realigned_write(handler.as_ref(), offset, buf),
            (None, Some(mem)) => mem.write(offset, buf),
            (None, None) => false,
        }
    }

    /// Operation width and aligned window for an access, or `None` when the
    /// access cannot be realigned within the bounce buffer.
    fn window(&self, offset: u64, len: usize) -> Option<(u64, u64, u64)> {
        let op = (len as u64).next_power_of_two().clamp(self.min_op as u64, self.max_op as u64);
        let start = offset & !(op - 1);
        let end = (offset + len as u64 + op - 1) & !(op - 1);
        if end - start > BOUNCE_SIZE || end > self.size {
            return None;
        }
        Some((op, start, end))
    }

    fn realigned_read(&self, handler: &dyn MmioHandler, offset: u64, buf: &mut [u8]) -> bool {
        let Some((op, start, end)) = self.window(offset, buf.len()) else {
            return false;
        };
        if start == offset && end - start == buf.len() as u64 && op == buf.len() as u64 {
            return handler.read(offset, buf);
        }
        let mut bounce = [0u8; BOUNCE_SIZE as usize];
        let window = &mut bounce[..(end - start) as usize];
        for (i, piece) in window.chunks_mut(op as usize).enumerate() {
            if !handler.read(start + i as u64 * op, piece) {
                return false;
            }
        }
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&window[skip..skip + buf.len()]);
        true
    }

    fn realigned_write(&self, handler: &dyn MmioHandler, offset: u64, buf: &[u8]) -> bool {
        let Some((op, start, end)) = self.window(offset, buf.len()) else {
            return false;
        };
        if start == offset && op == buf.len() as u64 {
            return handler.write(offset, buf);
        }
        let mut bounce = [0u8; BOUNCE_SIZE as usize];
        let window = &mut bounce[..(end - start) as usize];
        let skip = (offset - start) as usize;
        // Only pieces partially covered by the access need their old contents.
        for (i, piece) in window.chunks_mut(op as usize).enumerate() {
            let lo = i * op as usize;
            let hi = lo + op as usize;
            let fully_covered = lo >= skip && hi <= skip + buf.len();
            if !fully_covered && !handler.read(start + lo as u64, piece) {
                return false;
            }
        }
        window[skip..skip + buf.len()].copy_from_slice(buf);
        for (i, piece) in window.chunks(op as usize).enumerate() {
            if !handler.write(start + i as u64 * op, piece) {
                return false;
            }
        }
        true
    }
}

/// Sorted, non-overlapping device list.
#[derive(Clone, Default)]
pub struct MmioBus {
    devices: Vec<MmioDevice>,
}

impl MmioBus {
    pub fn new() -> Self {
        MmioBus::default()
    }

    /// A copy of this bus with `device` added.
    pub fn with_device(&self, device: MmioDevice) -> Result<MmioBus, MachineError> {
        let end = device.base.checked_add(device.size);
        let overlaps = device.size == 0
            || end.is_none()
            || self.devices.iter().any(|d| {
                d.name == device.name || (device.base < d.base + d.size && d.base < device.base + device.size)
            });
        if overlaps {
            return Err(MachineError::DeviceOverlap {
                name: device.name.clone(),
                base: device.base,
                size: device.size,
            });
        }
        let mut devices = self.devices.clone();
        let at = devices.partition_point(|d| d.base < device.base);
        devices.insert(at, device);
        Ok(MmioBus { devices })
    }

    pub fn without_device(&self, name: &str) -> Result<MmioBus, MachineError> {
        let Some(at) = self.devices.iter().position(|d| d.name == name) else {
            return Err(MachineError::NoSuchDevice(name.to_string()));
        };
        let mut devices = self.devices.clone();
        devices.remove(at);
        Ok(MmioBus { devices })
    }

    pub fn devices(&self) -> &[MmioDevice] {
        &self.devices
    }

    pub fn find(&self, paddr: u64) -> Option<&MmioDevice> {
        let idx = self.devices.partition_point(|d| d.base <= paddr);
        let dev = self.devices.get(idx.checked_sub(1)?)?;
        (paddr - dev.base < dev.size).then_some(dev)
    }

    /// `None` when no device claims the address; `Some(false)` when the
    /// device rejected the access.
    pub fn read(&self, paddr: u64, buf: &mut [u8]) -> Option<bool> {
        let dev = self.find(paddr)?;
        if !dev.covers(paddr, buf.len() as u64) {
            return Some(false);
        }
        Some(dev.read(paddr - dev.base, buf))
    }

    pub fn write(&self, paddr: u64, buf: &[u8]) -> Option<bool> {
        let dev = self.find(paddr)?;
        if !dev.covers(paddr, buf.len() as u64) {
            return Some(false);
        }
        Some(dev.write(paddr - dev.base, buf))
    }

    pub fn reset(&self) {
        for handler in self.devices.iter().filter_map(|d| d.handler.as_ref()) {
            handler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 32-bit register file that only accepts aligned word accesses.
    struct WordRegs {
        regs: Mutex<[u32; 8]>,
        log: Mutex<Vec<(bool, u64)>>,
    }

    impl WordRegs {
        fn new() -> Arc<Self> {
            Arc::new(WordRegs { regs: Mutex::new([0; 8]), log: Mutex::new(Vec::new()) })
        }
    }

    impl MmioHandler for WordRegs {
        fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
            if buf.len() != 4 || offset % 4 != 0 {
                return false;
            }
            self.log.lock().unwrap().push((false, offset));
            let v = self.regs.lock().unwrap()[(offset / 4) as usize];
            buf.copy_from_slice(&v.to_le_bytes());
            true
        }

        fn write(&self, offset: u64, buf: &[u8]) -> bool {
            if buf.len() != 4 || offset % 4 != 0 {
                return false;
            }
            self.log.lock().unwrap().push((true, offset));
            let mut b = [0u8; 4];
            b.copy_from_slice(buf);
            self.regs.lock().unwrap()[(offset / 4) as usize] = u32::from_le_bytes(b);
            true
        }
    }

    fn bus_with(regs: Arc<WordRegs>) -> MmioBus {
        MmioBus::new()
            .with_device(MmioDevice::new("regs", 0x1000_0000, 32, regs).with_op_sizes(4, 4))
            .unwrap()
    }

    #[test]
    fn test_byte_write_is_read_modify_write() {
        let regs = WordRegs::new();
        let bus = bus_with(regs.clone());
        assert_eq!(bus.write(0x1000_0000, &0x1122_3344u32.to_le_bytes()), Some(true));
        assert_eq!(bus.write(0x1000_0001, &[0xAA]), Some(true));
        assert_eq!(regs.regs.lock().unwrap()[0], 0x1122_AA44);
        let mut byte = [0u8; 1];
        assert_eq!(bus.read(0x1000_0003, &mut byte), Some(true));
        assert_eq!(byte[0], 0x11);
    }

    #[test]
    fn test_misaligned_spans_two_registers() {
        let regs = WordRegs::new();
        let bus = bus_with(regs.clone());
        assert_eq!(bus.write(0x1000_0002, &0xDDCC_BBAAu32.to_le_bytes()), Some(true));
        let r = *regs.regs.lock().unwrap();
        assert_eq!(r[0], 0xBBAA_0000);
        assert_eq!(r[1], 0x0000_DDCC);
        let mut word = [0u8; 4];
        assert_eq!(bus.read(0x1000_0002, &mut word), Some(true));
        assert_eq!(u32::from_le_bytes(word), 0xDDCC_BBAA);
    }

    #[test]
    fn test_wide_access_is_split() {
        let regs = WordRegs::new();
        let bus = bus_with(regs.clone());
        assert_eq!(bus.write(0x1000_0008, &0x0102_0304_0506_0708u64.to_le_bytes()), Some(true));
        let log = regs.log.lock().unwrap().clone();
        assert_eq!(log, vec![(true, 8), (true, 12)]);
    }

    #[test]
    fn test_unclaimed_and_out_of_device() {
        let bus = bus_with(WordRegs::new());
        let mut buf = [0u8; 4];
        assert_eq!(bus.read(0x2000_0000, &mut buf), None);
        assert_eq!(bus.read(0x0FFF_FFFF, &mut buf[..1]), None);
        assert_eq!(bus.read(0x1000_001E, &mut buf), Some(false));
    }

    #[test]
    fn test_direct_mapping() {
        let rom = Arc::new(GuestMemory::new(0, 0x1000).unwrap());
        let bus = MmioBus::new().with_device(MmioDevice::direct("rom", 0x1_0000, rom.clone())).unwrap();
        assert_eq!(bus.write(0x1_0003, &[1, 2, 3, 4, 5]), Some(true));
        assert_eq!(rom.load(3, 4), Some(0x0403_0201));
        let mut buf = [0u8; 2];
        assert_eq!(bus.read(0x1_0006, &mut buf), Some(true));
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn test_overlap_and_detach() {
        let bus = bus_with(WordRegs::new());
        let clash = MmioDevice::new("other", 0x1000_0010, 0x100, WordRegs::new());
        assert!(matches!(bus.with_device(clash), Err(MachineError::DeviceOverlap { .. })));
        let bus = bus.without_device("regs").unwrap();
        assert!(bus.find(0x1000_0000).is_none());
        assert!(matches!(bus.without_device("regs"), Err(MachineError::NoSuchDevice(_))));
    }
}
