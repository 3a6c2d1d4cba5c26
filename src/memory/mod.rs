//! Guest physical memory
//!
//! RAM is one page-aligned host allocation shared by every hart. Harts touch
//! it concurrently without locks, so every access goes through a relaxed
//! atomic of the natural width (or bytewise atomics when misaligned). Guest
//! fences and AMOs provide any stronger ordering the guest asks for.

pub mod mmio;

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use log::{debug, error};

use crate::error::MachineError;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Read-modify-write operations of the A extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    MinU,
    MaxU,
}

impl AmoOp {
    /// Decode funct5 of an AMO instruction (LR/SC excluded).
    pub fn from_funct5(funct5: u32) -> Option<Self> {
        Some(match funct5 {
            0b00001 => AmoOp::Swap,
            0b00000 => AmoOp::Add,
            0b00100 => AmoOp::Xor,
            0b01100 => AmoOp::And,
            0b01000 => AmoOp::Or,
            0b10000 => AmoOp::Min,
            0b10100 => AmoOp::Max,
            0b11000 => AmoOp::MinU,
            0b11100 => AmoOp::MaxU,
            _ => return None,
        })
    }

    /// Compute the value to store. `old` and `operand` are zero-extended
    /// `size`-byte quantities; signed comparisons use the operand width.
    pub fn apply(self, old: u64, operand: u64, size: u32) -> u64 {
        let (sold, sop) = if size == 4 {
            (old as u32 as i32 as i64, operand as u32 as i32 as i64)
        } else {
            (old as i64, operand as i64)
        };
        let (uold, uop) = if size == 4 { (old as u32 as u64, operand as u32 as u64) } else { (old, operand) };
        let result = match self {
            AmoOp::Swap => operand,
            AmoOp::Add => old.wrapping_add(operand),
            AmoOp::Xor => old ^ operand,
            AmoOp::And => old & operand,
            AmoOp::Or => old | operand,
            AmoOp::Min => sold.min(sop) as u64,
            AmoOp::Max => sold.max(sop) as u64,
            AmoOp::MinU => uold.min(uop),
            AmoOp::MaxU => uold.max(uop),
        };
        if size == 4 {
            result as u32 as u64
        } else {
            result
        }
    }
}

#[cfg_attr(unix, allow(dead_code))]
enum Backing {
    #[cfg(unix)]
    Mmap,
    Heap(Box<[AtomicU64]>),
}

/// Guest RAM at a fixed physical base.
pub struct GuestMemory {
    base: u64,
    size: u64,
    ptr: *mut u8,
    backing: Backing,
    /// One flag per page: a compiled block was built from this page.
    code_pages: Box<[AtomicU8]>,
    code_epoch: AtomicU64,
}

// Every access through `ptr` is atomic; the allocation outlives all users.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    pub fn new(base: u64, size: u64) -> Result<Self, MachineError> {
        let bytes = usize::try_from(size).map_err(|_| MachineError::OutOfMemory { bytes: size })?;
        let (ptr, backing) = Self::allocate(bytes)?;
        let pages = (size >> PAGE_SHIFT) as usize;
        let code_pages = (0..pages).map(|_| AtomicU8::new(0)).collect();
        debug!("guest RAM {:#x}+{:#x} at {:p}", base, size, ptr);
        Ok(GuestMemory { base, size, ptr, backing, code_pages, code_epoch: AtomicU64::new(0) })
    }

    #[cfg(unix)]
    fn allocate(bytes: usize) -> Result<(*mut u8, Backing), MachineError> {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // SAFETY: anonymous mapping with no fixed address.
        let ptr = unsafe {
            libc::mmap(std::ptr::null_mut(), bytes, libc::PROT_READ | libc::PROT_WRITE, flags, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            error!("mmap of {} bytes of guest RAM failed", bytes);
            return Err(MachineError::OutOfMemory { bytes: bytes as u64 });
        }
        Ok((ptr as *mut u8, Backing::Mmap))
    }

    #[cfg(not(unix))]
    fn allocate(bytes: usize) -> Result<(*mut u8, Backing), MachineError> {
        let words: Box<[AtomicU64]> = (0..bytes / 8).map(|_| AtomicU64::new(0)).collect();
        let ptr = words.as_ptr() as *mut u8;
        Ok((ptr, Backing::Heap(words)))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn contains(&self, paddr: u64, len: u64) -> bool {
        self.offset_of(paddr, len).is_some()
    }

    /// Offset of `paddr` if the whole `len`-byte range lies in RAM.
    #[inline]
    pub fn offset_of(&self, paddr: u64, len: u64) -> Option<u64> {
        let off = paddr.checked_sub(self.base)?;
        let end = off.checked_add(len)?;
        (end <= self.size).then_some(off)
    }

    #[inline]
    fn in_bounds(&self, off: u64, len: u64) -> bool {
        off.checked_add(len).map_or(false, |end| end <= self.size)
    }

    /// Load a naturally sized (1/2/4/8) little-endian value.
    #[inline]
    pub fn load(&self, off: u64, size: u32) -> Option<u64> {
        if !self.in_bounds(off, size as u64) {
            return None;
        }
        if off & (size as u64 - 1) != 0 {
            let mut buf = [0u8; 8];
            self.read_bytes(off, &mut buf[..size as usize]);
            return Some(u64::from_le_bytes(buf));
        }
        // SAFETY: in bounds and naturally aligned.
        unsafe {
            let p = self.ptr.add(off as usize);
            Some(match size {
                1 => AtomicU8::from_ptr(p).load(Ordering::Relaxed) as u64,
                2 => u16::from_le(AtomicU16::from_ptr(p as *mut u16).load(Ordering::Relaxed)) as u64,
                4 => u32::from_le(AtomicU32::from_ptr(p as *mut u32).load(Ordering::Relaxed)) as u64,
                _ => u64::from_le(AtomicU64::from_ptr(p as *mut u64).load(Ordering::Relaxed)),
            })
        }
    }

    #[inline]
    pub fn store(&self, off: u64, size: u32, value: u64) -> bool {
        if !self.in_bounds(off, size as u64) {
            return false;
        }
        if off & (size as u64 - 1) != 0 {
            self.write_bytes(off, &value.to_le_bytes()[..size as usize]);
        } else {
            // SAFETY: in bounds and naturally aligned.
            unsafe {
                let p = self.ptr.add(off as usize);
                match size {
                    1 => AtomicU8::from_ptr(p).store(value as u8, Ordering::Relaxed),
                    2 => AtomicU16::from_ptr(p as *mut u16).store((value as u16).to_le(), Ordering::Relaxed),
                    4 => AtomicU32::from_ptr(p as *mut u32).store((value as u32).to_le(), Ordering::Relaxed),
                    _ => AtomicU64::from_ptr(p as *mut u64).store(value.to_le(), Ordering::Relaxed),
                }
            }
        }
        self.note_write(off, size as u64);
        true
    }

    /// Copy out of RAM, using the widest naturally aligned access at each step.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> bool {
        if !self.in_bounds(off, buf.len() as u64) {
            return false;
        }
        self.read_bytes(off, buf);
        true
    }

    pub fn write(&self, off: u64, buf: &[u8]) -> bool {
        if !self.in_bounds(off, buf.len() as u64) {
            return false;
        }
        self.write_bytes(off, buf);
        self.note_write(off, buf.len() as u64);
        true
    }

    fn read_bytes(&self, off: u64, buf: &mut [u8]) {
        let mut i = 0usize;
        while i < buf.len() {
            let pos = off + i as u64;
            let step = chunk(pos, buf.len() - i);
            // SAFETY: caller checked bounds; chunk() only returns aligned widths.
            let v = unsafe { self.load_aligned(pos, step) };
            buf[i..i + step].copy_from_slice(&v.to_le_bytes()[..step]);
            i += step;
        }
    }

    fn write_bytes(&self, off: u64, buf: &[u8]) {
        let mut i = 0usize;
        while i < buf.len() {
            let pos = off + i as u64;
            let step = chunk(pos, buf.len() - i);
            let mut v = [0u8; 8];
            v[..step].copy_from_slice(&buf[i..i + step]);
            // SAFETY: as in read_bytes.
            unsafe { self.store_aligned(pos, step, u64::from_le_bytes(v)) };
            i += step;
        }
    }

    unsafe fn load_aligned(&self, off: u64, size: usize) -> u64 {
        let p = self.ptr.add(off as usize);
        match size {
            1 => AtomicU8::from_ptr(p).load(Ordering::Relaxed) as u64,
            2 => u16::from_le(AtomicU16::from_ptr(p as *mut u16).load(Ordering::Relaxed)) as u64,
            4 => u32::from_le(AtomicU32::from_ptr(p as *mut u32).load(Ordering::Relaxed)) as u64,
            _ => u64::from_le(AtomicU64::from_ptr(p as *mut u64).load(Ordering::Relaxed)),
        }
    }

    unsafe fn store_aligned(&self, off: u64, size: usize, value: u64) {
        let p = self.ptr.add(off as usize);
        match size {
            1 => AtomicU8::from_ptr(p).store(value as u8, Ordering::Relaxed),
            2 => AtomicU16::from_ptr(p as *mut u16).store((value as u16).to_le(), Ordering::Relaxed),
            4 => AtomicU32::from_ptr(p as *mut u32).store((value as u32).to_le(), Ordering::Relaxed),
            _ => AtomicU64::from_ptr(p as *mut u64).store(value.to_le(), Ordering::Relaxed),
        }
    }

    /// Atomic compare-and-swap of a naturally aligned 4- or 8-byte value.
    /// `Err` carries the value actually found. Out-of-range or misaligned
    /// offsets fail with `Err(0)`.
    pub fn compare_exchange(&self, off: u64, size: u32, current: u64, new: u64) -> Result<u64, u64> {
        if !self.in_bounds(off, size as u64) || off & (size as u64 - 1) != 0 {
            return Err(0);
        }
        // SAFETY: in bounds and naturally aligned.
        let result = unsafe {
            let p = self.ptr.add(off as usize);
            if size == 4 {
                AtomicU32::from_ptr(p as *mut u32)
                    .compare_exchange(
                        (current as u32).to_le(),
                        (new as u32).to_le(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .map(|v| u32::from_le(v) as u64)
                    .map_err(|v| u32::from_le(v) as u64)
            } else {
                AtomicU64::from_ptr(p as *mut u64)
                    .compare_exchange(current.to_le(), new.to_le(), Ordering::AcqRel, Ordering::Acquire)
                    .map(u64::from_le)
                    .map_err(u64::from_le)
            }
        };
        if result.is_ok() {
            self.note_write(off, size as u64);
        }
        result
    }

    /// Atomic read-modify-write; returns the previous (zero-extended) value.
    pub fn amo(&self, off: u64, size: u32, op: AmoOp, operand: u64) -> Option<u64> {
        if !self.in_bounds(off, size as u64) || off & (size as u64 - 1) != 0 {
            return None;
        }
        // SAFETY: in bounds and naturally aligned.
        let old = unsafe {
            let p = self.ptr.add(off as usize);
            if size == 4 {
                let cell = AtomicU32::from_ptr(p as *mut u32);
                let mut cur = cell.load(Ordering::Relaxed);
                loop {
                    let new = op.apply(u32::from_le(cur) as u64, operand, 4) as u32;
                    match cell.compare_exchange_weak(cur, new.to_le(), Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(_) => break u32::from_le(cur) as u64,
                        Err(actual) => cur = actual,
                    }
                }
            } else {
                let cell = AtomicU64::from_ptr(p as *mut u64);
                let mut cur = cell.load(Ordering::Relaxed);
                loop {
                    let new = op.apply(u64::from_le(cur), operand, 8);
                    match cell.compare_exchange_weak(cur, new.to_le(), Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(_) => break u64::from_le(cur),
                        Err(actual) => cur = actual,
                    }
                }
            }
        };
        self.note_write(off, size as u64);
        Some(old)
    }

    /// Physical-address convenience accessors for loaders and tests.
    pub fn read_u16(&self, paddr: u64) -> Option<u16> {
        self.load(self.offset_of(paddr, 2)?, 2).map(|v| v as u16)
    }

    pub fn read_u32(&self, paddr: u64) -> Option<u32> {
        self.load(self.offset_of(paddr, 4)?, 4).map(|v| v as u32)
    }

    pub fn read_u64(&self, paddr: u64) -> Option<u64> {
        self.load(self.offset_of(paddr, 8)?, 8)
    }

    pub fn write_u32(&self, paddr: u64, value: u32) -> bool {
        self.offset_of(paddr, 4).map_or(false, |off| self.store(off, 4, value as u64))
    }

    pub fn write_u64(&self, paddr: u64, value: u64) -> bool {
        self.offset_of(paddr, 8).map_or(false, |off| self.store(off, 8, value))
    }

    /// Record that a compiled block was built from the page holding `off`.
    pub fn mark_code(&self, off: u64) {
        if let Some(flag) = self.code_pages.get((off >> PAGE_SHIFT) as usize) {
            flag.store(1, Ordering::Relaxed);
        }
    }

    /// Called for every write into RAM. Writing a page that backs a compiled
    /// block clears its mark and bumps the code epoch.
    #[inline]
    pub fn note_write(&self, off: u64, len: u64) {
        let first = off >> PAGE_SHIFT;
        let last = (off + len.max(1) - 1) >> PAGE_SHIFT;
        for page in first..=last {
            if let Some(flag) = self.code_pages.get(page as usize) {
                if flag.load(Ordering::Relaxed) != 0 && flag.swap(0, Ordering::Relaxed) != 0 {
                    self.code_epoch.fetch_add(1, Ordering::Release);
                }
            }
        }
    }

    #[inline]
    pub fn code_epoch(&self) -> u64 {
        self.code_epoch.load(Ordering::Acquire)
    }

    /// Is `page` (page index from RAM base) entirely zero?
    pub fn page_is_zero(&self, page: u64) -> bool {
        let off = page << PAGE_SHIFT;
        // SAFETY: aligned 8-byte steps inside RAM.
        (0..PAGE_SIZE / 8).all(|i| unsafe { self.load_aligned(off + i * 8, 8) } == 0)
    }

    /// Zero all of RAM.
    pub fn clear(&self) {
        let done = self.release_pages();
        if !done {
            // SAFETY: aligned 8-byte steps inside RAM.
            for off in (0..self.size).step_by(8) {
                unsafe { self.store_aligned(off, 8, 0) };
            }
        }
        for flag in self.code_pages.iter() {
            flag.store(0, Ordering::Relaxed);
        }
        self.code_epoch.fetch_add(1, Ordering::Release);
    }

    #[cfg(target_os = "linux")]
    fn release_pages(&self) -> bool {
        match self.backing {
            Backing::Mmap => {
                // SAFETY: private anonymous mapping; DONTNEED refills with zero pages.
                unsafe { libc::madvise(self.ptr as *mut libc::c_void, self.size as usize, libc::MADV_DONTNEED) == 0 }
            }
            Backing::Heap(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn release_pages(&self) -> bool {
        false
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Backing::Mmap = self.backing {
            // SAFETY: mapping created in allocate() with this size.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size as usize);
            }
        }
    }
}

/// Widest naturally aligned access (up to 8 bytes) that starts at `pos`
/// and fits in `remaining`.
#[inline]
fn chunk(pos: u64, remaining: usize) -> usize {
    let mut step = 8usize;
    while step > 1 && (pos & (step as u64 - 1) != 0 || step > remaining) {
        step >>= 1;
    }
    step
}
