//! Translation cache
//!
//! Direct-mapped on the low bits of the virtual page number. A slot keeps
//! one validated tag per access kind and the RAM offset of the page, so a
//! hit costs an index and one compare. Invalid tags hold `slot + 1`, a page
//! number that can never index that slot (the cache has at least 2 slots).

use super::mmu::AccessType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TlbEntry {
    read: u64,
    write: u64,
    exec: u64,
    /// Offset of the page inside guest RAM
    host: u64,
}

impl TlbEntry {
    const fn invalid(slot: usize) -> Self {
        let sentinel = slot as u64 + 1;
        TlbEntry { read: sentinel, write: sentinel, exec: sentinel, host: 0 }
    }
}

pub struct Tlb {
    entries: Box<[TlbEntry]>,
    mask: u64,
}

impl Tlb {
    /// `size` must be a power of two, at least 2 (checked by config validation).
    pub fn new(size: usize) -> Self {
        let size = size.max(2).next_power_of_two();
        Tlb {
            entries: (0..size).map(TlbEntry::invalid).collect(),
            mask: size as u64 - 1,
        }
    }

    #[inline(always)]
    fn slot(&self, vpn: u64) -> usize {
        (vpn & self.mask) as usize
    }

    /// RAM offset of page `vpn` if it was validated for `access`.
    #[inline(always)]
    pub fn lookup(&self, vpn: u64, access: AccessType) -> Option<u64> {
        let entry = &self.entries[self.slot(vpn)];
        let tag = match access {
            AccessType::Load => entry.read,
            AccessType::Store => entry.write,
            AccessType::Instruction => entry.exec,
        };
        (tag == vpn).then_some(entry.host)
    }

    /// Record a validated translation. The other access kinds of the slot
    /// survive only if they describe the same page at the same offset.
    pub fn insert(&mut self, vpn: u64, access: AccessType, host: u64) {
        let slot = self.slot(vpn);
        let sentinel = slot as u64 + 1;
        let entry = &mut self.entries[slot];
        let foreign = |tag: u64| tag != sentinel && tag != vpn;
        if entry.host != host || foreign(entry.read) || foreign(entry.write) || foreign(entry.exec) {
            *entry = TlbEntry::invalid(slot);
        }
        entry.host = host;
        match access {
            AccessType::Load => entry.read = vpn,
            AccessType::Store => entry.write = vpn,
            AccessType::Instruction => entry.exec = vpn,
        }
    }

    pub fn flush(&mut self) {
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            *entry = TlbEntry::invalid(slot);
        }
    }

    pub fn flush_page(&mut self, vpn: u64) {
        let slot = self.slot(vpn);
        let entry = &mut self.entries[slot];
        if entry.read == vpn || entry.write == vpn || entry.exec == vpn {
            *entry = TlbEntry::invalid(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
