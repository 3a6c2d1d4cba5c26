//! Machine time source (`mtime`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic host clock scaled to the guest timer frequency.
///
/// Guest writes to `mtime` are stored as an offset so the clock keeps
/// ticking from the written value. A manual timer never advances on its
/// own, which keeps tests deterministic.
pub struct MachineTimer {
    freq: u64,
    epoch: Instant,
    manual: bool,
    base: AtomicU64,
}

impl MachineTimer {
    pub fn new(freq: u64) -> Self {
        MachineTimer { freq, epoch: Instant::now(), manual: false, base: AtomicU64::new(0) }
    }

    pub fn manual(freq: u64) -> Self {
        MachineTimer { manual: true, ..MachineTimer::new(freq) }
    }

    pub fn freq(&self) -> u64 {
        self.freq
    }

    fn elapsed_ticks(&self) -> u64 {
        if self.manual {
            return 0;
        }
        let nanos = self.epoch.elapsed().as_nanos();
        (nanos * self.freq as u128 / 1_000_000_000) as u64
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.base.load(Ordering::Relaxed).wrapping_add(self.elapsed_ticks())
    }

    pub fn set(&self, value: u64) {
        self.base.store(value.wrapping_sub(self.elapsed_ticks()), Ordering::Relaxed);
    }

    /// Move a manual timer forward. Also works on a real-time timer, where
    /// it skips time ahead.
    pub fn advance(&self, ticks: u64) {
        self.base.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = ticks as u128 * 1_000_000_000 / self.freq as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}
