//! Machine orchestrator
//!
//! Brings together harts, guest RAM, the MMIO bus and the CLINT. Each hart
//! runs on its own native thread between `start` and `pause`; while paused
//! the harts are owned by the machine and can be inspected or driven
//! directly with `run_for`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::config::{HartCaps, MachineConfig};
use crate::cpu::{Hart, HartShared};
use crate::devices::Clint;
use crate::error::MachineError;
use crate::image;
use crate::memory::mmio::{MmioBus, MmioDevice};
use crate::memory::GuestMemory;
use crate::snapshot::MachineSnapshot;
use crate::timer::MachineTimer;

/// Instructions a hart runs before `run_for` moves to the next one
const ROUND_ROBIN_SLICE: u64 = 1000;

pub struct Machine {
    config: MachineConfig,
    ram: Arc<GuestMemory>,
    timer: Arc<MachineTimer>,
    mmio: Arc<MmioBus>,
    shared: Vec<Arc<HartShared>>,
    /// Harts owned by the machine while paused
    harts: Vec<Option<Hart>>,
    /// Hart threads while running; each returns its hart when joined
    threads: Vec<(usize, JoinHandle<Hart>)>,
}

impl Machine {
    /// Build a machine with every hart reset and paused.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        config.validate()?;

        let ram = Arc::new(GuestMemory::new(config.ram_base, config.ram_size)?);
        let timer = Arc::new(if config.manual_timer {
            MachineTimer::manual(config.timer_freq)
        } else {
            MachineTimer::new(config.timer_freq)
        });
        let shared: Vec<_> = (0..config.harts).map(|i| Arc::new(HartShared::new(i))).collect();

        let mut bus = MmioBus::new();
        if let Some(base) = config.clint_base {
            bus = bus.with_device(Clint::new(shared.clone(), timer.clone()).into_device(base))?;
        }
        let mmio = Arc::new(bus);

        let caps = HartCaps::from(&config);
        let harts = shared
            .iter()
            .map(|s| {
                let mut hart = Hart::new(s.clone(), caps, ram.clone(), mmio.clone(), timer.clone(), config.tlb_size);
                hart.reset(config.reset_pc);
                Some(hart)
            })
            .collect();

        info!(
            "machine: {} x {} hart(s), RAM {:#x}+{:#x}",
            config.harts,
            if config.rv64 { "RV64" } else { "RV32" },
            config.ram_base,
            config.ram_size
        );
        Ok(Machine { config, ram, timer, mmio, shared, harts, threads: Vec::new() })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn ram(&self) -> &Arc<GuestMemory> {
        &self.ram
    }

    pub fn timer(&self) -> &Arc<MachineTimer> {
        &self.timer
    }

    pub fn mmio(&self) -> &Arc<MmioBus> {
        &self.mmio
    }

    pub fn hart_count(&self) -> usize {
        self.shared.len()
    }

    /// Copy `data` into RAM at physical address `paddr`.
    pub fn load(&self, paddr: u64, data: &[u8]) -> Result<(), MachineError> {
        let len = data.len() as u64;
        let off = self.ram.offset_of(paddr, len).ok_or(MachineError::ImageOutOfRange { addr: paddr, len })?;
        if !self.ram.write(off, data) {
            return Err(MachineError::ImageOutOfRange { addr: paddr, len });
        }
        Ok(())
    }

    /// Load a raw, gzip or zstd image. Returns the number of bytes placed.
    pub fn load_image(&self, paddr: u64, data: &[u8]) -> Result<usize, MachineError> {
        let bytes = image::decode(data)?;
        self.load(paddr, &bytes)?;
        info!("machine: loaded {} byte image at {:#x}", bytes.len(), paddr);
        Ok(bytes.len())
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Spawn one thread per hart. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), MachineError> {
        if self.is_running() {
            return Ok(());
        }
        for i in 0..self.harts.len() {
            let Some(mut hart) = self.harts[i].take() else {
                continue;
            };
            let shared = self.shared[i].clone();
            shared.take_events();
            shared.set_running(true);
            let spawned = thread::Builder::new().name(format!("hart{}", i)).spawn(move || {
                hart.run();
                hart
            });
            match spawned {
                Ok(handle) => self.threads.push((i, handle)),
                Err(e) => {
                    error!("machine: failed to spawn hart {}: {}", i, e);
                    shared.set_running(false);
                    // Already started harts come back; this one is lost.
                    let _ = self.pause();
                    return Err(MachineError::Thread(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Stop every hart and wait for its thread. Harts are owned by the
    /// machine again afterwards.
    pub fn pause(&mut self) -> Result<(), MachineError> {
        for (i, _) in &self.threads {
            self.shared[*i].request_pause();
        }
        let mut result = Ok(());
        for (i, handle) in self.threads.drain(..) {
            match handle.join() {
                Ok(hart) => self.harts[i] = Some(hart),
                Err(_) => {
                    error!("machine: hart {} panicked", i);
                    if result.is_ok() {
                        result = Err(MachineError::HartPanicked(i));
                    }
                }
            }
            self.shared[i].take_events();
        }
        result
    }

    /// Borrow a hart. `None` while the machine runs.
    pub fn hart(&self, index: usize) -> Option<&Hart> {
        self.harts.get(index)?.as_ref()
    }

    pub fn hart_mut(&mut self, index: usize) -> Option<&mut Hart> {
        self.harts.get_mut(index)?.as_mut()
    }

    /// The cross-thread half of a hart; usable while running.
    pub fn hart_shared(&self, index: usize) -> Option<&Arc<HartShared>> {
        self.shared.get(index)
    }

    /// Raise interrupt lines (`mip` bits) on a hart. Safe while running.
    pub fn raise_interrupt(&self, hart: usize, bits: u64) {
        if let Some(shared) = self.shared.get(hart) {
            shared.raise_interrupt(bits);
        }
    }

    pub fn clear_interrupt(&self, hart: usize, bits: u64) {
        if let Some(shared) = self.shared.get(hart) {
            shared.clear_interrupt(bits);
        }
    }

    /// Run `f` with all harts paused, resuming them afterwards if they
    /// were running.
    fn with_paused<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, MachineError>) -> Result<T, MachineError> {
        let was_running = self.is_running();
        if was_running {
            self.pause()?;
        }
        let result = f(self);
        if was_running {
            self.start()?;
        }
        result
    }

    fn install_bus(&mut self, bus: MmioBus) {
        let bus = Arc::new(bus);
        for hart in self.harts.iter_mut().flatten() {
            hart.set_mmio(bus.clone());
        }
        self.mmio = bus;
    }

    /// Map a device. Fails if it overlaps RAM or another device.
    pub fn attach_device(&mut self, device: MmioDevice) -> Result<(), MachineError> {
        let ram_end = self.ram.base() + self.ram.size();
        if device.base < ram_end && self.ram.base() < device.base.saturating_add(device.size) {
            return Err(MachineError::DeviceOverlap { name: device.name.clone(), base: device.base, size: device.size });
        }
        self.with_paused(|m| {
            let (name, base, size) = (device.name.clone(), device.base, device.size);
            let bus = m.mmio.with_device(device)?;
            m.install_bus(bus);
            info!("machine: attached {} at {:#x}+{:#x}", name, base, size);
            Ok(())
        })
    }

    pub fn detach_device(&mut self, name: &str) -> Result<(), MachineError> {
        self.with_paused(|m| {
            let bus = m.mmio.without_device(name)?;
            m.install_bus(bus);
            info!("machine: detached {}", name);
            Ok(())
        })
    }

    /// Reset harts, devices and `mtime`. RAM keeps its contents.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.with_paused(|m| {
            m.mmio.reset();
            m.timer.set(0);
            let pc = m.config.reset_pc;
            for hart in m.harts.iter_mut().flatten() {
                hart.reset(pc);
            }
            Ok(())
        })
    }

    /// Drive the paused harts from this thread, round robin, until each has
    /// retired `max` instructions or stopped making progress (waiting in
    /// WFI, or trapping without retiring). Returns the total retired.
    pub fn run_for(&mut self, max: u64) -> Result<u64, MachineError> {
        if self.is_running() {
            return Err(MachineError::HartsRunning);
        }
        let mut done = vec![0u64; self.harts.len()];
        loop {
            let mut progress = false;
            for (i, hart) in self.harts.iter_mut().enumerate() {
                let Some(hart) = hart.as_mut() else {
                    continue;
                };
                let left = max - done[i];
                if left == 0 {
                    continue;
                }
                let retired = hart.run_for(left.min(ROUND_ROBIN_SLICE));
                done[i] += retired;
                progress |= retired > 0;
            }
            if !progress {
                break;
            }
        }
        Ok(done.iter().sum())
    }

    pub fn snapshot(&self) -> Result<MachineSnapshot, MachineError> {
        if self.is_running() {
            return Err(MachineError::HartsRunning);
        }
        let harts = self
            .harts
            .iter()
            .enumerate()
            .map(|(i, h)| h.as_ref().map(Hart::save_state).ok_or(MachineError::HartPanicked(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MachineSnapshot {
            version: MachineSnapshot::VERSION,
            rv64: self.config.rv64,
            ram_base: self.ram.base(),
            ram_size: self.ram.size(),
            timer: self.timer.now(),
            harts,
            pages: MachineSnapshot::capture_pages(&self.ram),
        })
    }

    /// Restore a snapshot taken from a machine with the same shape.
    pub fn restore(&mut self, snapshot: &MachineSnapshot) -> Result<(), MachineError> {
        if self.is_running() {
            return Err(MachineError::HartsRunning);
        }
        if snapshot.rv64 != self.config.rv64
            || snapshot.ram_base != self.ram.base()
            || snapshot.ram_size != self.ram.size()
            || snapshot.harts.len() != self.harts.len()
        {
            return Err(MachineError::Snapshot("snapshot was taken from a different machine".to_string()));
        }
        snapshot.restore_pages(&self.ram)?;
        self.timer.set(snapshot.timer);
        for (i, (hart, saved)) in self.harts.iter_mut().zip(&snapshot.harts).enumerate() {
            hart.as_mut().ok_or(MachineError::HartPanicked(i))?.restore_state(saved)?;
        }
        info!("machine: restored snapshot ({} RAM pages)", snapshot.pages.len());
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.pause();
        }
    }
}
