//! Hart dispatch loop
//!
//! `run` is the body of a hart thread: it steps until a pause is requested
//! and sleeps while the hart waits for an interrupt. `run_for` and `step`
//! drive a hart from the caller's thread instead.

use std::time::Duration;

use log::{info, trace};

use super::csr::{MCOUNTINHIBIT_CY, MCOUNTINHIBIT_IR, MIP_MTIP, MIP_STIP};
use super::jit::MAX_BLOCK_INSTS;
use super::{Hart, EVENT_PAUSE};

/// Instructions between timer comparisons
const TIMER_CHECK_INTERVAL: u32 = 64;

/// Instructions between looks at the event flags in `run`
const EVENT_CHECK_INTERVAL: u32 = 1024;

/// Longest single WFI sleep; the loop re-checks its state afterwards.
const MAX_SLEEP: Duration = Duration::from_millis(100);

impl Hart {
    /// Thread body. Returns once a pause is requested.
    pub fn run(&mut self) {
        info!("hart {}: running at {:#x}", self.id(), self.pc);
        while self.shared.is_running() {
            if self.shared.has_events() && self.shared.take_events() & EVENT_PAUSE != 0 {
                break;
            }
            if self.wfi {
                self.wait_for_interrupt();
                continue;
            }
            for _ in 0..EVENT_CHECK_INTERVAL {
                self.step();
                if self.wfi || self.shared.has_events() {
                    break;
                }
            }
        }
        self.finalize_block();
        info!("hart {}: stopped at {:#x}", self.id(), self.pc);
    }

    /// Run until at least `max` instructions retired, a pause is requested,
    /// or the hart waits for an interrupt that is not pending. Returns the
    /// number of retired instructions.
    pub fn run_for(&mut self, max: u64) -> u64 {
        let start = self.stats.retired;
        let mut cycles = 0;
        while cycles < max {
            let done = self.stats.retired - start;
            if done >= max || self.shared.has_events() {
                break;
            }
            self.step_within(max - done);
            if self.wfi {
                self.update_timer_irqs();
                if !self.interrupt_wakes() {
                    break;
                }
            }
            cycles += 1;
        }
        self.stats.retired - start
    }

    /// One dispatch cycle: a single instruction, a taken interrupt, or one
    /// compiled block.
    pub fn step(&mut self) {
        self.step_within(MAX_BLOCK_INSTS as u64);
    }

    fn step_within(&mut self, budget: u64) {
        self.sync_code_epoch();

        self.since_timer += 1;
        if self.irq_check || self.since_timer >= TIMER_CHECK_INTERVAL {
            self.since_timer = 0;
            self.update_timer_irqs();
        }
        if self.wfi {
            self.update_timer_irqs();
            if !self.interrupt_wakes() {
                return;
            }
            self.wfi = false;
            self.irq_check = true;
        }
        if (self.irq_check || self.mip() & self.csr.mie != 0) && self.check_interrupts() {
            self.builder = None;
            return;
        }

        if self.caps.jit {
            if self.builder.as_ref().is_some_and(|b| b.next_pc() != self.pc) {
                self.finalize_block();
            }
            if self.run_block(budget) {
                return;
            }
        }
        self.interpret();
    }

    fn interpret(&mut self) {
        let pc = self.pc;
        let fetched = match self.fetch() {
            Ok(f) => f,
            Err(trap) => {
                // A fetch fault abandons the block being accumulated.
                self.builder = None;
                self.trap(trap);
                self.retire(false);
                return;
            }
        };

        let candidate = self.block_candidate(pc, &fetched);
        if self.caps.jit {
            if !candidate {
                self.finalize_block();
            } else if self.builder.is_none() {
                self.begin_block(pc);
            }
        }

        match self.execute(fetched) {
            Ok(()) => {
                if candidate {
                    self.extend_block(pc, fetched);
                }
                self.retire(true);
            }
            Err(trap) => {
                // Keep what was accumulated before the faulting instruction.
                self.finalize_block();
                self.trap(trap);
                self.retire(false);
            }
        }
    }

    /// End-of-instruction bookkeeping: x0, trap redirect, counters.
    #[inline(always)]
    pub(crate) fn retire(&mut self, completed: bool) {
        self.regs[0] = 0;
        self.commit_trap();
        let inhibit = self.csr.mcountinhibit;
        if inhibit & MCOUNTINHIBIT_CY == 0 {
            self.csr.mcycle = self.csr.mcycle.wrapping_add(1);
        }
        if completed {
            if inhibit & MCOUNTINHIBIT_IR == 0 {
                self.csr.minstret = self.csr.minstret.wrapping_add(1);
            }
            self.stats.retired += 1;
        }
    }

    /// Drop compiled blocks once any hart wrote to a code page.
    fn sync_code_epoch(&mut self) {
        let epoch = self.ram.code_epoch();
        if epoch != self.code_epoch {
            trace!("hart {}: code epoch {} -> {}", self.id(), self.code_epoch, epoch);
            self.code_epoch = epoch;
            self.blocks.invalidate_all();
            self.builder = None;
        }
    }

    /// Recompute MTIP (and STIP when Sstc is enabled) from the timer.
    pub(crate) fn update_timer_irqs(&mut self) {
        let now = self.timer.now();
        if now >= self.shared.mtimecmp() {
            self.shared.raise_interrupt(MIP_MTIP);
        } else {
            self.shared.clear_interrupt(MIP_MTIP);
        }
        if self.stce() {
            if now >= self.csr.stimecmp {
                self.shared.raise_interrupt(MIP_STIP);
            } else {
                self.shared.clear_interrupt(MIP_STIP);
            }
        }
    }

    /// WFI resumes on any locally enabled pending interrupt, whatever the
    /// global enables say.
    #[inline]
    fn interrupt_wakes(&self) -> bool {
        self.mip() & self.csr.mie != 0
    }

    /// Sleep until an interrupt, an event, or the nearer timer deadline.
    fn wait_for_interrupt(&mut self) {
        self.update_timer_irqs();
        if self.interrupt_wakes() {
            self.wfi = false;
            return;
        }

        let now = self.timer.now();
        let mut deadline = self.shared.mtimecmp();
        if self.stce() {
            deadline = deadline.min(self.csr.stimecmp);
        }
        let timeout = self.timer.ticks_to_duration(deadline.saturating_sub(now)).min(MAX_SLEEP);
        let mie = self.csr.mie;
        self.shared.sleep(timeout, |s| s.pending() & mie == 0 && !s.has_events());

        self.update_timer_irqs();
        if self.interrupt_wakes() {
            self.wfi = false;
        }
    }
}
