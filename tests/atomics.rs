use std::thread;
use std::time::{Duration, Instant};

use rvhart::{Machine, MachineConfig};

const BASE: u64 = 0x8000_0000;
const COUNTER: u64 = BASE + 0x1000;
const ROUNDS: u32 = 1000;

/// Each hart adds 1 to the word at BASE + 0x1000, 1000 times, with an
/// LR/SC retry loop, then spins.
const LR_SC_INCREMENT: [u32; 9] = [
    0x0000_1517, // auipc x10, 1
    0x3E80_0593, // addi  x11, x0, 1000
    0x1005_262F, // lr.w  x12, (x10)
    0x0016_0613, // addi  x12, x12, 1
    0x18C5_26AF, // sc.w  x13, x12, (x10)
    0xFE06_9AE3, // bne   x13, x0, -12
    0xFFF5_8593, // addi  x11, x11, -1
    0xFE05_96E3, // bne   x11, x0, -20
    0x0000_006F, // jal   x0, 0
];

/// Same, with amoadd.w
const AMO_INCREMENT: [u32; 7] = [
    0x0000_1517, // auipc    x10, 1
    0x3E80_0593, // addi     x11, x0, 1000
    0x0010_0613, // addi     x12, x0, 1
    0x00C5_202F, // amoadd.w x0, x12, (x10)
    0xFFF5_8593, // addi     x11, x11, -1
    0xFE05_9CE3, // bne      x11, x0, -8
    0x0000_006F, // jal      x0, 0
];

fn program_bytes(program: &[u32]) -> Vec<u8> {
    program.iter().flat_map(|i| i.to_le_bytes()).collect()
}

/// Run `program` on `harts` threads until the counter reaches the expected
/// total or the deadline passes. Returns the final count.
fn race(program: &[u32], harts: usize, jit: bool) -> u32 {
    let config = MachineConfig { harts, jit, ram_size: 1 << 20, ..Default::default() };
    let mut machine = Machine::new(config).unwrap();
    machine.load(BASE, &program_bytes(program)).unwrap();

    let expected = ROUNDS * harts as u32;
    machine.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while machine.ram().read_u32(COUNTER) != Some(expected) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    machine.pause().unwrap();
    machine.ram().read_u32(COUNTER).unwrap()
}

#[test]
fn lr_sc_increments_are_not_lost() {
    assert_eq!(race(&LR_SC_INCREMENT, 4, false), 4 * ROUNDS);
}

#[test]
fn lr_sc_increments_with_blocks() {
    assert_eq!(race(&LR_SC_INCREMENT, 4, true), 4 * ROUNDS);
}

#[test]
fn amo_increments_are_not_lost() {
    assert_eq!(race(&AMO_INCREMENT, 4, false), 4 * ROUNDS);
}

#[test]
fn single_hart_sc_pairs_with_its_own_lr() {
    let mut machine = Machine::new(MachineConfig { ram_size: 1 << 20, ..Default::default() }).unwrap();
    let hart = machine.hart_mut(0).unwrap();
    hart.store(COUNTER, 4, 7).unwrap();
    // sc without a reservation fails and leaves memory alone
    machine.load(BASE, &program_bytes(&[0x18C5_26AF, 0x0000_006F])).unwrap();
    let hart = machine.hart_mut(0).unwrap();
    hart.regs[10] = COUNTER;
    hart.regs[12] = 99;
    hart.step();
    assert_eq!(hart.regs[13], 1);
    assert_eq!(hart.load(COUNTER, 4), Ok(7));
}

#[test]
fn host_threads_share_guest_memory() {
    let machine = Machine::new(MachineConfig { ram_size: 1 << 20, ..Default::default() }).unwrap();
    let ram = machine.ram().clone();
    let off = ram.offset_of(COUNTER, 8).unwrap();
    let barrier = std::sync::Barrier::new(4);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..10_000 {
                    ram.amo(off, 8, rvhart::AmoOp::Add, 1).unwrap();
                }
            });
        }
    });
    assert_eq!(ram.read_u64(COUNTER), Some(40_000));
}
