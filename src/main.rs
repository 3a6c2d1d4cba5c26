use std::env;
use std::error::Error;
use std::fs;
use std::process;
use std::thread;
use std::time::Duration;

use log::info;

use rvhart::{Machine, MachineConfig};

fn parse_u64(s: &str) -> Result<u64, Box<dyn Error>> {
    let value = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} <image> [--rv32] [--harts <n>] [--ram <mb>] [--base <addr>] [--jit] \
         [--steps <n> | --seconds <s>]",
        program
    );
    process::exit(1);
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = MachineConfig::default();
    let mut image_path = String::new();
    let mut steps: Option<u64> = None;
    let mut seconds = 1;

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| args.get(i + 1).map(String::as_str).unwrap_or_else(|| usage(&args[0]));
        match args[i].as_str() {
            "--rv32" => config = MachineConfig { ram_base: config.ram_base, ..MachineConfig::rv32() },
            "--jit" => config.jit = true,
            "--harts" => {
                config.harts = value(i).parse()?;
                i += 1;
            }
            "--ram" => {
                config.ram_size = parse_u64(value(i))? << 20;
                i += 1;
            }
            "--base" => {
                config.ram_base = parse_u64(value(i))?;
                config.reset_pc = config.ram_base;
                i += 1;
            }
            "--steps" => {
                steps = Some(parse_u64(value(i))?);
                i += 1;
            }
            "--seconds" => {
                seconds = parse_u64(value(i))?;
                i += 1;
            }
            arg if !arg.starts_with('-') => image_path = arg.to_string(),
            other => {
                eprintln!("Unknown argument: {}", other);
                usage(&args[0]);
            }
        }
        i += 1;
    }
    if image_path.is_empty() {
        usage(&args[0]);
    }

    let mut machine = Machine::new(config)?;
    let data = fs::read(&image_path)?;
    let base = machine.config().ram_base;
    machine.load_image(base, &data)?;

    match steps {
        Some(n) => {
            let retired = machine.run_for(n)?;
            info!("retired {} instructions", retired);
        }
        None => {
            machine.start()?;
            thread::sleep(Duration::from_secs(seconds));
            machine.pause()?;
        }
    }

    for id in 0..machine.hart_count() {
        if let Some(hart) = machine.hart(id) {
            let stats = hart.stats();
            println!(
                "hart {}: pc={:#x} priv={:?} retired={} traps={} interrupts={} tlb {}/{} pt_reads={} blocks {}/{}",
                id,
                hart.pc,
                hart.privilege(),
                stats.retired,
                stats.traps,
                stats.interrupts,
                stats.tlb_hits,
                stats.tlb_misses,
                stats.pt_reads,
                stats.blocks_compiled,
                stats.blocks_executed
            );
        }
    }
    Ok(())
}
