use std::process::ExitCode;

use clap::Parser;
use pcxt_core::machine::MachineState;
use pcxt_core::{rom, Machine};

/// Headless IBM PC/XT emulator core driver.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to an 8 KiB BIOS ROM image.
    #[arg(long)]
    bios: String,

    /// Path to a floppy disk image to load into drive A.
    #[arg(long)]
    floppy_a: Option<String>,

    /// Path to a floppy disk image to load into drive B.
    #[arg(long)]
    floppy_b: Option<String>,

    /// Load drive A's image write-protected.
    #[arg(long)]
    floppy_a_ro: bool,

    /// Load drive B's image write-protected.
    #[arg(long)]
    floppy_b_ro: bool,

    /// Number of master clock ticks to run before exiting.
    #[arg(long, default_value_t = 14_318_180)]
    ticks: u64,

    /// Raise the log level (-v = info, -vv = debug, -vvv = trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut machine = Machine::new();

    let bios = match rom::load_bios(&args.bios) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("failed to load BIOS image: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = machine.load_bios(&bios) {
        log::error!("failed to install BIOS image: {err}");
        return ExitCode::FAILURE;
    }

    for (drive, path, write_protected) in [
        (0usize, &args.floppy_a, args.floppy_a_ro),
        (1usize, &args.floppy_b, args.floppy_b_ro),
    ] {
        if let Some(path) = path {
            let image = match rom::load_floppy_image(path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!("failed to load floppy image {path}: {err}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(err) = machine.load_floppy(drive, image, write_protected) {
                log::error!("failed to install floppy image {path}: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    log::info!("running for {} master ticks", args.ticks);
    let state = machine.run_for(args.ticks);
    match state {
        MachineState::BreakpointHit => {
            log::info!(
                "stopped at CS:IP {:#06x}:{:#06x} after {} cycles",
                machine.registers().get(pcxt_core::cpu::Reg::Cs),
                machine.real_ip(),
                machine.cycle_count()
            );
        }
        MachineState::Halt => {
            log::info!(
                "guest executed HLT at CS:IP {:#06x}:{:#06x} after {} cycles",
                machine.registers().get(pcxt_core::cpu::Reg::Cs),
                machine.real_ip(),
                machine.cycle_count()
            );
        }
        _ => {
            log::info!("ran to completion after {} cycles", machine.cycle_count());
        }
    }

    ExitCode::SUCCESS
}
