//! Headless CLI harness for the vc64 core.
//!
//! Loads a ROM set, optionally attaches media, runs a number of frames
//! (or until a CPU trap), and can save a snapshot on exit.
//!
//! Exit codes: 0 success, 1 missing/invalid ROM, 2 bad media image,
//! 3 runtime trap.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use vc64::clock::MonotonicClock;
use vc64::{C64Config, C64Model, Cartridge, C64, D64, Prg, RomSet, T64};

#[derive(Parser, Debug)]
#[command(name = "vc64-runner")]
#[command(about = "Headless Commodore 64 emulator harness", long_about = None)]
struct Args {
    /// Directory containing basic.rom, chargen.rom, kernal.rom and
    /// d1541.rom
    #[arg(long)]
    roms: PathBuf,

    /// Machine model (pal, ntsc, 6569r1, 8565, 6567, 6567r56a, 8562)
    #[arg(long, default_value = "pal")]
    model: String,

    /// D64 disk image to insert
    #[arg(long)]
    disk: Option<PathBuf>,

    /// CRT cartridge image to attach
    #[arg(long)]
    cartridge: Option<PathBuf>,

    /// PRG to flash into memory after boot
    #[arg(long)]
    prg: Option<PathBuf>,

    /// T64 container; the first entry is flashed like a PRG
    #[arg(long)]
    tape: Option<PathBuf>,

    /// Frames to emulate
    #[arg(long, default_value_t = 500)]
    frames: u64,

    /// Run unthrottled
    #[arg(long)]
    warp: bool,

    /// Write a machine snapshot here on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn load_rom_set(dir: &Path) -> Result<RomSet> {
    let read = |name: &str| -> Result<Vec<u8>> {
        fs::read(dir.join(name)).with_context(|| format!("reading {name} from {dir:?}"))
    };
    let basic = read("basic.rom")?;
    let charset = read("chargen.rom")?;
    let kernal = read("kernal.rom")?;
    let drive = read("d1541.rom")?;
    Ok(RomSet::new(basic, charset, kernal, drive)?)
}

fn run(args: &Args) -> Result<u8> {
    let model = C64Model::from_name(&args.model)?;

    let roms = match load_rom_set(&args.roms) {
        Ok(roms) => roms,
        Err(err) => {
            log::error!("ROM set not usable: {err:#}");
            return Ok(1);
        }
    };

    let mut config = C64Config::new(model, roms);
    config.always_warp = args.warp;
    let mut c64 = C64::new(config)?;
    c64.set_clock(Box::new(MonotonicClock::new()));

    // Attach media before the machine starts running.
    if let Some(path) = &args.cartridge {
        let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
        match Cartridge::from_crt(&bytes) {
            Ok(cart) => {
                log::info!("cartridge attached: {}", cart.name);
                c64.attach_cartridge(cart);
                c64.reset();
            }
            Err(err) => {
                log::error!("cartridge rejected: {err}");
                return Ok(2);
            }
        }
    }
    if let Some(path) = &args.disk {
        let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
        match D64::from_bytes(&bytes) {
            Ok(d64) => c64.insert_disk(&d64),
            Err(err) => {
                log::error!("disk rejected: {err}");
                return Ok(2);
            }
        }
    }

    // PRG/T64 flashing wants BASIC to be up; give the Kernal some time,
    // then inject.
    let prg = match (&args.prg, &args.tape) {
        (Some(path), _) => {
            let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
            match Prg::from_bytes(&bytes) {
                Ok(prg) => Some(prg),
                Err(err) => {
                    log::error!("program rejected: {err}");
                    return Ok(2);
                }
            }
        }
        (None, Some(path)) => {
            let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
            match T64::from_bytes(&bytes).and_then(|t64| t64.entry_as_prg(0)) {
                Ok(prg) => Some(prg),
                Err(err) => {
                    log::error!("tape rejected: {err}");
                    return Ok(2);
                }
            }
        }
        _ => None,
    };

    let receiver = c64.message_receiver();
    let boot_frames = if prg.is_some() { 150 } else { 0 };
    let mut trapped = false;

    for frame in 0..args.frames {
        if frame == boot_frames {
            if let Some(prg) = &prg {
                log::info!("flashing PRG at ${:04X}", prg.load_address);
                c64.flash_prg(prg);
            }
        }
        if !c64.execute_one_frame() {
            log::error!(
                "CPU trapped at ${:04X} after {} cycles",
                c64.cpu.regs.pc,
                c64.cycle()
            );
            trapped = true;
            break;
        }
    }

    for message in receiver.try_iter() {
        log::debug!("message: {message:?}");
    }

    if let Some(path) = &args.snapshot {
        fs::write(path, c64.save_snapshot()).with_context(|| format!("writing {path:?}"))?;
        log::info!("snapshot written to {path:?}");
    }

    log::info!(
        "ran {} frames / {} cycles on {:?}",
        c64.frame(),
        c64.cycle(),
        c64.model()
    );
    Ok(if trapped { 3 } else { 0 })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}
