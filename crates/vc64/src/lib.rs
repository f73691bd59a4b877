//! Cycle-accurate Commodore 64 + VC1541 emulation core.
//!
//! The machine advances one CPU cycle at a time with a fixed half-cycle
//! order: on the low phi2 phase the VIC-II runs (and may stall the CPU
//! for badline DMA), then both CIAs, then the IEC bus settles; on the
//! high phase the CPU executes one microcycle, the drive advances by the
//! main cycle's picosecond duration, and the datasette moves. 312 x 63
//! cycles make a PAL frame (~50.12 Hz); NTSC revisions run 262/263
//! lines of 64/65 cycles.
//!
//! The crate is the core only: it renders frames into a double-buffered
//! pixel array, streams SID samples into a lock-free ring, posts
//! [`messages::Message`] events, and accepts key/joystick/mouse input
//! and parsed media images (CRT, D64, PRG, T64). Hosts own the window,
//! the audio device and the file formats' outer parsing.

pub mod c64;
pub mod cartridge;
pub mod cia;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod d64;
pub mod datasette;
pub mod drive;
pub mod error;
pub mod executor;
pub mod expansion;
pub mod iec;
pub mod keyboard;
pub mod memory;
pub mod messages;
pub mod mouse;
pub mod palette;
pub mod prg;
pub mod sid;
pub mod snapshot;
pub mod t64;
pub mod via;
pub mod vic;

pub use c64::{C64Bus, C64};
pub use cartridge::Cartridge;
pub use config::{C64Config, C64Model, RomSet};
pub use d64::D64;
pub use error::{Error, Result};
pub use executor::Executor;
pub use messages::Message;
pub use prg::Prg;
pub use t64::T64;
