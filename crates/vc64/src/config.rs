//! Machine models, timing parameters and ROM sets.
//!
//! The VIC-II revision determines every timing constant in the machine:
//! cycles per rasterline, rasterlines per frame, and (because the dot
//! clock is derived from the same crystal) the CPU frequency itself.

use crate::error::{Error, Result};

/// VIC-II revision, which doubles as the machine model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C64Model {
    /// PAL 6569 R1 (early PAL).
    Pal6569R1,
    /// PAL 6569 R3.
    Pal6569R3,
    /// PAL 8565 (C64C).
    Pal8565,
    /// NTSC 6567 R56A (64 cycles, 262 lines).
    Ntsc6567R56A,
    /// NTSC 6567.
    Ntsc6567,
    /// NTSC 8562 (C64C).
    Ntsc8562,
}

impl C64Model {
    /// CPU cycles per rasterline.
    #[must_use]
    pub fn cycles_per_rasterline(self) -> u16 {
        match self {
            C64Model::Pal6569R1 | C64Model::Pal6569R3 | C64Model::Pal8565 => 63,
            C64Model::Ntsc6567R56A => 64,
            C64Model::Ntsc6567 | C64Model::Ntsc8562 => 65,
        }
    }

    /// Rasterlines per frame.
    #[must_use]
    pub fn rasterlines_per_frame(self) -> u16 {
        match self {
            C64Model::Pal6569R1 | C64Model::Pal6569R3 | C64Model::Pal8565 => 312,
            C64Model::Ntsc6567R56A => 262,
            C64Model::Ntsc6567 | C64Model::Ntsc8562 => 263,
        }
    }

    /// CPU clock in Hz.
    #[must_use]
    pub fn cpu_frequency(self) -> u32 {
        if self.is_pal() {
            985_248
        } else {
            1_022_727
        }
    }

    /// Frames per second (cycles / (lines * cycles-per-line)).
    #[must_use]
    pub fn frames_per_second(self) -> f64 {
        f64::from(self.cpu_frequency())
            / (f64::from(self.rasterlines_per_frame()) * f64::from(self.cycles_per_rasterline()))
    }

    /// Host-side frame period in nanoseconds.
    #[must_use]
    pub fn frame_delay_nanos(self) -> u64 {
        (1_000_000_000.0 / self.frames_per_second()) as u64
    }

    /// Duration of one CPU cycle in picoseconds. The 1541 advances its
    /// fixed 1 MHz clock against this, so PAL/NTSC drift is accounted
    /// exactly.
    #[must_use]
    pub fn cycle_duration_ps(self) -> u64 {
        1_000_000_000_000 / u64::from(self.cpu_frequency())
    }

    /// Power-line frequency feeding the CIA TOD pin.
    #[must_use]
    pub fn tod_frequency(self) -> u8 {
        if self.is_pal() {
            50
        } else {
            60
        }
    }

    #[must_use]
    pub fn is_pal(self) -> bool {
        matches!(
            self,
            C64Model::Pal6569R1 | C64Model::Pal6569R3 | C64Model::Pal8565
        )
    }

    /// Stable tag used in snapshots.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            C64Model::Pal6569R1 => 0,
            C64Model::Pal6569R3 => 1,
            C64Model::Pal8565 => 2,
            C64Model::Ntsc6567R56A => 3,
            C64Model::Ntsc6567 => 4,
            C64Model::Ntsc8562 => 5,
        }
    }

    /// Inverse of [`C64Model::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => C64Model::Pal6569R1,
            1 => C64Model::Pal6569R3,
            2 => C64Model::Pal8565,
            3 => C64Model::Ntsc6567R56A,
            4 => C64Model::Ntsc6567,
            5 => C64Model::Ntsc8562,
            _ => return Err(Error::UnknownModel(format!("model tag {tag}"))),
        })
    }

    /// Parse a user-facing model name (CLI).
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_lowercase().as_str() {
            "pal" | "6569" | "6569r3" => C64Model::Pal6569R3,
            "6569r1" => C64Model::Pal6569R1,
            "8565" | "c64c-pal" => C64Model::Pal8565,
            "ntsc" | "6567" => C64Model::Ntsc6567,
            "6567r56a" => C64Model::Ntsc6567R56A,
            "8562" | "c64c-ntsc" => C64Model::Ntsc8562,
            other => return Err(Error::UnknownModel(other.to_string())),
        })
    }
}

/// The four ROM images the machine needs.
pub struct RomSet {
    /// BASIC ROM, 8 KiB at $A000.
    pub basic: Vec<u8>,
    /// Character generator ROM, 4 KiB at $D000.
    pub charset: Vec<u8>,
    /// Kernal ROM, 8 KiB at $E000.
    pub kernal: Vec<u8>,
    /// 1541 DOS ROM, 16 KiB at $C000 (drive side).
    pub drive: Vec<u8>,
}

impl RomSet {
    /// Validate ROM sizes.
    pub fn new(basic: Vec<u8>, charset: Vec<u8>, kernal: Vec<u8>, drive: Vec<u8>) -> Result<Self> {
        fn check(name: &str, rom: &[u8], want: usize) -> Result<()> {
            if rom.len() != want {
                return Err(Error::Rom(format!(
                    "{name} ROM must be {want} bytes, got {}",
                    rom.len()
                )));
            }
            Ok(())
        }
        check("basic", &basic, 8192)?;
        check("character", &charset, 4096)?;
        check("kernal", &kernal, 8192)?;
        check("drive", &drive, 16384)?;
        Ok(Self {
            basic,
            charset,
            kernal,
            drive,
        })
    }
}

/// Configuration for constructing a machine.
pub struct C64Config {
    pub model: C64Model,
    pub roms: RomSet,
    /// Permanently unthrottled execution.
    pub always_warp: bool,
    /// Warp automatically while the IEC bus is busy (accelerated loading).
    pub warp_load: bool,
    /// Host audio sample rate for the SID resampler.
    pub sample_rate: u32,
}

impl C64Config {
    #[must_use]
    pub fn new(model: C64Model, roms: RomSet) -> Self {
        Self {
            model,
            roms,
            always_warp: false,
            warp_load: true,
            sample_rate: 48_000,
        }
    }
}
