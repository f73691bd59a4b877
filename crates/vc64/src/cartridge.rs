//! CRT cartridge images and the per-variant runtime behaviour.
//!
//! The CRT container: a 64-byte header (`"C64 CARTRIDGE   "`, header
//! length, version, hardware type, EXROM/GAME levels, name) followed by
//! CHIP packets (`"CHIP"`, length, chip type, bank, load address, size,
//! data). All multi-byte header fields are big-endian.
//!
//! Each hardware type is a closed variant with its own register
//! semantics; they share the narrow expansion-port contract (ROML/ROMH
//! peeks, I/O 1/2 accesses, the GAME/EXROM lines). The variant state
//! lives in a tagged union so dispatch is a plain match and snapshot
//! layout is fixed per variant.

use crate::error::{Error, Result};
use crate::snapshot::{Reader, Writer};

const CRT_SIGNATURE: &[u8; 16] = b"C64 CARTRIDGE   ";
const CHIP_SIGNATURE: &[u8; 4] = b"CHIP";

/// StarDOS models its ROM enable with an RC charge approximated by
/// linear accumulation. The constants are deliberately coarse and named
/// for tuning.
const STARDOS_CHARGE_STEP: u32 = 64;
const STARDOS_DISCHARGE_STEP: u32 = 64;
const STARDOS_LEAK_PER_FRAME: u32 = 8;
const STARDOS_ENABLE_THRESHOLD: u32 = 256;
const STARDOS_VOLTAGE_MAX: u32 = 512;

/// Per-variant state. The payload is everything beyond the shared ROM
/// banks and line levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// Type 0: fixed 8/16 KiB, no side effects.
    Normal,
    /// Type 1 (hardware v4): control register at $DE00, freeze button,
    /// 8 KiB on-board RAM mappable over ROML.
    ActionReplay { control: u8 },
    /// Type 2: GAME/EXROM keyed by I/O address bit 1, 128 B RAM in I/O 2.
    KcsPower,
    /// Type 3: four 16 KiB banks, control register at $DFFF.
    FinalCartridge3 { control: u8 },
    /// Type 4: $DE00 read -> 8 KiB, write -> 16 KiB.
    SimonsBasic,
    /// Type 5: low 6 bits of a $DE00 write select one of 64 ROML banks.
    Ocean,
    /// Type 7: scrambled bank bits at $DE00; $86 disables.
    FunPlay,
    /// Type 8: bank + mode register at $DF00.
    SuperGames,
    /// Type 16: I/O reads serve ROML pages; I/O writes flip the lines.
    WarpSpeed,
    /// Type 18: reading ROML halves latches the ROMH bank.
    Zaxxon,
    /// Type 19: bit 7 of $DE00 disables, low nibble selects the bank.
    MagicDesk,
    /// Type 21: $DE00 selects bank 0-3 and one of three configurations.
    Comal80,
    /// Type 25: freeze-to-ultimax cartridge, I/O reads reconfigure.
    FreezeFrame,
    /// Type 31: RC-charge controlled ROML enable.
    StarDos { voltage: u32 },
    /// Type 60: banked RAM window at $DE00-$DEFF, latches in I/O 2.
    GeoRam { bank: u8, page: u8 },
}

impl Variant {
    fn from_hardware_type(hw_type: u16) -> Result<Self> {
        Ok(match hw_type {
            0 => Variant::Normal,
            1 => Variant::ActionReplay { control: 0 },
            2 => Variant::KcsPower,
            3 => Variant::FinalCartridge3 { control: 0 },
            4 => Variant::SimonsBasic,
            5 => Variant::Ocean,
            7 => Variant::FunPlay,
            8 => Variant::SuperGames,
            16 => Variant::WarpSpeed,
            18 => Variant::Zaxxon,
            19 => Variant::MagicDesk,
            21 => Variant::Comal80,
            25 => Variant::FreezeFrame,
            31 => Variant::StarDos { voltage: 0 },
            60 => Variant::GeoRam { bank: 0, page: 0 },
            other => return Err(Error::UnsupportedCartridge(other)),
        })
    }

    fn tag(&self) -> u8 {
        match self {
            Variant::Normal => 0,
            Variant::ActionReplay { .. } => 1,
            Variant::KcsPower => 2,
            Variant::FinalCartridge3 { .. } => 3,
            Variant::SimonsBasic => 4,
            Variant::Ocean => 5,
            Variant::FunPlay => 7,
            Variant::SuperGames => 8,
            Variant::WarpSpeed => 16,
            Variant::Zaxxon => 18,
            Variant::MagicDesk => 19,
            Variant::Comal80 => 21,
            Variant::FreezeFrame => 25,
            Variant::StarDos { .. } => 31,
            Variant::GeoRam { .. } => 60,
        }
    }

    /// On-board RAM size for the variant.
    fn ram_capacity(&self) -> usize {
        match self {
            Variant::ActionReplay { .. } => 0x2000,
            Variant::KcsPower => 0x80,
            Variant::GeoRam { .. } => 0x80000, // 512 KiB model
            _ => 0,
        }
    }
}

/// An attached cartridge: parsed CHIP banks plus runtime state.
pub struct Cartridge {
    pub variant: Variant,
    /// ROML banks (up to 64 x 8 KiB; Zaxxon uses a 4 KiB image).
    roml: Vec<Vec<u8>>,
    /// ROMH banks.
    romh: Vec<Vec<u8>>,
    /// Current bank index for the bank-switched variants.
    bank: usize,
    /// Zaxxon's implicitly latched ROMH bank.
    romh_bank: usize,
    /// On-board RAM (size fixed per variant).
    ram: Vec<u8>,
    /// GAME line level driven by the cartridge (true = high).
    game_line: bool,
    /// EXROM line level driven by the cartridge.
    exrom_line: bool,
    /// Initial line levels from the CRT header, restored on reset.
    initial_game: bool,
    initial_exrom: bool,
    /// Cartridge name from the header.
    pub name: String,
}

impl Cartridge {
    /// Parse a CRT image.
    pub fn from_crt(data: &[u8]) -> Result<Self> {
        if data.len() < 0x40 {
            return Err(Error::image("CRT", "file shorter than the header"));
        }
        if &data[0..16] != CRT_SIGNATURE {
            return Err(Error::image("CRT", "bad signature"));
        }
        let header_len = read_be_u32(data, 0x10) as usize;
        if !(0x20..=data.len()).contains(&header_len) {
            return Err(Error::image("CRT", format!("header length {header_len}")));
        }
        let hw_type = read_be_u16(data, 0x16);
        let variant = Variant::from_hardware_type(hw_type)?;
        let exrom = data[0x18] != 0;
        let game = data[0x19] != 0;
        let name_bytes = &data[0x20..0x40];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(32);
        let name = String::from_utf8_lossy(&name_bytes[..name_end])
            .trim()
            .to_string();

        let mut roml: Vec<Vec<u8>> = Vec::new();
        let mut romh: Vec<Vec<u8>> = Vec::new();
        let mut offset = header_len;
        while offset + 0x10 <= data.len() {
            if &data[offset..offset + 4] != CHIP_SIGNATURE {
                return Err(Error::image(
                    "CRT",
                    format!("missing CHIP signature at offset {offset}"),
                ));
            }
            let packet_len = read_be_u32(data, offset + 4) as usize;
            let bank = read_be_u16(data, offset + 0x0A) as usize;
            let load_addr = read_be_u16(data, offset + 0x0C);
            let rom_size = read_be_u16(data, offset + 0x0E) as usize;
            if packet_len < 0x10 + rom_size || offset + packet_len > data.len() {
                return Err(Error::image(
                    "CRT",
                    format!("truncated CHIP packet at offset {offset}"),
                ));
            }
            if bank >= 64 {
                return Err(Error::image("CRT", format!("bank {bank} out of range")));
            }
            let rom = data[offset + 0x10..offset + 0x10 + rom_size].to_vec();
            match load_addr {
                0x8000 => {
                    // A 16 KiB chip covers both windows.
                    if rom.len() > 0x2000 {
                        store_bank(&mut roml, bank, rom[..0x2000].to_vec());
                        store_bank(&mut romh, bank, rom[0x2000..].to_vec());
                    } else {
                        store_bank(&mut roml, bank, rom);
                    }
                }
                0xA000 | 0xE000 => store_bank(&mut romh, bank, rom),
                other => {
                    return Err(Error::image(
                        "CRT",
                        format!("unexpected CHIP load address ${other:04X}"),
                    ));
                }
            }
            offset += packet_len;
        }

        if roml.is_empty() && romh.is_empty() {
            return Err(Error::image("CRT", "no CHIP packets"));
        }

        let ram = vec![0; variant.ram_capacity()];
        let mut cart = Self {
            variant,
            roml,
            romh,
            bank: 0,
            romh_bank: 0,
            ram,
            game_line: game,
            exrom_line: exrom,
            initial_game: game,
            initial_exrom: exrom,
            name,
        };
        cart.reset();
        Ok(cart)
    }

    /// Restore the power-on configuration. ROM banks and (battery
    /// backed) GeoRAM contents survive.
    pub fn reset(&mut self) {
        self.bank = 0;
        self.romh_bank = 0;
        self.game_line = self.initial_game;
        self.exrom_line = self.initial_exrom;
        match &mut self.variant {
            Variant::ActionReplay { control } => {
                *control = 0;
                // Boots in 8 KiB configuration.
                self.game_line = true;
                self.exrom_line = false;
            }
            Variant::FinalCartridge3 { control } => {
                *control = 0;
                self.game_line = false;
                self.exrom_line = false;
            }
            Variant::KcsPower => {
                self.ram.fill(0xFF);
                self.game_line = false;
                self.exrom_line = false;
            }
            Variant::SimonsBasic => {
                self.game_line = true;
                self.exrom_line = false;
            }
            Variant::Comal80 => {
                self.game_line = false;
                self.exrom_line = false;
            }
            Variant::WarpSpeed => {
                self.game_line = false;
                self.exrom_line = false;
            }
            Variant::StarDos { voltage } => {
                *voltage = 0;
                self.game_line = true;
                self.exrom_line = true;
            }
            Variant::GeoRam { bank, page } => {
                *bank = 0;
                *page = 0;
                self.game_line = true;
                self.exrom_line = true;
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn game_line(&self) -> bool {
        self.game_line
    }

    #[must_use]
    pub fn exrom_line(&self) -> bool {
        self.exrom_line
    }

    fn roml_byte(&self, bank: usize, offset: usize) -> u8 {
        match self.roml.get(bank) {
            Some(rom) if !rom.is_empty() => rom[offset % rom.len()],
            _ => 0xFF,
        }
    }

    fn romh_byte(&self, bank: usize, offset: usize) -> u8 {
        match self.romh.get(bank) {
            Some(rom) if !rom.is_empty() => rom[offset % rom.len()],
            _ => 0xFF,
        }
    }

    /// Read through the ROML window ($8000-$9FFF). Zaxxon latches its
    /// ROMH bank from the half being read, so this takes `&mut`.
    pub fn peek_roml(&mut self, offset: u16) -> u8 {
        let offset = (offset & 0x1FFF) as usize;
        match &self.variant {
            Variant::Zaxxon => {
                self.romh_bank = usize::from(offset >= 0x1000);
                self.roml_byte(0, offset & 0x0FFF)
            }
            Variant::ActionReplay { control } => {
                if control & 0x20 != 0 {
                    self.ram[offset]
                } else {
                    self.roml_byte(self.bank, offset)
                }
            }
            Variant::StarDos { voltage } => {
                if *voltage >= STARDOS_ENABLE_THRESHOLD {
                    self.roml_byte(0, offset)
                } else {
                    0xFF
                }
            }
            _ => self.roml_byte(self.bank, offset),
        }
    }

    /// Read through the ROMH window ($A000 or $E000 in Ultimax).
    pub fn peek_romh(&mut self, offset: u16) -> u8 {
        let offset = (offset & 0x1FFF) as usize;
        match self.variant {
            Variant::Zaxxon => self.romh_byte(self.romh_bank, offset),
            Variant::Normal | Variant::SimonsBasic | Variant::FreezeFrame => {
                self.romh_byte(0, offset)
            }
            _ => self.romh_byte(self.bank, offset),
        }
    }

    /// Debugger peeks without side effects.
    #[must_use]
    pub fn spy_roml(&self, offset: u16) -> u8 {
        let offset = (offset & 0x1FFF) as usize;
        match self.variant {
            Variant::Zaxxon => self.roml_byte(0, offset & 0x0FFF),
            _ => self.roml_byte(self.bank, offset),
        }
    }

    /// Write into the ROML window (Ultimax or RAM-backed variants).
    pub fn poke_roml(&mut self, offset: u16, value: u8) {
        if let Variant::ActionReplay { control } = &self.variant {
            if control & 0x20 != 0 {
                self.ram[(offset & 0x1FFF) as usize] = value;
            }
        }
    }

    /// Write into the ROMH window. ROM ignores it.
    pub fn poke_romh(&mut self, _offset: u16, _value: u8) {}

    /// Read from I/O 1 ($DE00-$DEFF).
    pub fn peek_io1(&mut self, addr: u16) -> u8 {
        match &mut self.variant {
            Variant::SimonsBasic => {
                // Reading flips back to the 8 KiB configuration.
                self.game_line = true;
                0xFF
            }
            Variant::KcsPower => {
                self.game_line = true;
                self.exrom_line = addr & 0x02 != 0;
                self.roml_byte(0, 0x1E00 | (addr & 0xFF) as usize)
            }
            Variant::WarpSpeed => self.roml_byte(self.bank, 0x1E00 | (addr & 0xFF) as usize),
            Variant::FreezeFrame => {
                self.game_line = true;
                self.exrom_line = false;
                0
            }
            Variant::FinalCartridge3 { .. } => {
                self.roml_byte(self.bank, 0x1E00 | (addr & 0xFF) as usize)
            }
            Variant::MagicDesk | Variant::Comal80 => self.bank as u8,
            Variant::StarDos { voltage } => {
                *voltage = (*voltage + STARDOS_CHARGE_STEP).min(STARDOS_VOLTAGE_MAX);
                let v = *voltage;
                self.update_stardos_lines(v);
                0
            }
            Variant::GeoRam { bank, page } => {
                let index = georam_offset(*bank, *page, addr, self.ram.len());
                self.ram[index]
            }
            _ => 0xFF,
        }
    }

    /// Read from I/O 2 ($DF00-$DFFF).
    pub fn peek_io2(&mut self, addr: u16) -> u8 {
        match &mut self.variant {
            Variant::KcsPower => self.ram[(addr & 0x7F) as usize],
            Variant::ActionReplay { control } => {
                let offset = 0x1F00 | (addr & 0xFF) as usize;
                if *control & 0x20 != 0 {
                    self.ram[offset]
                } else {
                    self.roml_byte(self.bank, offset)
                }
            }
            Variant::WarpSpeed => self.roml_byte(self.bank, 0x1F00 | (addr & 0xFF) as usize),
            Variant::FinalCartridge3 { .. } => {
                self.roml_byte(self.bank, 0x1F00 | (addr & 0xFF) as usize)
            }
            Variant::FreezeFrame => {
                self.game_line = true;
                self.exrom_line = true;
                0
            }
            Variant::StarDos { voltage } => {
                *voltage = voltage.saturating_sub(STARDOS_DISCHARGE_STEP);
                let v = *voltage;
                self.update_stardos_lines(v);
                0
            }
            _ => 0xFF,
        }
    }

    /// Write to I/O 1 ($DE00-$DEFF).
    pub fn poke_io1(&mut self, addr: u16, value: u8) {
        match &mut self.variant {
            Variant::ActionReplay { control } => {
                if addr == 0xDE00 {
                    *control = value;
                    self.bank = usize::from((value >> 3) & 0x03);
                    if value & 0x04 != 0 {
                        // Disabled: both lines released.
                        self.game_line = true;
                        self.exrom_line = true;
                    } else {
                        self.game_line = value & 0x01 == 0;
                        self.exrom_line = value & 0x02 != 0;
                    }
                }
            }
            Variant::KcsPower => {
                self.game_line = false;
                self.exrom_line = addr & 0x02 != 0;
            }
            Variant::SimonsBasic => {
                if addr == 0xDE00 {
                    // Writing enables the 16 KiB configuration.
                    self.game_line = false;
                }
            }
            Variant::Ocean => {
                if addr == 0xDE00 {
                    self.bank = usize::from(value & 0x3F);
                }
            }
            Variant::FunPlay => {
                if addr == 0xDE00 {
                    if value == 0x86 {
                        self.game_line = true;
                        self.exrom_line = true;
                    } else {
                        // Bit scramble: b2 b1 b0 <- bits 5 4 3, b3 <- bit 0.
                        self.bank = usize::from(((value >> 3) & 0x07) | ((value << 3) & 0x08));
                    }
                }
            }
            Variant::WarpSpeed => {
                self.game_line = false;
                self.exrom_line = false;
            }
            Variant::MagicDesk => {
                if addr == 0xDE00 {
                    self.bank = usize::from(value & 0x0F);
                    self.exrom_line = value & 0x80 != 0;
                }
            }
            Variant::Comal80 => {
                self.bank = usize::from(value & 0x03);
                match value & 0xE0 {
                    0xE0 => {
                        self.game_line = true;
                        self.exrom_line = true;
                    }
                    0x40 => {
                        self.game_line = true;
                        self.exrom_line = false;
                    }
                    _ => {
                        self.game_line = false;
                        self.exrom_line = false;
                    }
                }
            }
            Variant::FreezeFrame => {
                self.game_line = true;
                self.exrom_line = false;
            }
            Variant::StarDos { voltage } => {
                *voltage = (*voltage + STARDOS_CHARGE_STEP).min(STARDOS_VOLTAGE_MAX);
                let v = *voltage;
                self.update_stardos_lines(v);
            }
            Variant::GeoRam { bank, page } => {
                let index = georam_offset(*bank, *page, addr, self.ram.len());
                self.ram[index] = value;
            }
            _ => {}
        }
    }

    /// Write to I/O 2 ($DF00-$DFFF).
    pub fn poke_io2(&mut self, addr: u16, value: u8) {
        match &mut self.variant {
            Variant::KcsPower => {
                if addr & 0x80 == 0 {
                    self.ram[(addr & 0x7F) as usize] = value;
                }
            }
            Variant::ActionReplay { control } => {
                if *control & 0x20 != 0 {
                    self.ram[0x1F00 | (addr & 0xFF) as usize] = value;
                }
            }
            Variant::SuperGames => {
                if addr == 0xDF00 {
                    self.bank = usize::from(value & 0x03);
                    if value & 0x04 != 0 {
                        self.game_line = true;
                        self.exrom_line = false;
                    } else {
                        self.game_line = false;
                        self.exrom_line = false;
                    }
                }
            }
            Variant::WarpSpeed => {
                self.game_line = true;
                self.exrom_line = true;
            }
            Variant::FinalCartridge3 { control } => {
                if addr == 0xDFFF && *control & 0x80 == 0 {
                    *control = value;
                    self.bank = usize::from(value & 0x03);
                    self.exrom_line = value & 0x10 != 0;
                    self.game_line = value & 0x20 != 0;
                }
            }
            Variant::StarDos { voltage } => {
                *voltage = voltage.saturating_sub(STARDOS_DISCHARGE_STEP);
                let v = *voltage;
                self.update_stardos_lines(v);
            }
            Variant::GeoRam { bank, page } => {
                if addr & 0x01 != 0 {
                    *bank = value;
                } else {
                    *page = value;
                }
            }
            _ => {}
        }
    }

    fn update_stardos_lines(&mut self, voltage: u32) {
        self.exrom_line = voltage < STARDOS_ENABLE_THRESHOLD;
    }

    /// Freeze button, where fitted. Returns `true` when the press should
    /// assert the expansion NMI line.
    pub fn press_freeze(&mut self) -> bool {
        match &mut self.variant {
            Variant::ActionReplay { control } => {
                // Freeze drops into Ultimax with the ROM banked in.
                *control = 0;
                self.bank = 0;
                self.game_line = false;
                self.exrom_line = true;
                true
            }
            Variant::FreezeFrame => {
                self.game_line = false;
                self.exrom_line = true;
                true
            }
            Variant::FinalCartridge3 { control } => {
                *control = 0;
                self.bank = 0;
                self.game_line = false;
                self.exrom_line = false;
                true
            }
            _ => false,
        }
    }

    /// End-of-frame housekeeping: analog-flavoured variants decay here.
    pub fn execute_end_of_frame(&mut self) {
        if let Variant::StarDos { voltage } = &mut self.variant {
            *voltage = voltage.saturating_sub(STARDOS_LEAK_PER_FRAME);
            let v = *voltage;
            self.update_stardos_lines(v);
        }
    }

    // --- Snapshot ---------------------------------------------------------

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u8(self.variant.tag());
        match &self.variant {
            Variant::ActionReplay { control } | Variant::FinalCartridge3 { control } => {
                w.u8(*control);
                w.u8(0);
                w.u32(0);
            }
            Variant::GeoRam { bank, page } => {
                w.u8(*bank);
                w.u8(*page);
                w.u32(0);
            }
            Variant::StarDos { voltage } => {
                w.u8(0);
                w.u8(0);
                w.u32(*voltage);
            }
            _ => {
                w.u8(0);
                w.u8(0);
                w.u32(0);
            }
        }
        w.u8(self.roml.len() as u8);
        for rom in &self.roml {
            w.blob(rom);
        }
        w.u8(self.romh.len() as u8);
        for rom in &self.romh {
            w.blob(rom);
        }
        w.u8(self.bank as u8);
        w.u8(self.romh_bank as u8);
        w.blob(&self.ram);
        w.bool(self.game_line);
        w.bool(self.exrom_line);
        w.bool(self.initial_game);
        w.bool(self.initial_exrom);
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        let a = r.u8()?;
        let b = r.u8()?;
        let voltage = r.u32()?;
        let variant = match Variant::from_hardware_type(u16::from(tag))? {
            Variant::ActionReplay { .. } => Variant::ActionReplay { control: a },
            Variant::FinalCartridge3 { .. } => Variant::FinalCartridge3 { control: a },
            Variant::GeoRam { .. } => Variant::GeoRam { bank: a, page: b },
            Variant::StarDos { .. } => Variant::StarDos { voltage },
            other => other,
        };
        let mut roml = Vec::new();
        for _ in 0..r.u8()? {
            roml.push(r.blob(0x4000)?);
        }
        let mut romh = Vec::new();
        for _ in 0..r.u8()? {
            romh.push(r.blob(0x4000)?);
        }
        let bank = usize::from(r.u8()?);
        let romh_bank = usize::from(r.u8()?);
        let ram = r.blob(0x80000)?;
        if ram.len() != variant.ram_capacity() {
            return Err(Error::Snapshot(format!(
                "cartridge RAM size {} does not match variant",
                ram.len()
            )));
        }
        Ok(Self {
            variant,
            roml,
            romh,
            bank,
            romh_bank,
            ram,
            game_line: r.bool()?,
            exrom_line: r.bool()?,
            initial_game: r.bool()?,
            initial_exrom: r.bool()?,
            name: String::new(),
        })
    }
}

fn store_bank(banks: &mut Vec<Vec<u8>>, bank: usize, rom: Vec<u8>) {
    while banks.len() <= bank {
        banks.push(Vec::new());
    }
    banks[bank] = rom;
}

fn georam_offset(bank: u8, page: u8, addr: u16, capacity: usize) -> usize {
    let bank_offset = (usize::from(bank) * 16384) % capacity.max(1);
    let page_offset = usize::from(page & 0x3F) * 256;
    (bank_offset + page_offset + usize::from(addr & 0xFF)) % capacity.max(1)
}

fn read_be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from(data[offset]) << 8 | u16::from(data[offset + 1])
}

fn read_be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from(data[offset]) << 24
        | u32::from(data[offset + 1]) << 16
        | u32::from(data[offset + 2]) << 8
        | u32::from(data[offset + 3])
}
