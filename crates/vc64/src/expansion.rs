//! Expansion port: the seam between the memory map and a cartridge.
//!
//! The port owns at most one attached cartridge and latches the
//! open-collector GAME/EXROM levels it drives. Whenever a cartridge
//! access moves either line, the port raises a dirty flag; the system
//! bus rebuilds the memory lookup tables before the next access goes
//! through. With nothing attached both lines rest high.

use crate::cartridge::Cartridge;
use crate::error::Result;
use crate::snapshot::{Reader, Writer};

pub struct ExpansionPort {
    cartridge: Option<Cartridge>,
    /// Latched line levels (true = high).
    game_line: bool,
    exrom_line: bool,
    /// Lines changed; the memory map must be rebuilt.
    lines_dirty: bool,
}

impl ExpansionPort {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cartridge: None,
            game_line: true,
            exrom_line: true,
            lines_dirty: false,
        }
    }

    /// Attach a cartridge (replacing any present one) and drive its
    /// lines.
    pub fn attach(&mut self, cartridge: Cartridge) {
        self.cartridge = Some(cartridge);
        self.refresh_lines();
    }

    /// Detach; both lines float back high.
    pub fn detach(&mut self) {
        self.cartridge = None;
        self.refresh_lines();
    }

    #[must_use]
    pub fn has_cartridge(&self) -> bool {
        self.cartridge.is_some()
    }

    #[must_use]
    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    /// Reset the cartridge configuration (machine reset).
    pub fn reset(&mut self) {
        if let Some(cart) = &mut self.cartridge {
            cart.reset();
        }
        self.refresh_lines();
    }

    #[must_use]
    pub fn game_line(&self) -> bool {
        self.game_line
    }

    #[must_use]
    pub fn exrom_line(&self) -> bool {
        self.exrom_line
    }

    /// Consume the dirty flag; caller rebuilds the memory tables.
    pub fn take_lines_dirty(&mut self) -> bool {
        std::mem::take(&mut self.lines_dirty)
    }

    /// Re-latch the lines from the cartridge and mark dirty on change.
    fn refresh_lines(&mut self) {
        let (game, exrom) = match &self.cartridge {
            Some(cart) => (cart.game_line(), cart.exrom_line()),
            None => (true, true),
        };
        if game != self.game_line || exrom != self.exrom_line {
            self.game_line = game;
            self.exrom_line = exrom;
            self.lines_dirty = true;
            log::debug!("expansion lines: game={game} exrom={exrom}");
        }
    }

    // --- The narrow access contract ---------------------------------------

    pub fn peek_roml(&mut self, offset: u16) -> u8 {
        let value = self
            .cartridge
            .as_mut()
            .map_or(0xFF, |cart| cart.peek_roml(offset));
        self.refresh_lines();
        value
    }

    pub fn peek_romh(&mut self, offset: u16) -> u8 {
        let value = self
            .cartridge
            .as_mut()
            .map_or(0xFF, |cart| cart.peek_romh(offset));
        self.refresh_lines();
        value
    }

    pub fn poke_roml(&mut self, offset: u16, value: u8) {
        if let Some(cart) = &mut self.cartridge {
            cart.poke_roml(offset, value);
        }
    }

    pub fn poke_romh(&mut self, offset: u16, value: u8) {
        if let Some(cart) = &mut self.cartridge {
            cart.poke_romh(offset, value);
        }
    }

    pub fn peek_io1(&mut self, addr: u16) -> u8 {
        let value = self
            .cartridge
            .as_mut()
            .map_or(0xFF, |cart| cart.peek_io1(addr));
        self.refresh_lines();
        value
    }

    pub fn peek_io2(&mut self, addr: u16) -> u8 {
        let value = self
            .cartridge
            .as_mut()
            .map_or(0xFF, |cart| cart.peek_io2(addr));
        self.refresh_lines();
        value
    }

    pub fn poke_io1(&mut self, addr: u16, value: u8) {
        if let Some(cart) = &mut self.cartridge {
            cart.poke_io1(addr, value);
        }
        self.refresh_lines();
    }

    pub fn poke_io2(&mut self, addr: u16, value: u8) {
        if let Some(cart) = &mut self.cartridge {
            cart.poke_io2(addr, value);
        }
        self.refresh_lines();
    }

    /// Freeze button. Returns `true` when the NMI line should be pulled.
    pub fn press_freeze_button(&mut self) -> bool {
        let nmi = self
            .cartridge
            .as_mut()
            .is_some_and(|cart| cart.press_freeze());
        self.refresh_lines();
        nmi
    }

    /// Per-frame housekeeping (analog cartridge models decay here).
    pub fn execute_end_of_frame(&mut self) {
        if let Some(cart) = &mut self.cartridge {
            cart.execute_end_of_frame();
        }
        self.refresh_lines();
    }

    // --- Snapshot ---------------------------------------------------------

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.bool(self.cartridge.is_some());
        if let Some(cart) = &self.cartridge {
            cart.serialize(w);
        }
        w.bool(self.game_line);
        w.bool(self.exrom_line);
        w.bool(self.lines_dirty);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.cartridge = if r.bool()? {
            Some(Cartridge::deserialize(r)?)
        } else {
            None
        };
        self.game_line = r.bool()?;
        self.exrom_line = r.bool()?;
        self.lines_dirty = r.bool()?;
        Ok(())
    }
}

impl Default for ExpansionPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::test_support::{chip_packet, crt_header};

    fn normal_8k() -> Cartridge {
        let mut crt = crt_header(0, 0, 1);
        crt.extend(chip_packet(0, 0x8000, &vec![0x42; 8192]));
        Cartridge::from_crt(&crt).unwrap()
    }

    #[test]
    fn no_cartridge_floats_high() {
        let mut port = ExpansionPort::new();
        assert!(port.game_line() && port.exrom_line());
        assert_eq!(port.peek_roml(0), 0xFF);
        assert_eq!(port.peek_io1(0xDE00), 0xFF);
    }

    #[test]
    fn attach_drives_lines_and_marks_dirty() {
        let mut port = ExpansionPort::new();
        port.attach(normal_8k());
        assert!(!port.exrom_line());
        assert!(port.game_line());
        assert!(port.take_lines_dirty());
        assert!(!port.take_lines_dirty());
        assert_eq!(port.peek_roml(0), 0x42);
    }

    #[test]
    fn detach_restores_both_lines() {
        let mut port = ExpansionPort::new();
        port.attach(normal_8k());
        let _ = port.take_lines_dirty();
        port.detach();
        assert!(port.game_line() && port.exrom_line());
        assert!(port.take_lines_dirty());
    }

    #[test]
    fn line_change_through_io_write_marks_dirty() {
        let mut crt = crt_header(19, 0, 1); // Magic Desk
        for bank in 0..2u16 {
            crt.extend(chip_packet(bank, 0x8000, &vec![bank as u8; 8192]));
        }
        let mut port = ExpansionPort::new();
        port.attach(Cartridge::from_crt(&crt).unwrap());
        let _ = port.take_lines_dirty();
        port.poke_io1(0xDE00, 0x80); // disable -> EXROM high
        assert!(port.exrom_line());
        assert!(port.take_lines_dirty());
    }

    #[test]
    fn snapshot_roundtrip_with_and_without_cartridge() {
        let mut port = ExpansionPort::new();
        let mut w = Writer::new();
        port.serialize(&mut w);
        let empty = w.into_bytes();
        let mut restored = ExpansionPort::new();
        restored.deserialize(&mut Reader::new(&empty)).unwrap();
        assert!(!restored.has_cartridge());

        port.attach(normal_8k());
        let mut w = Writer::new();
        port.serialize(&mut w);
        let full = w.into_bytes();
        let mut restored = ExpansionPort::new();
        restored.deserialize(&mut Reader::new(&full)).unwrap();
        assert!(restored.has_cartridge());
        assert_eq!(restored.peek_roml(5), 0x42);
    }
}
