//! PRG program files.
//!
//! Two-byte little-endian load address followed by the payload, the
//! format the Kernal `LOAD` path produces and consumes.

use crate::error::{Error, Result};
use crate::memory::Memory;

/// A parsed program.
pub struct Prg {
    pub load_address: u16,
    pub data: Vec<u8>,
}

impl Prg {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 3 {
            return Err(Error::image("PRG", "shorter than header plus one byte"));
        }
        Ok(Self {
            load_address: u16::from(bytes[0]) | (u16::from(bytes[1]) << 8),
            data: bytes[2..].to_vec(),
        })
    }

    /// End address, exclusive, as the Kernal would leave it in $AE/$AF.
    #[must_use]
    pub fn end_address(&self) -> u16 {
        self.load_address.wrapping_add(self.data.len() as u16)
    }

    /// Flash the payload into RAM and fix up the BASIC pointers so a
    /// typed `RUN` finds the program.
    pub fn flash(&self, mem: &mut Memory) {
        for (i, &byte) in self.data.iter().enumerate() {
            mem.ram_write(self.load_address.wrapping_add(i as u16), byte);
        }
        let end = self.end_address();
        // Start/end of BASIC program ($2B/$2C, $2D/$2E) plus the
        // variable area pointers.
        mem.ram_write(0x2B, self.load_address as u8);
        mem.ram_write(0x2C, (self.load_address >> 8) as u8);
        for zp in [0x2D, 0x2F, 0x31] {
            mem.ram_write(zp, end as u8);
            mem.ram_write(zp + 1, (end >> 8) as u8);
        }
        mem.ram_write(0xAE, end as u8);
        mem.ram_write(0xAF, (end >> 8) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_memory() -> Memory {
        Memory::new(&vec![0; 8192], &vec![0; 4096], &vec![0; 8192])
    }

    #[test]
    fn parse_and_flash() {
        let prg = Prg::from_bytes(&[0x01, 0x08, 0x0A, 0x0B, 0x0C]).unwrap();
        assert_eq!(prg.load_address, 0x0801);
        assert_eq!(prg.end_address(), 0x0804);

        let mut mem = make_memory();
        prg.flash(&mut mem);
        assert_eq!(mem.ram_read(0x0801), 0x0A);
        assert_eq!(mem.ram_read(0x0803), 0x0C);
        // BASIC end pointer follows the program.
        assert_eq!(mem.ram_read(0x2D), 0x04);
        assert_eq!(mem.ram_read(0x2E), 0x08);
    }

    #[test]
    fn too_short_is_an_error() {
        assert!(Prg::from_bytes(&[0x01, 0x08]).is_err());
        assert!(Prg::from_bytes(&[]).is_err());
    }

    #[test]
    fn readback_matches_payload() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut bytes = vec![0x00, 0xC0];
        bytes.extend_from_slice(&payload);
        let prg = Prg::from_bytes(&bytes).unwrap();
        let mut mem = make_memory();
        prg.flash(&mut mem);
        for (i, &b) in payload.iter().enumerate() {
            assert_eq!(mem.ram_read(0xC000 + i as u16), b);
        }
    }
}
