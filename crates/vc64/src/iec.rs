//! IEC serial bus between CIA2 and the drive's VIA1.
//!
//! Three open-collector lines: ATN, CLK, DATA. Each side can pull a line
//! low independently; a line is high only when nobody grounds it. Either
//! side marks the bus dirty when its outputs change, and the combined
//! state is recomputed on the next relevant half-cycle.
//!
//! C64 side (CIA2 port A): bit 3 = ATN out, bit 4 = CLK out,
//! bit 5 = DATA out (1 = pull low); bits 6/7 read CLK/DATA back.
//! Drive side (VIA1 port B): bit 1 = DATA out, bit 3 = CLK out,
//! bit 4 = ATN acknowledge (pulls DATA while ATN is asserted).

use crate::snapshot::{Reader, Writer};
use crate::error::Result;

/// The three-line bus with its per-side pull-downs.
pub struct IecBus {
    /// Pull-downs: [c64, drive]. true = pulling the line low.
    atn_pulls: [bool; 2],
    clk_pulls: [bool; 2],
    data_pulls: [bool; 2],
    /// Set when the C64 side wrote CIA2 PA; consumed on the low phase.
    dirty_c64_side: bool,
    /// Set when the drive side wrote VIA1 PB; consumed on the drive cycle.
    dirty_drive_side: bool,
}

impl IecBus {
    /// All lines released (high).
    #[must_use]
    pub fn new() -> Self {
        Self {
            atn_pulls: [false; 2],
            clk_pulls: [false; 2],
            data_pulls: [false; 2],
            dirty_c64_side: false,
            dirty_drive_side: false,
        }
    }

    /// Flag a pending C64-side output change.
    pub fn set_dirty_c64_side(&mut self) {
        self.dirty_c64_side = true;
    }

    /// Flag a pending drive-side output change.
    pub fn set_dirty_drive_side(&mut self) {
        self.dirty_drive_side = true;
    }

    #[must_use]
    pub fn is_dirty_c64_side(&self) -> bool {
        self.dirty_c64_side
    }

    #[must_use]
    pub fn is_dirty_drive_side(&self) -> bool {
        self.dirty_drive_side
    }

    /// Recompute the C64-side pulls from CIA2 port A output bits.
    pub fn update_c64_side(&mut self, cia2_pa_out: u8) {
        self.atn_pulls[0] = cia2_pa_out & 0x08 != 0;
        self.clk_pulls[0] = cia2_pa_out & 0x10 != 0;
        self.data_pulls[0] = cia2_pa_out & 0x20 != 0;
        self.dirty_c64_side = false;
    }

    /// Recompute the drive-side pulls from VIA1 port B output bits.
    ///
    /// The ATN-acknowledge bit grounds DATA through a gate whenever ATN
    /// is asserted on the bus, independent of the data-out bit.
    pub fn update_drive_side(&mut self, via1_pb_out: u8) {
        let atn_asserted = !self.atn();
        let atn_ack = via1_pb_out & 0x10 != 0;
        self.data_pulls[1] = (via1_pb_out & 0x02 != 0) || (atn_ack && atn_asserted);
        self.clk_pulls[1] = via1_pb_out & 0x08 != 0;
        self.dirty_drive_side = false;
    }

    // Line state: true = high (released).

    #[must_use]
    pub fn atn(&self) -> bool {
        !self.atn_pulls[0] && !self.atn_pulls[1]
    }

    #[must_use]
    pub fn clk(&self) -> bool {
        !self.clk_pulls[0] && !self.clk_pulls[1]
    }

    #[must_use]
    pub fn data(&self) -> bool {
        !self.data_pulls[0] && !self.data_pulls[1]
    }

    /// Whether a transfer is plausibly in progress. Drives the warp-load
    /// heuristic: any grounded line means somebody is talking.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.atn() || !self.clk() || !self.data()
    }

    /// Input bits for CIA2 port A (bit 6 = CLK, bit 7 = DATA, high = released).
    #[must_use]
    pub fn cia2_port_a_in(&self) -> u8 {
        let mut bits = 0x3F;
        if self.clk() {
            bits |= 0x40;
        }
        if self.data() {
            bits |= 0x80;
        }
        bits
    }

    /// Input bits for VIA1 port B (bit 0 = DATA, bit 2 = CLK inverted:
    /// 1 when the line is low; bit 7 = ATN level).
    #[must_use]
    pub fn via1_port_b_in(&self) -> u8 {
        let mut bits = 0x1A; // output positions float high
        if !self.data() {
            bits |= 0x01;
        }
        if !self.clk() {
            bits |= 0x04;
        }
        if self.atn() {
            bits |= 0x80;
        }
        bits | 0x60
    }

    pub(crate) fn serialize(&self, w: &mut Writer) {
        for i in 0..2 {
            w.bool(self.atn_pulls[i]);
            w.bool(self.clk_pulls[i]);
            w.bool(self.data_pulls[i]);
        }
        w.bool(self.dirty_c64_side);
        w.bool(self.dirty_drive_side);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        for i in 0..2 {
            self.atn_pulls[i] = r.bool()?;
            self.clk_pulls[i] = r.bool()?;
            self.data_pulls[i] = r.bool()?;
        }
        self.dirty_c64_side = r.bool()?;
        self.dirty_drive_side = r.bool()?;
        Ok(())
    }
}

impl Default for IecBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_start_high_and_idle() {
        let bus = IecBus::new();
        assert!(bus.atn() && bus.clk() && bus.data());
        assert!(!bus.is_busy());
    }

    #[test]
    fn c64_pulls_via_cia2_bits() {
        let mut bus = IecBus::new();
        bus.update_c64_side(0x08); // ATN out
        assert!(!bus.atn());
        assert!(bus.clk() && bus.data());
        assert!(bus.is_busy());
    }

    #[test]
    fn wired_or_needs_both_released() {
        let mut bus = IecBus::new();
        bus.update_c64_side(0x10); // C64 pulls CLK
        bus.update_drive_side(0x08); // drive pulls CLK
        assert!(!bus.clk());
        bus.update_c64_side(0x00);
        assert!(!bus.clk()); // drive still holds it
        bus.update_drive_side(0x00);
        assert!(bus.clk());
    }

    #[test]
    fn atn_ack_grounds_data_only_while_atn_low() {
        let mut bus = IecBus::new();
        bus.update_drive_side(0x10); // ATN ack set, ATN released
        assert!(bus.data());
        bus.update_c64_side(0x08); // assert ATN
        bus.update_drive_side(0x10);
        assert!(!bus.data());
    }

    #[test]
    fn dirty_flags_consumed_by_update() {
        let mut bus = IecBus::new();
        bus.set_dirty_c64_side();
        assert!(bus.is_dirty_c64_side());
        bus.update_c64_side(0);
        assert!(!bus.is_dirty_c64_side());
    }

    #[test]
    fn drive_input_bits_reflect_lines() {
        let mut bus = IecBus::new();
        bus.update_c64_side(0x18); // ATN + CLK low
        let pb = bus.via1_port_b_in();
        assert_eq!(pb & 0x01, 0); // DATA high -> bit 0 clear
        assert_ne!(pb & 0x04, 0); // CLK low -> bit 2 set
        assert_eq!(pb & 0x80, 0); // ATN low -> bit 7 clear
    }
}
