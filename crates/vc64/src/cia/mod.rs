//! MOS 6526 Complex Interface Adapter.
//!
//! Two identical chips with different wiring:
//! - CIA1 ($DC00): keyboard matrix and joysticks on the ports, interrupt
//!   line to IRQ, FLAG pin on the cassette read line.
//! - CIA2 ($DD00): VIC bank select and IEC lines on port A, RS-232 on
//!   port B, interrupt line to NMI.
//!
//! Timer sources: Timer A counts phi2 or CNT edges; Timer B additionally
//! counts Timer A underflows (optionally gated by CNT). Underflows reload
//! from the latch, optionally stop (one-shot), optionally drive PB6/PB7,
//! clock the serial register, and raise their ICR bit.
//!
//! Reading the ICR returns the pending bits plus bit 7 and clears them;
//! writing it modifies the mask (bit 7 = set/clear). The interrupt line
//! follows `(pending & mask) != 0`.
//!
//! When both timers are stopped and the serial register is idle, the chip
//! parks itself: it records a wake-up cycle and the scheduler skips full
//! execution, bumping `idle_counter` instead. Any register access wakes
//! it. Since a parked chip's timers cannot move, skipping is exact.

mod tod;

pub use tod::Tod;

use crate::error::Result;
use crate::snapshot::{Reader, Writer};

/// ICR bits.
const ICR_TA: u8 = 0x01;
const ICR_TB: u8 = 0x02;
const ICR_ALARM: u8 = 0x04;
const ICR_SDR: u8 = 0x08;
const ICR_FLAG: u8 = 0x10;

/// External input levels for the two ports, composed by the system bus
/// (keyboard columns, joystick switches, IEC line states).
#[derive(Debug, Clone, Copy)]
pub struct PortInputs {
    pub a: u8,
    pub b: u8,
}

impl Default for PortInputs {
    fn default() -> Self {
        Self { a: 0xFF, b: 0xFF }
    }
}

pub struct Cia {
    pra: u8,
    prb: u8,
    ddra: u8,
    ddrb: u8,

    ta: u16,
    ta_latch: u16,
    tb: u16,
    tb_latch: u16,
    cra: u8,
    crb: u8,

    /// Timer A/B underflow toggles for the PB6/PB7 output modes.
    ta_toggle: bool,
    tb_toggle: bool,

    icr_pending: u8,
    icr_mask: u8,

    /// Serial shift register and the count of bits left to shift out.
    sdr: u8,
    sdr_bits: u8,
    /// Serial clock derived from every second Timer A underflow.
    sdr_clk: bool,

    tod: Tod,

    /// FLAG pin level (falling edge raises ICR bit 4).
    flag_level: bool,

    /// First cycle at which the chip must execute again. `u64::MAX`
    /// while parked.
    wake_up_cycle: u64,
    /// Cycles skipped while parked.
    pub idle_counter: u64,
}

impl Cia {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pra: 0,
            prb: 0,
            ddra: 0,
            ddrb: 0,
            ta: 0xFFFF,
            ta_latch: 0xFFFF,
            tb: 0xFFFF,
            tb_latch: 0xFFFF,
            cra: 0,
            crb: 0,
            ta_toggle: false,
            tb_toggle: false,
            icr_pending: 0,
            icr_mask: 0,
            sdr: 0,
            sdr_bits: 0,
            sdr_clk: false,
            tod: Tod::new(),
            flag_level: true,
            wake_up_cycle: 0,
            idle_counter: 0,
        }
    }

    pub fn reset(&mut self) {
        let idle = self.idle_counter;
        *self = Self::new();
        self.idle_counter = idle;
    }

    // --- Scheduler interface ---------------------------------------------

    /// Cycle at which the chip next needs a real `tick`.
    #[must_use]
    pub fn wake_up_cycle(&self) -> u64 {
        self.wake_up_cycle
    }

    fn ta_running(&self) -> bool {
        self.cra & 0x01 != 0
    }

    fn tb_running(&self) -> bool {
        self.crb & 0x01 != 0
    }

    /// Park the chip if nothing can happen without outside help.
    fn maybe_sleep(&mut self) {
        let ta_idle = !self.ta_running() || self.cra & 0x20 != 0; // stopped or CNT-fed
        let tb_idle = !self.tb_running() || self.crb & 0x60 == 0x20; // stopped or pure CNT
        if ta_idle && tb_idle && self.sdr_bits == 0 {
            self.wake_up_cycle = u64::MAX;
        } else {
            self.wake_up_cycle = 0;
        }
    }

    /// Cancel a park (any register access or external edge).
    fn wake_up(&mut self) {
        self.wake_up_cycle = 0;
    }

    /// One phi2 cycle of timer work.
    pub fn tick(&mut self) {
        let mut ta_underflow = false;

        // Timer A, phi2 source only (CNT is not wired to anything here).
        if self.ta_running() && self.cra & 0x20 == 0 {
            if self.ta == 0 {
                ta_underflow = true;
                self.ta = self.ta_latch;
                self.ta_toggle = !self.ta_toggle;
                self.icr_pending |= ICR_TA;
                if self.cra & 0x08 != 0 {
                    // One-shot: stop.
                    self.cra &= !0x01;
                }
                self.clock_serial();
            } else {
                self.ta -= 1;
            }
        }

        // Timer B: phi2 or Timer A underflow.
        let tb_mode = self.crb & 0x60;
        let tb_pulse = match tb_mode {
            0x00 => self.tb_running(),
            0x40 | 0x60 => self.tb_running() && ta_underflow,
            _ => false, // CNT modes: no edges occur
        };
        if tb_pulse {
            if self.tb == 0 {
                self.tb = self.tb_latch;
                self.tb_toggle = !self.tb_toggle;
                self.icr_pending |= ICR_TB;
                if self.crb & 0x08 != 0 {
                    self.crb &= !0x01;
                }
            } else {
                self.tb -= 1;
            }
        }

        self.maybe_sleep();
    }

    /// Serial register clocked from Timer A underflows (output mode
    /// shifts one bit per two underflows).
    fn clock_serial(&mut self) {
        if self.cra & 0x40 == 0 || self.sdr_bits == 0 {
            return;
        }
        self.sdr_clk = !self.sdr_clk;
        if self.sdr_clk {
            return;
        }
        self.sdr = self.sdr.rotate_left(1);
        self.sdr_bits -= 1;
        if self.sdr_bits == 0 {
            self.icr_pending |= ICR_SDR;
        }
    }

    /// Power-line tick, called at frame rate by the scheduler.
    pub fn tod_tick(&mut self) {
        if self.tod.power_line_tick(self.cra & 0x80 != 0) {
            self.icr_pending |= ICR_ALARM;
            self.wake_up();
        }
    }

    /// FLAG pin input; a falling edge latches ICR bit 4.
    pub fn set_flag_line(&mut self, level: bool) {
        if self.flag_level && !level {
            self.icr_pending |= ICR_FLAG;
            self.wake_up();
        }
        self.flag_level = level;
    }

    /// Interrupt line state (IRQ for CIA1, NMI for CIA2).
    #[must_use]
    pub fn irq_line_active(&self) -> bool {
        self.icr_pending & self.icr_mask & 0x1F != 0
    }

    // --- Register file ----------------------------------------------------

    /// Read a register. Side-effectful ($xD clears pending, TOD reads
    /// latch/unlatch).
    pub fn read(&mut self, reg: u8, inputs: PortInputs) -> u8 {
        self.wake_up();
        match reg & 0x0F {
            0x00 => (self.pra & self.ddra) | (inputs.a & !self.ddra),
            0x01 => {
                let mut value = (self.prb & self.ddrb) | (inputs.b & !self.ddrb);
                // Timer outputs override PB6/PB7 when enabled.
                if self.cra & 0x02 != 0 {
                    value = (value & !0x40) | if self.ta_toggle { 0x40 } else { 0 };
                }
                if self.crb & 0x02 != 0 {
                    value = (value & !0x80) | if self.tb_toggle { 0x80 } else { 0 };
                }
                value
            }
            0x02 => self.ddra,
            0x03 => self.ddrb,
            0x04 => self.ta as u8,
            0x05 => (self.ta >> 8) as u8,
            0x06 => self.tb as u8,
            0x07 => (self.tb >> 8) as u8,
            0x08..=0x0B => self.tod.read(reg - 0x08),
            0x0C => self.sdr,
            0x0D => {
                let mut value = self.icr_pending;
                if self.irq_line_active() {
                    value |= 0x80;
                }
                self.icr_pending = 0;
                value
            }
            0x0E => self.cra & !0x10,
            _ => self.crb & !0x10,
        }
    }

    /// Side-effect-free read for the debugger.
    #[must_use]
    pub fn spy(&self, reg: u8, inputs: PortInputs) -> u8 {
        match reg & 0x0F {
            0x00 => (self.pra & self.ddra) | (inputs.a & !self.ddra),
            0x01 => (self.prb & self.ddrb) | (inputs.b & !self.ddrb),
            0x02 => self.ddra,
            0x03 => self.ddrb,
            0x04 => self.ta as u8,
            0x05 => (self.ta >> 8) as u8,
            0x06 => self.tb as u8,
            0x07 => (self.tb >> 8) as u8,
            0x0C => self.sdr,
            0x0D => {
                let mut value = self.icr_pending;
                if self.irq_line_active() {
                    value |= 0x80;
                }
                value
            }
            0x0E => self.cra & !0x10,
            0x0F => self.crb & !0x10,
            _ => 0, // TOD spy would need the latch rules; not worth it
        }
    }

    /// Write a register.
    pub fn write(&mut self, reg: u8, value: u8) {
        self.wake_up();
        match reg & 0x0F {
            0x00 => self.pra = value,
            0x01 => self.prb = value,
            0x02 => self.ddra = value,
            0x03 => self.ddrb = value,
            0x04 => self.ta_latch = (self.ta_latch & 0xFF00) | u16::from(value),
            0x05 => {
                self.ta_latch = (self.ta_latch & 0x00FF) | (u16::from(value) << 8);
                if !self.ta_running() {
                    self.ta = self.ta_latch;
                }
            }
            0x06 => self.tb_latch = (self.tb_latch & 0xFF00) | u16::from(value),
            0x07 => {
                self.tb_latch = (self.tb_latch & 0x00FF) | (u16::from(value) << 8);
                if !self.tb_running() {
                    self.tb = self.tb_latch;
                }
            }
            0x08..=0x0B => self.tod.write(reg - 0x08, value, self.crb & 0x80 != 0),
            0x0C => {
                self.sdr = value;
                if self.cra & 0x40 != 0 {
                    // Output mode: start clocking 8 bits out.
                    self.sdr_bits = 8;
                    self.sdr_clk = false;
                }
            }
            0x0D => {
                if value & 0x80 != 0 {
                    self.icr_mask |= value & 0x1F;
                } else {
                    self.icr_mask &= !(value & 0x1F);
                }
            }
            0x0E => {
                self.cra = value;
                if value & 0x10 != 0 {
                    // Force load strobe; the bit itself does not stick.
                    self.ta = self.ta_latch;
                    self.cra &= !0x10;
                }
            }
            _ => {
                self.crb = value;
                if value & 0x10 != 0 {
                    self.tb = self.tb_latch;
                    self.crb &= !0x10;
                }
            }
        }
        self.maybe_sleep();
    }

    /// Port A output pins (driven bits; undriven float high).
    #[must_use]
    pub fn port_a_output(&self) -> u8 {
        (self.pra & self.ddra) | !self.ddra
    }

    /// Port B output pins.
    #[must_use]
    pub fn port_b_output(&self) -> u8 {
        (self.prb & self.ddrb) | !self.ddrb
    }

    // Debug accessors.

    #[must_use]
    pub fn timer_a(&self) -> u16 {
        self.ta
    }

    #[must_use]
    pub fn timer_b(&self) -> u16 {
        self.tb
    }

    #[must_use]
    pub fn icr_pending(&self) -> u8 {
        self.icr_pending
    }

    #[must_use]
    pub fn icr_mask(&self) -> u8 {
        self.icr_mask
    }

    // --- Snapshot ---------------------------------------------------------

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u8(self.pra);
        w.u8(self.prb);
        w.u8(self.ddra);
        w.u8(self.ddrb);
        w.u16(self.ta);
        w.u16(self.ta_latch);
        w.u16(self.tb);
        w.u16(self.tb_latch);
        w.u8(self.cra);
        w.u8(self.crb);
        w.bool(self.ta_toggle);
        w.bool(self.tb_toggle);
        w.u8(self.icr_pending);
        w.u8(self.icr_mask);
        w.u8(self.sdr);
        w.u8(self.sdr_bits);
        w.bool(self.sdr_clk);
        self.tod.serialize(w);
        w.bool(self.flag_level);
        w.u64(self.wake_up_cycle);
        w.u64(self.idle_counter);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.pra = r.u8()?;
        self.prb = r.u8()?;
        self.ddra = r.u8()?;
        self.ddrb = r.u8()?;
        self.ta = r.u16()?;
        self.ta_latch = r.u16()?;
        self.tb = r.u16()?;
        self.tb_latch = r.u16()?;
        self.cra = r.u8()?;
        self.crb = r.u8()?;
        self.ta_toggle = r.bool()?;
        self.tb_toggle = r.bool()?;
        self.icr_pending = r.u8()?;
        self.icr_mask = r.u8()?;
        self.sdr = r.u8()?;
        self.sdr_bits = r.u8()?;
        self.sdr_clk = r.bool()?;
        self.tod.deserialize(r)?;
        self.flag_level = r.bool()?;
        self.wake_up_cycle = r.u64()?;
        self.idle_counter = r.u64()?;
        Ok(())
    }
}

impl Default for Cia {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IN: PortInputs = PortInputs { a: 0xFF, b: 0xFF };

    #[test]
    fn timer_a_counts_down_and_underflows() {
        let mut cia = Cia::new();
        cia.write(0x04, 10);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x01); // start, continuous
        for _ in 0..11 {
            cia.tick();
        }
        assert_ne!(cia.icr_pending() & ICR_TA, 0);
        assert_eq!(cia.timer_a(), 10); // reloaded
    }

    #[test]
    fn timer_a_oneshot_stops() {
        let mut cia = Cia::new();
        cia.write(0x04, 3);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x09); // start + one-shot
        for _ in 0..4 {
            cia.tick();
        }
        assert_ne!(cia.icr_pending() & ICR_TA, 0);
        assert!(!cia.ta_running());
    }

    #[test]
    fn force_load_strobe() {
        let mut cia = Cia::new();
        cia.write(0x04, 50);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x01);
        for _ in 0..20 {
            cia.tick();
        }
        assert_eq!(cia.timer_a(), 30);
        cia.write(0x0E, 0x11); // force load
        assert_eq!(cia.timer_a(), 50);
        // Strobe bit does not read back.
        assert_eq!(cia.read(0x0E, IN) & 0x10, 0);
    }

    #[test]
    fn timer_b_counts_ta_underflows() {
        let mut cia = Cia::new();
        cia.write(0x04, 1); // TA period 2
        cia.write(0x05, 0);
        cia.write(0x06, 2); // TB counts 3 TA underflows
        cia.write(0x07, 0);
        cia.write(0x0F, 0x41); // TB source = TA underflow
        cia.write(0x0E, 0x01);
        // TA underflows every 2 cycles; TB needs 3 underflows to hit 0
        // plus one more to signal.
        for _ in 0..8 {
            cia.tick();
        }
        assert_ne!(cia.icr_pending() & ICR_TB, 0);
    }

    #[test]
    fn icr_read_clears_and_sets_bit7() {
        let mut cia = Cia::new();
        cia.write(0x0D, 0x81); // enable TA interrupt
        cia.write(0x04, 0);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x01);
        cia.tick();
        assert!(cia.irq_line_active());
        let icr = cia.read(0x0D, IN);
        assert_eq!(icr & 0x01, 0x01);
        assert_eq!(icr & 0x80, 0x80);
        assert_eq!(cia.icr_pending(), 0);
        assert!(!cia.irq_line_active());
    }

    #[test]
    fn icr_mask_set_and_clear() {
        let mut cia = Cia::new();
        cia.write(0x0D, 0x83);
        assert_eq!(cia.icr_mask(), 0x03);
        cia.write(0x0D, 0x01);
        assert_eq!(cia.icr_mask(), 0x02);
    }

    #[test]
    fn unmasked_pending_does_not_raise_line() {
        let mut cia = Cia::new();
        cia.write(0x04, 0);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x01);
        cia.tick();
        assert_ne!(cia.icr_pending(), 0);
        assert!(!cia.irq_line_active());
    }

    #[test]
    fn port_reads_mix_outputs_and_inputs() {
        let mut cia = Cia::new();
        cia.write(0x02, 0x0F); // low nibble output
        cia.write(0x00, 0xA5);
        let value = cia.read(0x00, PortInputs { a: 0x5A, b: 0xFF });
        assert_eq!(value, 0x55); // 0x05 driven | 0x50 external
    }

    #[test]
    fn pb6_toggles_on_ta_underflow() {
        let mut cia = Cia::new();
        cia.write(0x03, 0x40);
        cia.write(0x04, 0);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x03); // start + PB6 output
        cia.tick();
        assert_ne!(cia.read(0x01, IN) & 0x40, 0);
        cia.tick();
        assert_eq!(cia.read(0x01, IN) & 0x40, 0);
    }

    #[test]
    fn serial_output_interrupt_after_eight_bits() {
        let mut cia = Cia::new();
        cia.write(0x04, 0); // latch 0 while stopped loads the counter
        cia.write(0x05, 0);
        cia.write(0x0E, 0x41); // start + serial output mode
        cia.write(0x0C, 0xAA);
        // 8 bits at one bit per two underflows = 16 underflows.
        for _ in 0..16 {
            cia.tick();
        }
        assert_ne!(cia.icr_pending() & ICR_SDR, 0);
    }

    #[test]
    fn flag_falling_edge() {
        let mut cia = Cia::new();
        cia.set_flag_line(true);
        cia.set_flag_line(false);
        assert_ne!(cia.icr_pending() & ICR_FLAG, 0);
        // Another low does nothing.
        cia.read(0x0D, IN);
        cia.set_flag_line(false);
        assert_eq!(cia.icr_pending() & ICR_FLAG, 0);
    }

    #[test]
    fn tod_alarm_raises_icr() {
        let mut cia = Cia::new();
        cia.write(0x0F, 0x80); // alarm select
        cia.write(0x0B, 0x01);
        cia.write(0x0A, 0x00);
        cia.write(0x09, 0x00);
        cia.write(0x08, 0x01);
        cia.write(0x0F, 0x00); // back to clock writes
        cia.write(0x08, 0x00); // start TOD
        for _ in 0..5 {
            cia.tod_tick();
        }
        assert_ne!(cia.icr_pending() & ICR_ALARM, 0);
    }

    #[test]
    fn parks_when_idle_wakes_on_access() {
        let mut cia = Cia::new();
        cia.tick();
        assert_eq!(cia.wake_up_cycle(), u64::MAX);
        let _ = cia.read(0x04, IN);
        assert_eq!(cia.wake_up_cycle(), 0);
        // Starting a timer keeps it awake.
        cia.write(0x04, 5);
        cia.write(0x05, 0);
        cia.write(0x0E, 0x01);
        assert_eq!(cia.wake_up_cycle(), 0);
    }

    #[test]
    fn parked_chip_state_is_identical_after_skips() {
        // Run one chip every cycle, park-skip the other, compare.
        let mut every = Cia::new();
        let mut parked = Cia::new();
        for _ in 0..1000 {
            every.tick();
        }
        // parked: scheduler saw wake_up_cycle == MAX and only bumped
        // idle_counter, which is exactly a no-op on chip state.
        parked.tick(); // the one tick before parking
        assert_eq!(every.timer_a(), parked.timer_a());
        assert_eq!(every.icr_pending(), parked.icr_pending());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut cia = Cia::new();
        cia.write(0x04, 0x34);
        cia.write(0x05, 0x12);
        cia.write(0x0E, 0x01);
        for _ in 0..100 {
            cia.tick();
        }
        let mut w = Writer::new();
        cia.serialize(&mut w);
        let bytes = w.into_bytes();

        let mut other = Cia::new();
        other.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(other.timer_a(), cia.timer_a());
        for _ in 0..100 {
            cia.tick();
            other.tick();
        }
        assert_eq!(other.timer_a(), cia.timer_a());
    }
}
