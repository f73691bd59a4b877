//! State-variable multi-mode filter.
//!
//! Two-integrator loop producing low-pass, band-pass and high-pass
//! simultaneously; $D418 mode bits pick which outputs are summed. The
//! cutoff curve approximates the 6581's non-linear response (a ~200 Hz
//! floor, then a steep ramp) with a fitted polynomial.

use crate::error::Result;
use crate::snapshot::{Reader, Writer};

pub struct Filter {
    lp: f32,
    bp: f32,

    /// 11-bit cutoff register.
    pub cutoff: u16,
    /// 4-bit resonance.
    pub resonance: u8,
    /// Mode bits from $D418 (bit 4 LP, 5 BP, 6 HP).
    pub mode: u8,
    /// Voice routing bits 0-2 of $D417.
    pub routing: u8,
    /// External input routing (bit 3 of $D417).
    pub ext_in: bool,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lp: 0.0,
            bp: 0.0,
            cutoff: 0,
            resonance: 0,
            mode: 0,
            routing: 0,
            ext_in: false,
        }
    }

    /// Process one input sample, returning the sum of active modes.
    pub fn clock(&mut self, input: f32) -> f32 {
        let fc = self.cutoff_coefficient();
        let q = 0.7 + f32::from(self.resonance) / 15.0;

        let hp = input - self.lp - q * self.bp;
        self.bp += fc * hp;
        self.lp += fc * self.bp;

        let mut out = 0.0;
        if self.mode & 0x10 != 0 {
            out += self.lp;
        }
        if self.mode & 0x20 != 0 {
            out += self.bp;
        }
        if self.mode & 0x40 != 0 {
            out += hp;
        }
        out
    }

    /// 6581 cutoff curve, polynomial fit over the 11-bit register.
    fn cutoff_coefficient(&self) -> f32 {
        let x = f32::from(self.cutoff & 0x7FF) / 2047.0;
        (0.003 + 0.02 * x + 0.33 * x * x).clamp(0.002, 0.36)
    }

    #[must_use]
    pub fn voice_routed(&self, voice: usize) -> bool {
        self.routing & (1 << voice) != 0
    }

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.f32(self.lp);
        w.f32(self.bp);
        w.u16(self.cutoff);
        w.u8(self.resonance);
        w.u8(self.mode);
        w.u8(self.routing);
        w.bool(self.ext_in);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.lp = r.f32()?;
        self.bp = r.f32()?;
        self.cutoff = r.u16()?;
        self.resonance = r.u8()?;
        self.mode = r.u8()?;
        self.routing = r.u8()?;
        self.ext_in = r.bool()?;
        Ok(())
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mode_bits_mutes_filter_path() {
        let mut filter = Filter::new();
        assert_eq!(filter.clock(1.0), 0.0);
    }

    #[test]
    fn low_pass_attenuates_fast_input() {
        // Alternating +1/-1 at the sample rate is far above the minimum
        // cutoff; the LP output should stay small.
        let mut filter = Filter::new();
        filter.mode = 0x10;
        filter.cutoff = 0;
        let mut peak: f32 = 0.0;
        for i in 0..10_000 {
            let x = if i % 2 == 0 { 1.0 } else { -1.0 };
            peak = peak.max(filter.clock(x).abs());
        }
        assert!(peak < 0.2, "LP leaked {peak}");
    }

    #[test]
    fn low_pass_passes_dc() {
        let mut filter = Filter::new();
        filter.mode = 0x10;
        filter.cutoff = 0x7FF;
        let mut last = 0.0;
        for _ in 0..10_000 {
            last = filter.clock(1.0);
        }
        assert!((last - 1.0).abs() < 0.1, "DC came out as {last}");
    }

    #[test]
    fn routing_bits() {
        let mut filter = Filter::new();
        filter.routing = 0b101;
        assert!(filter.voice_routed(0));
        assert!(!filter.voice_routed(1));
        assert!(filter.voice_routed(2));
    }
}
