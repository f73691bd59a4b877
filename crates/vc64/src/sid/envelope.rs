//! ADSR envelope generator.
//!
//! The gate bit is edge-sensitive: a rising edge enters Attack, a
//! falling edge enters Release from wherever the level happens to be.
//! Decay and Release approximate an exponential curve by slowing the
//! step rate at fixed level thresholds.

use crate::error::Result;
use crate::snapshot::{Reader, Writer};

/// Rate-counter periods per register value, from the datasheet timings.
/// Decay/release use the same table at one third the step rate via the
/// exponential counter.
const RATE_PERIODS: [u16; 16] = [
    9, 32, 63, 95, 149, 220, 267, 313, 392, 977, 1954, 3126, 3907, 11_720, 19_532, 31_251,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Attack,
    Decay,
    Sustain,
    Release,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::Attack => 0,
            Phase::Decay => 1,
            Phase::Sustain => 2,
            Phase::Release => 3,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Phase::Attack,
            1 => Phase::Decay,
            2 => Phase::Sustain,
            _ => Phase::Release,
        }
    }
}

pub struct Envelope {
    /// Output level, 0-255.
    pub level: u8,
    pub phase: Phase,
    pub attack: u8,
    pub decay: u8,
    pub sustain: u8,
    pub release: u8,
    rate_counter: u16,
    exp_counter: u8,
    exp_period: u8,
    gate_prev: bool,
}

impl Envelope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: 0,
            phase: Phase::Release,
            attack: 0,
            decay: 0,
            sustain: 0,
            release: 0,
            rate_counter: 0,
            exp_counter: 0,
            exp_period: 1,
            gate_prev: false,
        }
    }

    /// One CPU cycle.
    pub fn clock(&mut self, gate: bool) {
        if gate && !self.gate_prev {
            self.phase = Phase::Attack;
            self.rate_counter = 0;
            self.exp_counter = 0;
        } else if !gate && self.gate_prev {
            self.phase = Phase::Release;
        }
        self.gate_prev = gate;

        let period = match self.phase {
            Phase::Attack => RATE_PERIODS[self.attack as usize],
            Phase::Decay => RATE_PERIODS[self.decay as usize],
            Phase::Sustain => return,
            Phase::Release => RATE_PERIODS[self.release as usize],
        };

        self.rate_counter += 1;
        if self.rate_counter < period {
            return;
        }
        self.rate_counter = 0;

        match self.phase {
            Phase::Attack => {
                self.level = self.level.saturating_add(1);
                self.set_exp_period();
                if self.level == 0xFF {
                    self.phase = Phase::Decay;
                }
            }
            Phase::Decay => {
                self.exp_counter += 1;
                if self.exp_counter < self.exp_period {
                    return;
                }
                self.exp_counter = 0;
                let floor = self.sustain_level();
                if self.level > floor {
                    self.level -= 1;
                    self.set_exp_period();
                }
                if self.level <= floor {
                    self.level = floor;
                    self.phase = Phase::Sustain;
                }
            }
            Phase::Release => {
                self.exp_counter += 1;
                if self.exp_counter < self.exp_period {
                    return;
                }
                self.exp_counter = 0;
                if self.level > 0 {
                    self.level -= 1;
                    self.set_exp_period();
                }
            }
            Phase::Sustain => {}
        }
    }

    /// Sustain register expands 4 bits to 8 ($x -> $xx).
    fn sustain_level(&self) -> u8 {
        self.sustain << 4 | self.sustain
    }

    /// The exponential thresholds of the 6581.
    fn set_exp_period(&mut self) {
        self.exp_period = match self.level {
            0x5D..=0xFF => 1,
            0x36..=0x5C => 2,
            0x1A..=0x35 => 4,
            0x0E..=0x19 => 8,
            0x06..=0x0D => 16,
            _ => 30,
        };
    }

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u8(self.level);
        w.u8(self.phase.tag());
        w.u8(self.attack);
        w.u8(self.decay);
        w.u8(self.sustain);
        w.u8(self.release);
        w.u16(self.rate_counter);
        w.u8(self.exp_counter);
        w.u8(self.exp_period);
        w.bool(self.gate_prev);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.level = r.u8()?;
        self.phase = Phase::from_tag(r.u8()?);
        self.attack = r.u8()?;
        self.decay = r.u8()?;
        self.sustain = r.u8()?;
        self.release = r.u8()?;
        self.rate_counter = r.u16()?;
        self.exp_counter = r.u8()?;
        self.exp_period = r.u8()?;
        self.gate_prev = r.bool()?;
        Ok(())
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastest_attack_reaches_max() {
        let mut env = Envelope::new();
        env.sustain = 0x0F;
        for _ in 0..3000 {
            env.clock(true);
        }
        assert_eq!(env.level, 0xFF);
        assert_eq!(env.phase, Phase::Sustain);
    }

    #[test]
    fn decay_stops_at_sustain_level() {
        let mut env = Envelope::new();
        env.sustain = 0x08;
        for _ in 0..100_000 {
            env.clock(true);
        }
        assert_eq!(env.level, 0x88);
        assert_eq!(env.phase, Phase::Sustain);
    }

    #[test]
    fn gate_off_releases_to_zero() {
        let mut env = Envelope::new();
        env.sustain = 0x0F;
        for _ in 0..3000 {
            env.clock(true);
        }
        for _ in 0..60_000 {
            env.clock(false);
        }
        assert_eq!(env.level, 0);
    }

    #[test]
    fn gate_reattack_from_release() {
        let mut env = Envelope::new();
        env.sustain = 0x0F;
        for _ in 0..3000 {
            env.clock(true);
        }
        for _ in 0..5000 {
            env.clock(false);
        }
        let mid = env.level;
        assert!(mid < 0xFF);
        env.clock(true); // rising edge
        assert_eq!(env.phase, Phase::Attack);
    }

    #[test]
    fn slow_release_is_slower() {
        let mut a = Envelope::new();
        let mut b = Envelope::new();
        a.sustain = 0x0F;
        b.sustain = 0x0F;
        b.release = 0x0F;
        for _ in 0..3000 {
            a.clock(true);
            b.clock(true);
        }
        for _ in 0..20_000 {
            a.clock(false);
            b.clock(false);
        }
        assert!(a.level < b.level);
    }
}
