//! Datasette (C2N) pulse playback.
//!
//! The core consumes an already-parsed TAP pulse stream: each entry is a
//! pulse length in CPU cycles. The motor is gated by the processor port,
//! the play key is reported through the cassette sense line, and every
//! completed pulse produces a falling edge on CIA1's FLAG input.

use crate::error::Result;
use crate::snapshot::{Reader, Writer};

pub struct Datasette {
    /// Pulse lengths in CPU cycles.
    pulses: Vec<u32>,
    /// Index of the pulse currently playing.
    position: usize,
    /// Cycles left in the current pulse.
    countdown: u32,
    /// Play key held down.
    play_pressed: bool,
    /// Motor line from the processor port.
    motor_on: bool,
    /// Tape counter in completed pulses.
    counter: u64,
}

impl Datasette {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pulses: Vec::new(),
            position: 0,
            countdown: 0,
            play_pressed: false,
            motor_on: false,
            counter: 0,
        }
    }

    /// Load a parsed pulse stream and rewind.
    pub fn insert_tape(&mut self, pulses: Vec<u32>) {
        self.pulses = pulses;
        self.rewind();
    }

    pub fn eject_tape(&mut self) {
        self.pulses.clear();
        self.rewind();
        self.play_pressed = false;
    }

    #[must_use]
    pub fn has_tape(&self) -> bool {
        !self.pulses.is_empty()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.countdown = self.pulses.first().copied().unwrap_or(0);
        self.counter = 0;
    }

    pub fn press_play(&mut self) {
        self.play_pressed = true;
    }

    pub fn press_stop(&mut self) {
        self.play_pressed = false;
    }

    /// Cassette sense line (low while a deck key is down).
    #[must_use]
    pub fn sense(&self) -> bool {
        self.play_pressed
    }

    /// Motor control from processor port bit 5.
    pub fn set_motor(&mut self, on: bool) {
        self.motor_on = on;
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        self.position >= self.pulses.len()
    }

    /// One CPU cycle of tape transport. Returns `true` on a read-line
    /// pulse edge (wired to CIA1 FLAG).
    pub fn execute(&mut self) -> bool {
        if !self.play_pressed || !self.motor_on || self.at_end() {
            return false;
        }
        if self.countdown > 0 {
            self.countdown -= 1;
            return false;
        }
        // Pulse boundary: advance and report the edge.
        self.counter += 1;
        self.position += 1;
        self.countdown = self.pulses.get(self.position).copied().unwrap_or(0);
        true
    }

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u32(self.pulses.len() as u32);
        for &pulse in &self.pulses {
            w.u32(pulse);
        }
        w.u32(self.position as u32);
        w.u32(self.countdown);
        w.bool(self.play_pressed);
        w.bool(self.motor_on);
        w.u64(self.counter);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.u32()? as usize;
        let mut pulses = Vec::with_capacity(count.min(1 << 24));
        for _ in 0..count {
            pulses.push(r.u32()?);
        }
        self.pulses = pulses;
        self.position = r.u32()? as usize;
        self.countdown = r.u32()?;
        self.play_pressed = r.bool()?;
        self.motor_on = r.bool()?;
        self.counter = r.u64()?;
        Ok(())
    }
}

impl Default for Datasette {
    fn default() -> Self {
        Self::new()
    }
}
