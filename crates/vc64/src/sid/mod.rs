//! MOS 6581 SID.
//!
//! The chip runs lazily: the scheduler only tells it how far the machine
//! has advanced, and `execute_until` catches the voices up in one burst
//! at end-of-frame or when software reads OSC3/ENV3. Output samples are
//! resampled to the host rate and pushed into a single-producer /
//! single-consumer ring for the audio thread.
//!
//! Register map ($D400-$D41C): three voices x (freq lo/hi, PW lo/hi,
//! control, AD, SR), then filter cutoff/resonance/routing, volume+mode,
//! the POT X/Y inputs, and the OSC3/ENV3 taps.

mod envelope;
mod filter;
mod voice;

pub use envelope::{Envelope, Phase};
pub use filter::Filter;
pub use voice::Voice;

use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::error::Result;
use crate::snapshot::{Reader, Writer};

/// Samples the warp transition spreads its amplitude ramp over.
const WARP_RAMP_SAMPLES: u32 = 1024;

/// Ring capacity: about half a second at 48 kHz.
const RING_CAPACITY: usize = 24_000;

pub struct Sid {
    voices: [Voice; 3],
    envelopes: [Envelope; 3],
    filter: Filter,
    volume: u8,
    voice3_off: bool,

    /// Cycle up to which the voices have been executed.
    cursor: u64,

    /// Fixed-point (16.16) CPU cycles per output sample.
    cycles_per_sample_fp: u64,
    /// Fixed-point position within the current sample window.
    sample_pos_fp: u64,
    /// Sum and count for the accumulate-and-average resampler.
    acc: f32,
    acc_count: u32,
    /// Monotonic count of emitted samples.
    samples_emitted: u64,

    /// Current amplitude and the warp ramp target.
    amplitude: f32,
    amplitude_target: f32,

    /// POT X/Y lines (paddles / 1351 mouse).
    pot_x: u8,
    pot_y: u8,

    ring_prod: HeapProd<f32>,
    /// Parked consumer; until the host claims it, overflow drops the
    /// oldest samples through here.
    ring_cons: Option<HeapCons<f32>>,
    overflows: u64,
}

impl Sid {
    /// `cpu_frequency` in Hz, `sample_rate` the host output rate.
    #[must_use]
    pub fn new(cpu_frequency: u32, sample_rate: u32) -> Self {
        let ring = HeapRb::<f32>::new(RING_CAPACITY);
        let (prod, cons) = ring.split();
        Self {
            voices: [Voice::new(), Voice::new(), Voice::new()],
            envelopes: [Envelope::new(), Envelope::new(), Envelope::new()],
            filter: Filter::new(),
            volume: 0,
            voice3_off: false,
            cursor: 0,
            cycles_per_sample_fp: (u64::from(cpu_frequency) << 16) / u64::from(sample_rate),
            sample_pos_fp: 0,
            acc: 0.0,
            acc_count: 0,
            samples_emitted: 0,
            amplitude: 1.0,
            amplitude_target: 1.0,
            pot_x: 0xFF,
            pot_y: 0xFF,
            ring_prod: prod,
            ring_cons: Some(cons),
            overflows: 0,
        }
    }

    pub fn reset(&mut self) {
        self.voices = [Voice::new(), Voice::new(), Voice::new()];
        self.envelopes = [Envelope::new(), Envelope::new(), Envelope::new()];
        self.filter = Filter::new();
        self.volume = 0;
        self.voice3_off = false;
        self.acc = 0.0;
        self.acc_count = 0;
        self.sample_pos_fp = 0;
    }

    /// Hand the ring consumer to the audio thread. Can be taken once.
    pub fn take_audio_consumer(&mut self) -> Option<HeapCons<f32>> {
        self.ring_cons.take()
    }

    /// Monotonic count of samples pushed so far.
    #[must_use]
    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    /// Current output amplitude (1.0 normal, 0.0 fully warped).
    #[must_use]
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Warp transitions ramp the amplitude instead of cutting it, so the
    /// audio stream stays click-free while frames are dropped.
    pub fn set_warp(&mut self, warp: bool) {
        self.amplitude_target = if warp { 0.0 } else { 1.0 };
    }

    /// POT lines, sampled by the paddle/mouse logic once per frame.
    pub fn set_pot_lines(&mut self, x: u8, y: u8) {
        self.pot_x = x;
        self.pot_y = y;
    }

    /// Read a register at machine cycle `cycle`. OSC3/ENV3 force a
    /// catch-up first so software polling voice 3 sees live data.
    pub fn read(&mut self, reg: u8, cycle: u64) -> u8 {
        match reg & 0x1F {
            0x19 => self.pot_x,
            0x1A => self.pot_y,
            0x1B => {
                self.execute_until(cycle);
                let ring_msb = self.voices[1].msb();
                (self.voices[2].output(ring_msb) >> 4) as u8
            }
            0x1C => {
                self.execute_until(cycle);
                self.envelopes[2].level
            }
            _ => 0, // write-only registers read back zero
        }
    }

    /// Write a register at machine cycle `cycle`. The catch-up happens
    /// first so the change takes effect at the right sample position.
    pub fn write(&mut self, reg: u8, value: u8, cycle: u64) {
        self.execute_until(cycle);
        let reg = reg & 0x1F;
        match reg {
            0x00..=0x14 => {
                let voice = (reg / 7) as usize;
                let voice_reg = reg % 7;
                match voice_reg {
                    0x00 => {
                        self.voices[voice].frequency =
                            (self.voices[voice].frequency & 0xFF00) | u16::from(value);
                    }
                    0x01 => {
                        self.voices[voice].frequency =
                            (self.voices[voice].frequency & 0x00FF) | (u16::from(value) << 8);
                    }
                    0x02 => {
                        self.voices[voice].pulse_width =
                            (self.voices[voice].pulse_width & 0x0F00) | u16::from(value);
                    }
                    0x03 => {
                        self.voices[voice].pulse_width = (self.voices[voice].pulse_width
                            & 0x00FF)
                            | ((u16::from(value) & 0x0F) << 8);
                    }
                    0x04 => self.voices[voice].control = value,
                    0x05 => {
                        self.envelopes[voice].attack = value >> 4;
                        self.envelopes[voice].decay = value & 0x0F;
                    }
                    _ => {
                        self.envelopes[voice].sustain = value >> 4;
                        self.envelopes[voice].release = value & 0x0F;
                    }
                }
            }
            0x15 => self.filter.cutoff = (self.filter.cutoff & 0x7F8) | u16::from(value & 0x07),
            0x16 => self.filter.cutoff = (self.filter.cutoff & 0x007) | (u16::from(value) << 3),
            0x17 => {
                self.filter.resonance = value >> 4;
                self.filter.routing = value & 0x07;
                self.filter.ext_in = value & 0x08 != 0;
            }
            0x18 => {
                self.volume = value & 0x0F;
                self.filter.mode = value & 0x70;
                self.voice3_off = value & 0x80 != 0;
            }
            _ => {} // POT/OSC3/ENV3 are read-only
        }
    }

    /// Run the voices from the internal cursor up to `cycle`.
    pub fn execute_until(&mut self, cycle: u64) {
        while self.cursor < cycle {
            self.tick_voices();
            self.cursor += 1;
        }
    }

    fn tick_voices(&mut self) {
        let prev_msb = [
            self.voices[0].msb(),
            self.voices[1].msb(),
            self.voices[2].msb(),
        ];

        for voice in &mut self.voices {
            voice.clock();
        }

        // Hard sync sources: 2->0, 0->1, 1->2.
        for i in 0..3 {
            let src = (i + 2) % 3;
            if self.voices[i].sync_enabled() {
                let src_msb = self.voices[src].msb();
                self.voices[i].hard_sync(prev_msb[src], src_msb);
            }
        }

        for i in 0..3 {
            let gate = self.voices[i].gate();
            self.envelopes[i].clock(gate);
        }

        // Mix. Ring-mod sources: 2->0, 0->1, 1->2.
        let mut filtered = 0.0f32;
        let mut direct = 0.0f32;
        for i in 0..3 {
            if i == 2 && self.voice3_off && !self.filter.voice_routed(2) {
                continue;
            }
            let ring_msb = self.voices[(i + 2) % 3].msb();
            let wave = self.voices[i].output(ring_msb);
            let centred = f32::from(wave as i32 as i16 - 2048);
            let level = centred * f32::from(self.envelopes[i].level) / 255.0;
            if self.filter.voice_routed(i) {
                filtered += level;
            } else {
                direct += level;
            }
        }

        let mixed = (self.filter.clock(filtered) + direct) * f32::from(self.volume) / 15.0;
        let normalised = mixed / 6144.0;

        // Accumulate-and-average resampler.
        self.acc += normalised;
        self.acc_count += 1;
        self.sample_pos_fp += 1 << 16;
        if self.sample_pos_fp >= self.cycles_per_sample_fp {
            self.sample_pos_fp -= self.cycles_per_sample_fp;
            let sample = self.acc / self.acc_count as f32;
            self.acc = 0.0;
            self.acc_count = 0;
            self.emit(sample);
        }
    }

    fn emit(&mut self, sample: f32) {
        // Warp ramp: move amplitude toward the target a little per sample.
        if (self.amplitude - self.amplitude_target).abs() > f32::EPSILON {
            let step = 1.0 / WARP_RAMP_SAMPLES as f32;
            if self.amplitude < self.amplitude_target {
                self.amplitude = (self.amplitude + step).min(self.amplitude_target);
            } else {
                self.amplitude = (self.amplitude - step).max(self.amplitude_target);
            }
        }

        let value = sample * self.amplitude;
        self.samples_emitted += 1;
        if self.ring_prod.try_push(value).is_err() {
            if let Some(cons) = &mut self.ring_cons {
                // Nobody is listening yet: drop the oldest sample.
                let _ = cons.try_pop();
                let _ = self.ring_prod.try_push(value);
            } else {
                self.overflows += 1;
                if self.overflows % 48_000 == 1 {
                    log::debug!("audio ring overflow ({} samples dropped)", self.overflows);
                }
            }
        }
    }

    // --- Snapshot ---------------------------------------------------------

    pub(crate) fn serialize(&self, w: &mut Writer) {
        for voice in &self.voices {
            w.u32(voice.accumulator);
            w.u16(voice.frequency);
            w.u16(voice.pulse_width);
            w.u8(voice.control);
            w.u32(voice.noise_lfsr());
        }
        for env in &self.envelopes {
            env.serialize(w);
        }
        self.filter.serialize(w);
        w.u8(self.volume);
        w.bool(self.voice3_off);
        w.u64(self.cursor);
        w.u64(self.sample_pos_fp);
        w.f32(self.acc);
        w.u32(self.acc_count);
        w.u64(self.samples_emitted);
        w.f32(self.amplitude);
        w.f32(self.amplitude_target);
        w.u8(self.pot_x);
        w.u8(self.pot_y);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        for voice in &mut self.voices {
            voice.accumulator = r.u32()?;
            voice.frequency = r.u16()?;
            voice.pulse_width = r.u16()?;
            voice.control = r.u8()?;
            let lfsr = r.u32()?;
            voice.set_noise_lfsr(lfsr);
        }
        for env in &mut self.envelopes {
            env.deserialize(r)?;
        }
        self.filter.deserialize(r)?;
        self.volume = r.u8()?;
        self.voice3_off = r.bool()?;
        self.cursor = r.u64()?;
        self.sample_pos_fp = r.u64()?;
        self.acc = r.f32()?;
        self.acc_count = r.u32()?;
        self.samples_emitted = r.u64()?;
        self.amplitude = r.f32()?;
        self.amplitude_target = r.f32()?;
        self.pot_x = r.u8()?;
        self.pot_y = r.u8()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sid() -> Sid {
        Sid::new(985_248, 48_000)
    }

    fn drain(sid: &mut Sid) -> Vec<f32> {
        let mut out = Vec::new();
        if let Some(cons) = &mut sid.ring_cons {
            while let Some(s) = cons.try_pop() {
                out.push(s);
            }
        }
        out
    }

    #[test]
    fn silence_when_idle() {
        let mut sid = make_sid();
        sid.execute_until(20_000);
        let samples = drain(&mut sid);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn sawtooth_produces_signal() {
        let mut sid = make_sid();
        sid.write(0x00, 0x37, 0); // ~440 Hz
        sid.write(0x01, 0x1D, 0);
        sid.write(0x05, 0x00, 0);
        sid.write(0x06, 0xF0, 0);
        sid.write(0x04, 0x21, 0); // saw + gate
        sid.write(0x18, 0x0F, 0);
        sid.execute_until(40_000);
        let samples = drain(&mut sid);
        assert!(samples.iter().any(|s| *s > 0.01));
        assert!(samples.iter().any(|s| *s < -0.01));
    }

    #[test]
    fn lazy_execution_catches_up() {
        let mut sid = make_sid();
        assert_eq!(sid.cursor, 0);
        sid.execute_until(985);
        assert_eq!(sid.cursor, 985);
        // Calling again with an older cycle is a no-op.
        sid.execute_until(100);
        assert_eq!(sid.cursor, 985);
    }

    #[test]
    fn osc3_read_forces_catch_up() {
        let mut sid = make_sid();
        sid.write(0x0E, 0xFF, 0);
        sid.write(0x0F, 0xFF, 0);
        sid.write(0x12, 0x20, 0); // voice 3 saw
        let value = sid.read(0x1B, 5_000);
        assert_eq!(sid.cursor, 5_000);
        // With a max-frequency saw the top bits cannot still be zero
        // after 5000 cycles unless we failed to run.
        let _ = value;
    }

    #[test]
    fn sample_rate_close_to_target() {
        let mut sid = make_sid();
        // One PAL second of cycles should produce about 48000 samples.
        sid.execute_until(985_248);
        let emitted = sid.samples_emitted();
        assert!(
            (47_900..=48_100).contains(&(emitted as i64)),
            "emitted {emitted}"
        );
    }

    #[test]
    fn samples_are_monotonic() {
        let mut sid = make_sid();
        sid.execute_until(10_000);
        let first = sid.samples_emitted();
        sid.execute_until(20_000);
        assert!(sid.samples_emitted() >= first);
    }

    #[test]
    fn warp_ramps_amplitude_over_1024_samples() {
        let mut sid = make_sid();
        sid.write(0x18, 0x0F, 0);
        sid.set_warp(true);
        // 1024 samples at ~20.5 cycles per sample.
        sid.execute_until(1100 * 21);
        assert!(sid.amplitude() < 0.01, "amplitude {}", sid.amplitude());
        sid.set_warp(false);
        sid.execute_until(2 * 1100 * 21);
        assert!(sid.amplitude() > 0.99);
    }

    #[test]
    fn ring_overflow_drops_oldest_while_unclaimed() {
        let mut sid = make_sid();
        // Way more than RING_CAPACITY samples.
        sid.execute_until(985_248 * 2);
        assert!(sid.samples_emitted() > RING_CAPACITY as u64);
        let samples = drain(&mut sid);
        assert!(samples.len() <= RING_CAPACITY);
    }

    #[test]
    fn env3_tracks_envelope() {
        let mut sid = make_sid();
        sid.write(0x13, 0x00, 0);
        sid.write(0x14, 0xF0, 0);
        sid.write(0x12, 0x01, 0); // gate voice 3
        let level = sid.read(0x1C, 3000);
        assert_eq!(level, 0xFF);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut sid = make_sid();
        sid.write(0x00, 0x34, 0);
        sid.write(0x01, 0x12, 0);
        sid.write(0x04, 0x21, 0);
        sid.write(0x18, 0x0F, 0);
        sid.execute_until(10_000);

        let mut w = Writer::new();
        sid.serialize(&mut w);
        let bytes = w.into_bytes();

        let mut other = make_sid();
        other.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(other.cursor, sid.cursor);
        sid.execute_until(20_000);
        other.execute_until(20_000);
        assert_eq!(
            sid.voices[0].accumulator,
            other.voices[0].accumulator
        );
    }
}
