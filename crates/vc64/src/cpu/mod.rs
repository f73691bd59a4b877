//! MOS 6510/6502 CPU core.
//!
//! Cycle-accurate microexecution: each `tick()` performs exactly one bus
//! access of the current opcode. The same core runs as the C64's 6510
//! (its I/O port lives in the memory subsystem) and as the 1541's 6502.
//!
//! Interrupt lines are bitmasks so independent sources (CIA, VIC,
//! expansion port, drive VIAs) compose with OR. NMI is edge-triggered per
//! source, IRQ is level-triggered. Both lines are sampled with the chip's
//! pipeline delay: an assertion is only visible to an opcode fetch that
//! happens at least two cycles later.
//!
//! All documented illegal opcodes are implemented with their canonical
//! cycle counts. The twelve jamming opcodes stop the clock and leave the
//! CPU in an error state that a debugger can clear.

pub mod flags;

use flags::{Status, B, C, D, I, N, U, V, Z};

use crate::snapshot::{Reader, Writer};
use crate::error::Result;

/// Memory bus as seen by the CPU: one byte per access.
pub trait Bus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
}

/// Interrupt source bits for [`Cpu::pull_down_irq`] and friends.
pub mod int_source {
    /// CIA 1 (IRQ) or CIA 2 (NMI).
    pub const CIA: u8 = 0x01;
    /// VIC-II raster/collision interrupts.
    pub const VIC: u8 = 0x02;
    /// Expansion port (cartridge freeze/reset buttons).
    pub const EXPANSION: u8 = 0x04;
    /// Keyboard RESTORE key (NMI only).
    pub const KEYBOARD: u8 = 0x08;
    /// Drive VIA 1.
    pub const VIA1: u8 = 0x10;
    /// Drive VIA 2.
    pub const VIA2: u8 = 0x20;
}

/// Register file.
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub p: Status,
}

impl Registers {
    #[must_use]
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
            p: Status::new(),
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// Microexecution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Next cycle fetches an opcode (or services an interrupt).
    FetchOpcode,
    /// Mid-instruction.
    Execute,
    /// A jamming opcode stopped the clock.
    Jammed,
}

/// Which interrupt sequence is in flight, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntKind {
    None,
    Irq,
    Nmi,
}

/// The CPU core.
pub struct Cpu {
    pub regs: Registers,

    state: State,
    /// Opcode being executed.
    opcode: u8,
    /// Cycle within the instruction (0 = the fetch itself).
    cycle: u8,
    /// Scratch address for addressing modes.
    addr: u16,
    /// Scratch data byte; also reused as the page-cross marker.
    data: u8,
    /// Zero-page pointer for indirect modes.
    pointer: u8,
    /// Interrupt sequence in flight (uses the BRK microcode).
    int_kind: IntKind,

    /// IRQ line: bitmask of sources currently pulling it low.
    irq_line: u8,
    /// Cycle at which the IRQ line last went from released to asserted.
    irq_line_since: u64,
    /// NMI sources that are currently asserted (for edge detection).
    nmi_sources: u8,
    /// A not-yet-serviced NMI edge exists.
    nmi_pending: bool,
    /// Cycle at which the pending NMI edge happened.
    nmi_since: u64,

    /// Total bus cycles executed.
    total_cycles: u64,

    /// Soft breakpoint used by step-over.
    pub breakpoint: Option<u16>,
}

impl Cpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            state: State::FetchOpcode,
            opcode: 0,
            cycle: 0,
            addr: 0,
            data: 0,
            pointer: 0,
            int_kind: IntKind::None,
            irq_line: 0,
            irq_line_since: 0,
            nmi_sources: 0,
            nmi_pending: false,
            nmi_since: 0,
            total_cycles: 0,
            breakpoint: None,
        }
    }

    /// Reset: load PC from $FFFC/$FFFD, set I, release the lines.
    pub fn reset<BUS: Bus>(&mut self, bus: &mut BUS) {
        let lo = bus.read(0xFFFC);
        let hi = bus.read(0xFFFD);
        self.regs.pc = u16::from(lo) | (u16::from(hi) << 8);
        self.regs.sp = 0xFD;
        self.regs.p = Status::new();
        self.state = State::FetchOpcode;
        self.cycle = 0;
        self.int_kind = IntKind::None;
        self.irq_line = 0;
        self.nmi_sources = 0;
        self.nmi_pending = false;
        self.breakpoint = None;
    }

    /// Total bus cycles executed so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.total_cycles
    }

    /// True between instructions: the next cycle fetches an opcode.
    #[must_use]
    pub fn in_fetch_phase(&self) -> bool {
        self.state == State::FetchOpcode
    }

    /// True after a jamming opcode.
    #[must_use]
    pub fn is_jammed(&self) -> bool {
        self.state == State::Jammed
    }

    /// Debugger escape hatch from a jam.
    pub fn clear_jam(&mut self) {
        if self.state == State::Jammed {
            self.state = State::FetchOpcode;
            self.cycle = 0;
        }
    }

    // --- Interrupt lines -------------------------------------------------

    /// Assert an IRQ source (level-triggered).
    pub fn pull_down_irq(&mut self, source: u8) {
        if self.irq_line == 0 {
            self.irq_line_since = self.total_cycles;
        }
        self.irq_line |= source;
    }

    /// Release an IRQ source.
    pub fn release_irq(&mut self, source: u8) {
        self.irq_line &= !source;
    }

    /// Assert an NMI source. Only the 0->1 edge of a source arms an NMI.
    pub fn pull_down_nmi(&mut self, source: u8) {
        if self.nmi_sources & source == 0 {
            self.nmi_sources |= source;
            if !self.nmi_pending {
                self.nmi_pending = true;
                self.nmi_since = self.total_cycles;
            }
        }
    }

    /// Release an NMI source (re-arms that source's edge detector).
    pub fn release_nmi(&mut self, source: u8) {
        self.nmi_sources &= !source;
    }

    /// Asserted IRQ source mask (debugger).
    #[must_use]
    pub fn irq_line(&self) -> u8 {
        self.irq_line
    }

    /// The SO pin: sets the overflow flag immediately. Wired to the
    /// 1541's byte-ready signal.
    pub fn set_overflow_pin(&mut self) {
        self.regs.p.set(V);
    }

    /// Execute one bus cycle.
    pub fn tick<BUS: Bus>(&mut self, bus: &mut BUS) {
        if self.state == State::Jammed {
            // Clock is stopped; don't even touch the bus.
            return;
        }
        self.total_cycles += 1;

        match self.state {
            State::FetchOpcode => {
                // Interrupt lines are sampled two cycles behind.
                let seen = self.total_cycles.saturating_sub(1);
                if self.nmi_pending && seen >= self.nmi_since + 2 {
                    self.nmi_pending = false;
                    self.begin_interrupt(bus, IntKind::Nmi);
                    return;
                }
                if self.irq_line != 0 && !self.regs.p.is_set(I) && seen >= self.irq_line_since + 2
                {
                    self.begin_interrupt(bus, IntKind::Irq);
                    return;
                }

                self.opcode = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 1;
                self.int_kind = IntKind::None;
                self.state = State::Execute;
            }
            State::Execute => self.execute_cycle(bus),
            State::Jammed => unreachable!(),
        }
    }

    /// Start an IRQ or NMI sequence (BRK microcode with vector override).
    fn begin_interrupt<BUS: Bus>(&mut self, bus: &mut BUS, kind: IntKind) {
        // The would-be opcode fetch is discarded; PC does not advance.
        let _ = bus.read(self.regs.pc);
        self.opcode = 0x00;
        self.int_kind = kind;
        self.cycle = 1;
        self.state = State::Execute;
    }

    fn finish(&mut self) {
        self.state = State::FetchOpcode;
        self.cycle = 0;
    }

    fn push<BUS: Bus>(&mut self, bus: &mut BUS, value: u8) {
        bus.write(0x0100 | u16::from(self.regs.sp), value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    fn pop<BUS: Bus>(&mut self, bus: &mut BUS) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        bus.read(0x0100 | u16::from(self.regs.sp))
    }

    // =====================================================================
    // Opcode dispatch
    // =====================================================================

    #[allow(clippy::too_many_lines)]
    fn execute_cycle<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.opcode {
            0x00 => self.op_brk(bus),
            0x01 => self.addr_izx(bus, Self::do_ora),
            0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2
            | 0xF2 => self.op_jam(),
            0x03 => self.addr_izx_rmw(bus, Self::do_slo),
            0x04 | 0x44 | 0x64 => self.addr_zp(bus, Self::do_nop_read),
            0x05 => self.addr_zp(bus, Self::do_ora),
            0x06 => self.addr_zp_rmw(bus, Self::do_asl),
            0x07 => self.addr_zp_rmw(bus, Self::do_slo),
            0x08 => self.op_php(bus),
            0x09 => self.addr_imm(bus, Self::do_ora),
            0x0A => self.op_accum(bus, Self::do_asl),
            0x0B | 0x2B => self.addr_imm(bus, Self::do_anc),
            0x0C => self.addr_abs(bus, Self::do_nop_read),
            0x0D => self.addr_abs(bus, Self::do_ora),
            0x0E => self.addr_abs_rmw(bus, Self::do_asl),
            0x0F => self.addr_abs_rmw(bus, Self::do_slo),
            0x10 => self.op_branch(bus, !self.regs.p.is_set(N)),
            0x11 => self.addr_izy(bus, Self::do_ora),
            0x13 => self.addr_izy_rmw(bus, Self::do_slo),
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => self.addr_zpx(bus, Self::do_nop_read),
            0x15 => self.addr_zpx(bus, Self::do_ora),
            0x16 => self.addr_zpx_rmw(bus, Self::do_asl),
            0x17 => self.addr_zpx_rmw(bus, Self::do_slo),
            0x18 => self.op_flag(bus, C, false),
            0x19 => self.addr_aby(bus, Self::do_ora),
            0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA | 0xEA => self.op_nop(bus),
            0x1B => self.addr_aby_rmw(bus, Self::do_slo),
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => self.addr_abx(bus, Self::do_nop_read),
            0x1D => self.addr_abx(bus, Self::do_ora),
            0x1E => self.addr_abx_rmw(bus, Self::do_asl),
            0x1F => self.addr_abx_rmw(bus, Self::do_slo),
            0x20 => self.op_jsr(bus),
            0x21 => self.addr_izx(bus, Self::do_and),
            0x23 => self.addr_izx_rmw(bus, Self::do_rla),
            0x24 => self.addr_zp(bus, Self::do_bit),
            0x25 => self.addr_zp(bus, Self::do_and),
            0x26 => self.addr_zp_rmw(bus, Self::do_rol),
            0x27 => self.addr_zp_rmw(bus, Self::do_rla),
            0x28 => self.op_plp(bus),
            0x29 => self.addr_imm(bus, Self::do_and),
            0x2A => self.op_accum(bus, Self::do_rol),
            0x2C => self.addr_abs(bus, Self::do_bit),
            0x2D => self.addr_abs(bus, Self::do_and),
            0x2E => self.addr_abs_rmw(bus, Self::do_rol),
            0x2F => self.addr_abs_rmw(bus, Self::do_rla),
            0x30 => self.op_branch(bus, self.regs.p.is_set(N)),
            0x31 => self.addr_izy(bus, Self::do_and),
            0x33 => self.addr_izy_rmw(bus, Self::do_rla),
            0x35 => self.addr_zpx(bus, Self::do_and),
            0x36 => self.addr_zpx_rmw(bus, Self::do_rol),
            0x37 => self.addr_zpx_rmw(bus, Self::do_rla),
            0x38 => self.op_flag(bus, C, true),
            0x39 => self.addr_aby(bus, Self::do_and),
            0x3B => self.addr_aby_rmw(bus, Self::do_rla),
            0x3D => self.addr_abx(bus, Self::do_and),
            0x3E => self.addr_abx_rmw(bus, Self::do_rol),
            0x3F => self.addr_abx_rmw(bus, Self::do_rla),
            0x40 => self.op_rti(bus),
            0x41 => self.addr_izx(bus, Self::do_eor),
            0x43 => self.addr_izx_rmw(bus, Self::do_sre),
            0x45 => self.addr_zp(bus, Self::do_eor),
            0x46 => self.addr_zp_rmw(bus, Self::do_lsr),
            0x47 => self.addr_zp_rmw(bus, Self::do_sre),
            0x48 => self.op_pha(bus),
            0x49 => self.addr_imm(bus, Self::do_eor),
            0x4A => self.op_accum(bus, Self::do_lsr),
            0x4B => self.addr_imm(bus, Self::do_alr),
            0x4C => self.op_jmp_abs(bus),
            0x4D => self.addr_abs(bus, Self::do_eor),
            0x4E => self.addr_abs_rmw(bus, Self::do_lsr),
            0x4F => self.addr_abs_rmw(bus, Self::do_sre),
            0x50 => self.op_branch(bus, !self.regs.p.is_set(V)),
            0x51 => self.addr_izy(bus, Self::do_eor),
            0x53 => self.addr_izy_rmw(bus, Self::do_sre),
            0x55 => self.addr_zpx(bus, Self::do_eor),
            0x56 => self.addr_zpx_rmw(bus, Self::do_lsr),
            0x57 => self.addr_zpx_rmw(bus, Self::do_sre),
            0x58 => self.op_flag(bus, I, false),
            0x59 => self.addr_aby(bus, Self::do_eor),
            0x5B => self.addr_aby_rmw(bus, Self::do_sre),
            0x5D => self.addr_abx(bus, Self::do_eor),
            0x5E => self.addr_abx_rmw(bus, Self::do_lsr),
            0x5F => self.addr_abx_rmw(bus, Self::do_sre),
            0x60 => self.op_rts(bus),
            0x61 => self.addr_izx(bus, Self::do_adc),
            0x63 => self.addr_izx_rmw(bus, Self::do_rra),
            0x65 => self.addr_zp(bus, Self::do_adc),
            0x66 => self.addr_zp_rmw(bus, Self::do_ror),
            0x67 => self.addr_zp_rmw(bus, Self::do_rra),
            0x68 => self.op_pla(bus),
            0x69 => self.addr_imm(bus, Self::do_adc),
            0x6A => self.op_accum(bus, Self::do_ror),
            0x6B => self.addr_imm(bus, Self::do_arr),
            0x6C => self.op_jmp_ind(bus),
            0x6D => self.addr_abs(bus, Self::do_adc),
            0x6E => self.addr_abs_rmw(bus, Self::do_ror),
            0x6F => self.addr_abs_rmw(bus, Self::do_rra),
            0x70 => self.op_branch(bus, self.regs.p.is_set(V)),
            0x71 => self.addr_izy(bus, Self::do_adc),
            0x73 => self.addr_izy_rmw(bus, Self::do_rra),
            0x75 => self.addr_zpx(bus, Self::do_adc),
            0x76 => self.addr_zpx_rmw(bus, Self::do_ror),
            0x77 => self.addr_zpx_rmw(bus, Self::do_rra),
            0x78 => self.op_flag(bus, I, true),
            0x79 => self.addr_aby(bus, Self::do_adc),
            0x7B => self.addr_aby_rmw(bus, Self::do_rra),
            0x7D => self.addr_abx(bus, Self::do_adc),
            0x7E => self.addr_abx_rmw(bus, Self::do_ror),
            0x7F => self.addr_abx_rmw(bus, Self::do_rra),
            0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => self.addr_imm(bus, Self::do_nop_read),
            0x81 => self.addr_izx_w(bus, |c| c.regs.a),
            0x83 => self.addr_izx_w(bus, |c| c.regs.a & c.regs.x),
            0x84 => self.addr_zp_w(bus, |c| c.regs.y),
            0x85 => self.addr_zp_w(bus, |c| c.regs.a),
            0x86 => self.addr_zp_w(bus, |c| c.regs.x),
            0x87 => self.addr_zp_w(bus, |c| c.regs.a & c.regs.x),
            0x88 => self.op_implied(bus, |c| {
                c.regs.y = c.regs.y.wrapping_sub(1);
                let y = c.regs.y;
                c.regs.p.update_nz(y);
            }),
            0x8A => self.op_implied(bus, |c| {
                c.regs.a = c.regs.x;
                let a = c.regs.a;
                c.regs.p.update_nz(a);
            }),
            0x8B => self.addr_imm(bus, Self::do_ane),
            0x8C => self.addr_abs_w(bus, |c| c.regs.y),
            0x8D => self.addr_abs_w(bus, |c| c.regs.a),
            0x8E => self.addr_abs_w(bus, |c| c.regs.x),
            0x8F => self.addr_abs_w(bus, |c| c.regs.a & c.regs.x),
            0x90 => self.op_branch(bus, !self.regs.p.is_set(C)),
            0x91 => self.addr_izy_w(bus, |c, _| c.regs.a),
            0x93 => self.addr_izy_w(bus, |c, hi1| c.regs.a & c.regs.x & hi1),
            0x94 => self.addr_zpx_w(bus, |c| c.regs.y),
            0x95 => self.addr_zpx_w(bus, |c| c.regs.a),
            0x96 => self.addr_zpy_w(bus, |c| c.regs.x),
            0x97 => self.addr_zpy_w(bus, |c| c.regs.a & c.regs.x),
            0x98 => self.op_implied(bus, |c| {
                c.regs.a = c.regs.y;
                let a = c.regs.a;
                c.regs.p.update_nz(a);
            }),
            0x99 => self.addr_aby_w(bus, |c, _| c.regs.a),
            0x9A => self.op_implied(bus, |c| c.regs.sp = c.regs.x),
            0x9B => self.addr_aby_w(bus, |c, hi1| {
                c.regs.sp = c.regs.a & c.regs.x;
                c.regs.sp & hi1
            }),
            0x9C => self.addr_abx_w(bus, |c, hi1| c.regs.y & hi1),
            0x9D => self.addr_abx_w(bus, |c, _| c.regs.a),
            0x9E => self.addr_aby_w(bus, |c, hi1| c.regs.x & hi1),
            0x9F => self.addr_aby_w(bus, |c, hi1| c.regs.a & c.regs.x & hi1),
            0xA0 => self.addr_imm(bus, Self::do_ldy),
            0xA1 => self.addr_izx(bus, Self::do_lda),
            0xA2 => self.addr_imm(bus, Self::do_ldx),
            0xA3 => self.addr_izx(bus, Self::do_lax),
            0xA4 => self.addr_zp(bus, Self::do_ldy),
            0xA5 => self.addr_zp(bus, Self::do_lda),
            0xA6 => self.addr_zp(bus, Self::do_ldx),
            0xA7 => self.addr_zp(bus, Self::do_lax),
            0xA8 => self.op_implied(bus, |c| {
                c.regs.y = c.regs.a;
                let y = c.regs.y;
                c.regs.p.update_nz(y);
            }),
            0xA9 => self.addr_imm(bus, Self::do_lda),
            0xAA => self.op_implied(bus, |c| {
                c.regs.x = c.regs.a;
                let x = c.regs.x;
                c.regs.p.update_nz(x);
            }),
            0xAB => self.addr_imm(bus, Self::do_lax),
            0xAC => self.addr_abs(bus, Self::do_ldy),
            0xAD => self.addr_abs(bus, Self::do_lda),
            0xAE => self.addr_abs(bus, Self::do_ldx),
            0xAF => self.addr_abs(bus, Self::do_lax),
            0xB0 => self.op_branch(bus, self.regs.p.is_set(C)),
            0xB1 => self.addr_izy(bus, Self::do_lda),
            0xB3 => self.addr_izy(bus, Self::do_lax),
            0xB4 => self.addr_zpx(bus, Self::do_ldy),
            0xB5 => self.addr_zpx(bus, Self::do_lda),
            0xB6 => self.addr_zpy(bus, Self::do_ldx),
            0xB7 => self.addr_zpy(bus, Self::do_lax),
            0xB8 => self.op_flag(bus, V, false),
            0xB9 => self.addr_aby(bus, Self::do_lda),
            0xBA => self.op_implied(bus, |c| {
                c.regs.x = c.regs.sp;
                let x = c.regs.x;
                c.regs.p.update_nz(x);
            }),
            0xBB => self.addr_aby(bus, Self::do_las),
            0xBC => self.addr_abx(bus, Self::do_ldy),
            0xBD => self.addr_abx(bus, Self::do_lda),
            0xBE => self.addr_aby(bus, Self::do_ldx),
            0xBF => self.addr_aby(bus, Self::do_lax),
            0xC0 => self.addr_imm(bus, Self::do_cpy),
            0xC1 => self.addr_izx(bus, Self::do_cmp),
            0xC3 => self.addr_izx_rmw(bus, Self::do_dcp),
            0xC4 => self.addr_zp(bus, Self::do_cpy),
            0xC5 => self.addr_zp(bus, Self::do_cmp),
            0xC6 => self.addr_zp_rmw(bus, Self::do_dec),
            0xC7 => self.addr_zp_rmw(bus, Self::do_dcp),
            0xC8 => self.op_implied(bus, |c| {
                c.regs.y = c.regs.y.wrapping_add(1);
                let y = c.regs.y;
                c.regs.p.update_nz(y);
            }),
            0xC9 => self.addr_imm(bus, Self::do_cmp),
            0xCA => self.op_implied(bus, |c| {
                c.regs.x = c.regs.x.wrapping_sub(1);
                let x = c.regs.x;
                c.regs.p.update_nz(x);
            }),
            0xCB => self.addr_imm(bus, Self::do_sbx),
            0xCC => self.addr_abs(bus, Self::do_cpy),
            0xCD => self.addr_abs(bus, Self::do_cmp),
            0xCE => self.addr_abs_rmw(bus, Self::do_dec),
            0xCF => self.addr_abs_rmw(bus, Self::do_dcp),
            0xD0 => self.op_branch(bus, !self.regs.p.is_set(Z)),
            0xD1 => self.addr_izy(bus, Self::do_cmp),
            0xD3 => self.addr_izy_rmw(bus, Self::do_dcp),
            0xD5 => self.addr_zpx(bus, Self::do_cmp),
            0xD6 => self.addr_zpx_rmw(bus, Self::do_dec),
            0xD7 => self.addr_zpx_rmw(bus, Self::do_dcp),
            0xD8 => self.op_flag(bus, D, false),
            0xD9 => self.addr_aby(bus, Self::do_cmp),
            0xDB => self.addr_aby_rmw(bus, Self::do_dcp),
            0xDD => self.addr_abx(bus, Self::do_cmp),
            0xDE => self.addr_abx_rmw(bus, Self::do_dec),
            0xDF => self.addr_abx_rmw(bus, Self::do_dcp),
            0xE0 => self.addr_imm(bus, Self::do_cpx),
            0xE1 => self.addr_izx(bus, Self::do_sbc),
            0xE3 => self.addr_izx_rmw(bus, Self::do_isc),
            0xE4 => self.addr_zp(bus, Self::do_cpx),
            0xE5 => self.addr_zp(bus, Self::do_sbc),
            0xE6 => self.addr_zp_rmw(bus, Self::do_inc),
            0xE7 => self.addr_zp_rmw(bus, Self::do_isc),
            0xE8 => self.op_implied(bus, |c| {
                c.regs.x = c.regs.x.wrapping_add(1);
                let x = c.regs.x;
                c.regs.p.update_nz(x);
            }),
            0xE9 | 0xEB => self.addr_imm(bus, Self::do_sbc),
            0xEC => self.addr_abs(bus, Self::do_cpx),
            0xED => self.addr_abs(bus, Self::do_sbc),
            0xEE => self.addr_abs_rmw(bus, Self::do_inc),
            0xEF => self.addr_abs_rmw(bus, Self::do_isc),
            0xF0 => self.op_branch(bus, self.regs.p.is_set(Z)),
            0xF1 => self.addr_izy(bus, Self::do_sbc),
            0xF3 => self.addr_izy_rmw(bus, Self::do_isc),
            0xF5 => self.addr_zpx(bus, Self::do_sbc),
            0xF6 => self.addr_zpx_rmw(bus, Self::do_inc),
            0xF7 => self.addr_zpx_rmw(bus, Self::do_isc),
            0xF8 => self.op_flag(bus, D, true),
            0xF9 => self.addr_aby(bus, Self::do_sbc),
            0xFB => self.addr_aby_rmw(bus, Self::do_isc),
            0xFD => self.addr_abx(bus, Self::do_sbc),
            0xFE => self.addr_abx_rmw(bus, Self::do_inc),
            0xFF => self.addr_abx_rmw(bus, Self::do_isc),
        }
    }

    // =====================================================================
    // Addressing modes - reads
    // =====================================================================

    fn addr_imm<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        self.data = bus.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        op(self, self.data);
        self.finish();
    }

    fn addr_zp<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    fn addr_zp_indexed<BUS: Bus>(&mut self, bus: &mut BUS, index: u8, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.addr = u16::from(self.pointer.wrapping_add(index));
                self.cycle = 3;
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    fn addr_zpx<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        let x = self.regs.x;
        self.addr_zp_indexed(bus, x, op);
    }

    fn addr_zpy<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        let y = self.regs.y;
        self.addr_zp_indexed(bus, y, op);
    }

    fn addr_abs<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr |= u16::from(bus.read(self.regs.pc)) << 8;
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 3;
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    /// Absolute indexed read: 4 cycles, +1 on page cross.
    fn addr_abs_indexed<BUS: Bus>(&mut self, bus: &mut BUS, index: u8, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let hi = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                let lo = (self.addr as u8).wrapping_add(index);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < index); // page-cross marker
                self.cycle = 3;
            }
            3 => {
                if self.data != 0 {
                    let _ = bus.read(self.addr);
                    self.addr = self.addr.wrapping_add(0x100);
                    self.cycle = 4;
                } else {
                    self.data = bus.read(self.addr);
                    op(self, self.data);
                    self.finish();
                }
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    fn addr_abx<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        let x = self.regs.x;
        self.addr_abs_indexed(bus, x, op);
    }

    fn addr_aby<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        let y = self.regs.y;
        self.addr_abs_indexed(bus, y, op);
    }

    fn addr_izx<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.pointer = self.pointer.wrapping_add(self.regs.x);
                self.cycle = 3;
            }
            3 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 4;
            }
            4 => {
                self.addr |= u16::from(bus.read(u16::from(self.pointer.wrapping_add(1)))) << 8;
                self.cycle = 5;
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    fn addr_izy<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8)) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 3;
            }
            3 => {
                let hi = bus.read(u16::from(self.pointer.wrapping_add(1)));
                let lo = (self.addr as u8).wrapping_add(self.regs.y);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < self.regs.y);
                self.cycle = 4;
            }
            4 => {
                if self.data != 0 {
                    let _ = bus.read(self.addr);
                    self.addr = self.addr.wrapping_add(0x100);
                    self.cycle = 5;
                } else {
                    self.data = bus.read(self.addr);
                    op(self, self.data);
                    self.finish();
                }
            }
            _ => {
                self.data = bus.read(self.addr);
                op(self, self.data);
                self.finish();
            }
        }
    }

    // =====================================================================
    // Addressing modes - writes
    // =====================================================================

    fn addr_zp_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self) -> u8) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            _ => {
                bus.write(self.addr, val(self));
                self.finish();
            }
        }
    }

    fn addr_zp_indexed_w<BUS: Bus>(&mut self, bus: &mut BUS, index: u8, val: fn(&Self) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.addr = u16::from(self.pointer.wrapping_add(index));
                self.cycle = 3;
            }
            _ => {
                bus.write(self.addr, val(self));
                self.finish();
            }
        }
    }

    fn addr_zpx_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self) -> u8) {
        let x = self.regs.x;
        self.addr_zp_indexed_w(bus, x, val);
    }

    fn addr_zpy_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self) -> u8) {
        let y = self.regs.y;
        self.addr_zp_indexed_w(bus, y, val);
    }

    fn addr_abs_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self) -> u8) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr |= u16::from(bus.read(self.regs.pc)) << 8;
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 3;
            }
            _ => {
                bus.write(self.addr, val(self));
                self.finish();
            }
        }
    }

    /// Absolute indexed store: always 5 cycles. The value function also
    /// receives base-high+1 for the SHA/SHX/SHY/TAS family.
    fn addr_abs_indexed_w<BUS: Bus>(
        &mut self,
        bus: &mut BUS,
        index: u8,
        val: fn(&mut Self, u8) -> u8,
    ) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let hi = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                let lo = (self.addr as u8).wrapping_add(index);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < index);
                self.pointer = hi; // base high byte, for the unstable stores
                self.cycle = 3;
            }
            3 => {
                let _ = bus.read(self.addr);
                if self.data != 0 {
                    self.addr = self.addr.wrapping_add(0x100);
                }
                self.cycle = 4;
            }
            _ => {
                let hi1 = self.pointer.wrapping_add(1);
                let value = val(self, hi1);
                bus.write(self.addr, value);
                self.finish();
            }
        }
    }

    fn addr_abx_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&mut Self, u8) -> u8) {
        let x = self.regs.x;
        self.addr_abs_indexed_w(bus, x, val);
    }

    fn addr_aby_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&mut Self, u8) -> u8) {
        let y = self.regs.y;
        self.addr_abs_indexed_w(bus, y, val);
    }

    fn addr_izx_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.pointer = self.pointer.wrapping_add(self.regs.x);
                self.cycle = 3;
            }
            3 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 4;
            }
            4 => {
                self.addr |= u16::from(bus.read(u16::from(self.pointer.wrapping_add(1)))) << 8;
                self.cycle = 5;
            }
            _ => {
                bus.write(self.addr, val(self));
                self.finish();
            }
        }
    }

    /// (zp),Y store: always 6 cycles. Value fn receives base-high+1.
    fn addr_izy_w<BUS: Bus>(&mut self, bus: &mut BUS, val: fn(&Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 3;
            }
            3 => {
                let hi = bus.read(u16::from(self.pointer.wrapping_add(1)));
                let lo = (self.addr as u8).wrapping_add(self.regs.y);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < self.regs.y);
                self.pointer = hi;
                self.cycle = 4;
            }
            4 => {
                let _ = bus.read(self.addr);
                if self.data != 0 {
                    self.addr = self.addr.wrapping_add(0x100);
                }
                self.cycle = 5;
            }
            _ => {
                let value = val(self, self.pointer.wrapping_add(1));
                bus.write(self.addr, value);
                self.finish();
            }
        }
    }

    // =====================================================================
    // Addressing modes - read-modify-write
    // =====================================================================

    fn addr_zp_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.data = bus.read(self.addr);
                self.cycle = 3;
            }
            3 => {
                // Dummy write of the unmodified value.
                bus.write(self.addr, self.data);
                self.cycle = 4;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    fn addr_zpx_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.addr = u16::from(self.pointer.wrapping_add(self.regs.x));
                self.cycle = 3;
            }
            3 => {
                self.data = bus.read(self.addr);
                self.cycle = 4;
            }
            4 => {
                bus.write(self.addr, self.data);
                self.cycle = 5;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    fn addr_abs_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr |= u16::from(bus.read(self.regs.pc)) << 8;
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 3;
            }
            3 => {
                self.data = bus.read(self.addr);
                self.cycle = 4;
            }
            4 => {
                bus.write(self.addr, self.data);
                self.cycle = 5;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    /// Absolute indexed RMW: always 7 cycles.
    fn addr_abs_indexed_rmw<BUS: Bus>(
        &mut self,
        bus: &mut BUS,
        index: u8,
        op: fn(&mut Self, u8) -> u8,
    ) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let hi = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                let lo = (self.addr as u8).wrapping_add(index);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < index);
                self.cycle = 3;
            }
            3 => {
                let _ = bus.read(self.addr);
                if self.data != 0 {
                    self.addr = self.addr.wrapping_add(0x100);
                }
                self.cycle = 4;
            }
            4 => {
                self.data = bus.read(self.addr);
                self.cycle = 5;
            }
            5 => {
                bus.write(self.addr, self.data);
                self.cycle = 6;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    fn addr_abx_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        let x = self.regs.x;
        self.addr_abs_indexed_rmw(bus, x, op);
    }

    fn addr_aby_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        let y = self.regs.y;
        self.addr_abs_indexed_rmw(bus, y, op);
    }

    /// (zp,X) RMW: 8 cycles (the illegal combos).
    fn addr_izx_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(u16::from(self.pointer));
                self.pointer = self.pointer.wrapping_add(self.regs.x);
                self.cycle = 3;
            }
            3 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 4;
            }
            4 => {
                self.addr |= u16::from(bus.read(u16::from(self.pointer.wrapping_add(1)))) << 8;
                self.cycle = 5;
            }
            5 => {
                self.data = bus.read(self.addr);
                self.cycle = 6;
            }
            6 => {
                bus.write(self.addr, self.data);
                self.cycle = 7;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    /// (zp),Y RMW: 8 cycles (the illegal combos).
    fn addr_izy_rmw<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        match self.cycle {
            1 => {
                self.pointer = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr = u16::from(bus.read(u16::from(self.pointer)));
                self.cycle = 3;
            }
            3 => {
                let hi = bus.read(u16::from(self.pointer.wrapping_add(1)));
                let lo = (self.addr as u8).wrapping_add(self.regs.y);
                self.addr = u16::from(lo) | (u16::from(hi) << 8);
                self.data = u8::from(lo < self.regs.y);
                self.cycle = 4;
            }
            4 => {
                let _ = bus.read(self.addr);
                if self.data != 0 {
                    self.addr = self.addr.wrapping_add(0x100);
                }
                self.cycle = 5;
            }
            5 => {
                self.data = bus.read(self.addr);
                self.cycle = 6;
            }
            6 => {
                bus.write(self.addr, self.data);
                self.cycle = 7;
            }
            _ => {
                let result = op(self, self.data);
                bus.write(self.addr, result);
                self.finish();
            }
        }
    }

    // =====================================================================
    // Control-flow and stack opcodes
    // =====================================================================

    /// BRK and the IRQ/NMI sequence share microcode; interrupts neither
    /// advance PC nor set the pushed B flag.
    fn op_brk<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                // BRK padding byte; interrupts repeat the dummy read
                // without advancing PC.
                let _ = bus.read(self.regs.pc);
                if self.int_kind == IntKind::None {
                    self.regs.pc = self.regs.pc.wrapping_add(1);
                }
                self.cycle = 2;
            }
            2 => {
                let pch = (self.regs.pc >> 8) as u8;
                self.push(bus, pch);
                self.cycle = 3;
            }
            3 => {
                let pcl = self.regs.pc as u8;
                self.push(bus, pcl);
                self.cycle = 4;
            }
            4 => {
                let p = if self.int_kind == IntKind::None {
                    self.regs.p.to_byte_brk()
                } else {
                    self.regs.p.to_byte_irq()
                };
                self.push(bus, p);
                // An NMI arriving this late hijacks a BRK/IRQ vector.
                self.addr = if self.int_kind == IntKind::Nmi {
                    0xFFFA
                } else {
                    0xFFFE
                };
                self.cycle = 5;
            }
            5 => {
                self.data = bus.read(self.addr);
                self.regs.p.set(I);
                self.cycle = 6;
            }
            _ => {
                let hi = bus.read(self.addr.wrapping_add(1));
                self.regs.pc = u16::from(self.data) | (u16::from(hi) << 8);
                self.finish();
            }
        }
    }

    fn op_rti<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            2 => {
                // Stack pointer pre-increment dummy.
                let _ = bus.read(0x0100 | u16::from(self.regs.sp));
                self.cycle = 3;
            }
            3 => {
                let p = self.pop(bus);
                self.regs.p = Status::from_byte(p & !B);
                self.cycle = 4;
            }
            4 => {
                self.data = self.pop(bus);
                self.cycle = 5;
            }
            _ => {
                let hi = self.pop(bus);
                self.regs.pc = u16::from(self.data) | (u16::from(hi) << 8);
                self.finish();
            }
        }
    }

    fn op_jsr<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                // Internal stack operation.
                let _ = bus.read(0x0100 | u16::from(self.regs.sp));
                self.cycle = 3;
            }
            3 => {
                let pch = (self.regs.pc >> 8) as u8;
                self.push(bus, pch);
                self.cycle = 4;
            }
            4 => {
                let pcl = self.regs.pc as u8;
                self.push(bus, pcl);
                self.cycle = 5;
            }
            _ => {
                let hi = bus.read(self.regs.pc);
                self.regs.pc = self.addr | (u16::from(hi) << 8);
                self.finish();
            }
        }
    }

    fn op_rts<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(0x0100 | u16::from(self.regs.sp));
                self.cycle = 3;
            }
            3 => {
                self.data = self.pop(bus);
                self.cycle = 4;
            }
            4 => {
                let hi = self.pop(bus);
                self.regs.pc = u16::from(self.data) | (u16::from(hi) << 8);
                self.cycle = 5;
            }
            _ => {
                let _ = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.finish();
            }
        }
    }

    fn op_jmp_abs<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            _ => {
                let hi = bus.read(self.regs.pc);
                self.regs.pc = self.addr | (u16::from(hi) << 8);
                self.finish();
            }
        }
    }

    fn op_jmp_ind<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                self.addr = u16::from(bus.read(self.regs.pc));
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 2;
            }
            2 => {
                self.addr |= u16::from(bus.read(self.regs.pc)) << 8;
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.cycle = 3;
            }
            3 => {
                self.data = bus.read(self.addr);
                self.cycle = 4;
            }
            _ => {
                // Famous bug: the high byte read wraps within the page.
                let hi_addr =
                    (self.addr & 0xFF00) | u16::from((self.addr as u8).wrapping_add(1));
                let hi = bus.read(hi_addr);
                self.regs.pc = u16::from(self.data) | (u16::from(hi) << 8);
                self.finish();
            }
        }
    }

    fn op_branch<BUS: Bus>(&mut self, bus: &mut BUS, taken: bool) {
        match self.cycle {
            1 => {
                self.data = bus.read(self.regs.pc);
                self.regs.pc = self.regs.pc.wrapping_add(1);
                if taken {
                    self.cycle = 2;
                } else {
                    self.finish();
                }
            }
            2 => {
                let _ = bus.read(self.regs.pc);
                let offset = i16::from(self.data as i8);
                let target = self.regs.pc.wrapping_add(offset as u16);
                if target & 0xFF00 == self.regs.pc & 0xFF00 {
                    self.regs.pc = target;
                    self.finish();
                } else {
                    self.addr = target;
                    self.cycle = 3;
                }
            }
            _ => {
                // Page-cross fix-up cycle.
                let _ = bus.read((self.regs.pc & 0xFF00) | (self.addr & 0x00FF));
                self.regs.pc = self.addr;
                self.finish();
            }
        }
    }

    fn op_php<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            _ => {
                let p = self.regs.p.to_byte_brk();
                self.push(bus, p);
                self.finish();
            }
        }
    }

    fn op_pha<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            _ => {
                let a = self.regs.a;
                self.push(bus, a);
                self.finish();
            }
        }
    }

    fn op_plp<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(0x0100 | u16::from(self.regs.sp));
                self.cycle = 3;
            }
            _ => {
                let p = self.pop(bus);
                self.regs.p = Status::from_byte(p & !B);
                self.finish();
            }
        }
    }

    fn op_pla<BUS: Bus>(&mut self, bus: &mut BUS) {
        match self.cycle {
            1 => {
                let _ = bus.read(self.regs.pc);
                self.cycle = 2;
            }
            2 => {
                let _ = bus.read(0x0100 | u16::from(self.regs.sp));
                self.cycle = 3;
            }
            _ => {
                self.regs.a = self.pop(bus);
                let a = self.regs.a;
                self.regs.p.update_nz(a);
                self.finish();
            }
        }
    }

    /// Two-cycle implied-mode instruction.
    fn op_implied<BUS: Bus>(&mut self, bus: &mut BUS, body: fn(&mut Self)) {
        let _ = bus.read(self.regs.pc);
        body(self);
        self.finish();
    }

    fn op_flag<BUS: Bus>(&mut self, bus: &mut BUS, flag: u8, set: bool) {
        let _ = bus.read(self.regs.pc);
        self.regs.p.set_if(flag, set);
        self.finish();
    }

    fn op_nop<BUS: Bus>(&mut self, bus: &mut BUS) {
        let _ = bus.read(self.regs.pc);
        self.finish();
    }

    /// Accumulator-mode shift/rotate.
    fn op_accum<BUS: Bus>(&mut self, bus: &mut BUS, op: fn(&mut Self, u8) -> u8) {
        let _ = bus.read(self.regs.pc);
        let a = self.regs.a;
        self.regs.a = op(self, a);
        self.finish();
    }

    fn op_jam(&mut self) {
        log::warn!("CPU jam: opcode ${:02X} at ${:04X}", self.opcode, self.regs.pc);
        self.state = State::Jammed;
    }

    // =====================================================================
    // ALU bodies
    // =====================================================================

    fn do_ora(&mut self, value: u8) {
        self.regs.a |= value;
        let a = self.regs.a;
        self.regs.p.update_nz(a);
    }

    fn do_and(&mut self, value: u8) {
        self.regs.a &= value;
        let a = self.regs.a;
        self.regs.p.update_nz(a);
    }

    fn do_eor(&mut self, value: u8) {
        self.regs.a ^= value;
        let a = self.regs.a;
        self.regs.p.update_nz(a);
    }

    fn do_adc(&mut self, value: u8) {
        if self.regs.p.is_set(D) {
            self.do_adc_bcd(value);
            return;
        }
        let carry = u16::from(self.regs.p.is_set(C));
        let sum = u16::from(self.regs.a) + u16::from(value) + carry;
        let result = sum as u8;
        self.regs.p.set_if(C, sum > 0xFF);
        self.regs
            .p
            .set_if(V, (self.regs.a ^ result) & (value ^ result) & 0x80 != 0);
        self.regs.a = result;
        self.regs.p.update_nz(result);
    }

    fn do_adc_bcd(&mut self, value: u8) {
        let carry = u8::from(self.regs.p.is_set(C));
        let a = self.regs.a;
        let mut lo = (a & 0x0F) + (value & 0x0F) + carry;
        let mut hi = (a >> 4) + (value >> 4);
        if lo > 9 {
            lo += 6;
            hi += 1;
        }
        // N and V come from the binary intermediate.
        let bin = (u16::from(a) + u16::from(value) + u16::from(carry)) as u8;
        self.regs.p.set_if(Z, bin == 0);
        self.regs.p.set_if(N, (hi << 4) & 0x80 != 0);
        self.regs
            .p
            .set_if(V, (a ^ (hi << 4)) & (value ^ (hi << 4)) & 0x80 != 0);
        if hi > 9 {
            hi += 6;
        }
        self.regs.p.set_if(C, hi > 15);
        self.regs.a = (hi << 4) | (lo & 0x0F);
    }

    fn do_sbc(&mut self, value: u8) {
        if self.regs.p.is_set(D) {
            self.do_sbc_bcd(value);
            return;
        }
        let carry = u16::from(!self.regs.p.is_set(C));
        let a = u16::from(self.regs.a);
        let diff = a.wrapping_sub(u16::from(value)).wrapping_sub(carry);
        let result = diff as u8;
        self.regs.p.set_if(C, diff < 0x100);
        self.regs
            .p
            .set_if(V, (self.regs.a ^ value) & (self.regs.a ^ result) & 0x80 != 0);
        self.regs.a = result;
        self.regs.p.update_nz(result);
    }

    fn do_sbc_bcd(&mut self, value: u8) {
        let borrow = u8::from(!self.regs.p.is_set(C));
        let a = self.regs.a;
        // Flags match binary subtraction.
        let bin = u16::from(a)
            .wrapping_sub(u16::from(value))
            .wrapping_sub(u16::from(borrow));
        let bin8 = bin as u8;
        self.regs.p.set_if(C, bin < 0x100);
        self.regs
            .p
            .set_if(V, (a ^ value) & (a ^ bin8) & 0x80 != 0);
        self.regs.p.update_nz(bin8);

        let mut lo = (a & 0x0F).wrapping_sub(value & 0x0F).wrapping_sub(borrow);
        let mut hi = (a >> 4).wrapping_sub(value >> 4);
        if lo & 0x10 != 0 {
            lo = lo.wrapping_sub(6);
            hi = hi.wrapping_sub(1);
        }
        if hi & 0x10 != 0 {
            hi = hi.wrapping_sub(6);
        }
        self.regs.a = (hi << 4) | (lo & 0x0F);
    }

    fn do_cmp(&mut self, value: u8) {
        let a = self.regs.a;
        self.regs.p.set_if(C, a >= value);
        self.regs.p.update_nz(a.wrapping_sub(value));
    }

    fn do_cpx(&mut self, value: u8) {
        let x = self.regs.x;
        self.regs.p.set_if(C, x >= value);
        self.regs.p.update_nz(x.wrapping_sub(value));
    }

    fn do_cpy(&mut self, value: u8) {
        let y = self.regs.y;
        self.regs.p.set_if(C, y >= value);
        self.regs.p.update_nz(y.wrapping_sub(value));
    }

    fn do_bit(&mut self, value: u8) {
        self.regs.p.set_if(N, value & 0x80 != 0);
        self.regs.p.set_if(V, value & 0x40 != 0);
        let masked = self.regs.a & value;
        self.regs.p.set_if(Z, masked == 0);
    }

    fn do_lda(&mut self, value: u8) {
        self.regs.a = value;
        self.regs.p.update_nz(value);
    }

    fn do_ldx(&mut self, value: u8) {
        self.regs.x = value;
        self.regs.p.update_nz(value);
    }

    fn do_ldy(&mut self, value: u8) {
        self.regs.y = value;
        self.regs.p.update_nz(value);
    }

    fn do_nop_read(&mut self, _value: u8) {}

    fn do_asl(&mut self, value: u8) -> u8 {
        self.regs.p.set_if(C, value & 0x80 != 0);
        let result = value << 1;
        self.regs.p.update_nz(result);
        result
    }

    fn do_lsr(&mut self, value: u8) -> u8 {
        self.regs.p.set_if(C, value & 0x01 != 0);
        let result = value >> 1;
        self.regs.p.update_nz(result);
        result
    }

    fn do_rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.regs.p.is_set(C));
        self.regs.p.set_if(C, value & 0x80 != 0);
        let result = (value << 1) | carry_in;
        self.regs.p.update_nz(result);
        result
    }

    fn do_ror(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.regs.p.is_set(C)) << 7;
        self.regs.p.set_if(C, value & 0x01 != 0);
        let result = (value >> 1) | carry_in;
        self.regs.p.update_nz(result);
        result
    }

    fn do_dec(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.regs.p.update_nz(result);
        result
    }

    fn do_inc(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.regs.p.update_nz(result);
        result
    }

    // --- Illegal opcode bodies -------------------------------------------

    fn do_slo(&mut self, value: u8) -> u8 {
        let shifted = self.do_asl(value);
        self.do_ora(shifted);
        shifted
    }

    fn do_rla(&mut self, value: u8) -> u8 {
        let rotated = self.do_rol(value);
        self.do_and(rotated);
        rotated
    }

    fn do_sre(&mut self, value: u8) -> u8 {
        let shifted = self.do_lsr(value);
        self.do_eor(shifted);
        shifted
    }

    fn do_rra(&mut self, value: u8) -> u8 {
        let rotated = self.do_ror(value);
        self.do_adc(rotated);
        rotated
    }

    fn do_dcp(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.do_cmp(result);
        result
    }

    fn do_isc(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.do_sbc(result);
        result
    }

    fn do_lax(&mut self, value: u8) {
        self.regs.a = value;
        self.regs.x = value;
        self.regs.p.update_nz(value);
    }

    fn do_anc(&mut self, value: u8) {
        self.do_and(value);
        let n = self.regs.p.is_set(N);
        self.regs.p.set_if(C, n);
    }

    fn do_alr(&mut self, value: u8) {
        self.regs.a &= value;
        let a = self.regs.a;
        self.regs.a = self.do_lsr(a);
    }

    fn do_arr(&mut self, value: u8) {
        let and = self.regs.a & value;
        let carry_in = u8::from(self.regs.p.is_set(C)) << 7;
        let result = (and >> 1) | carry_in;
        self.regs.a = result;
        self.regs.p.update_nz(result);
        self.regs.p.set_if(C, result & 0x40 != 0);
        self.regs
            .p
            .set_if(V, ((result >> 6) ^ (result >> 5)) & 1 != 0);
    }

    fn do_ane(&mut self, value: u8) {
        // "Magic constant" model of the unstable bus interaction.
        self.regs.a = (self.regs.a | 0xEE) & self.regs.x & value;
        let a = self.regs.a;
        self.regs.p.update_nz(a);
    }

    fn do_sbx(&mut self, value: u8) {
        let ax = self.regs.a & self.regs.x;
        self.regs.p.set_if(C, ax >= value);
        self.regs.x = ax.wrapping_sub(value);
        let x = self.regs.x;
        self.regs.p.update_nz(x);
    }

    fn do_las(&mut self, value: u8) {
        let result = value & self.regs.sp;
        self.regs.a = result;
        self.regs.x = result;
        self.regs.sp = result;
        self.regs.p.update_nz(result);
    }

    // =====================================================================
    // Snapshot
    // =====================================================================

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u8(self.regs.a);
        w.u8(self.regs.x);
        w.u8(self.regs.y);
        w.u8(self.regs.sp);
        w.u16(self.regs.pc);
        w.u8(self.regs.p.0);
        w.u8(match self.state {
            State::FetchOpcode => 0,
            State::Execute => 1,
            State::Jammed => 2,
        });
        w.u8(self.opcode);
        w.u8(self.cycle);
        w.u16(self.addr);
        w.u8(self.data);
        w.u8(self.pointer);
        w.u8(match self.int_kind {
            IntKind::None => 0,
            IntKind::Irq => 1,
            IntKind::Nmi => 2,
        });
        w.u8(self.irq_line);
        w.u64(self.irq_line_since);
        w.u8(self.nmi_sources);
        w.bool(self.nmi_pending);
        w.u64(self.nmi_since);
        w.u64(self.total_cycles);
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.regs.a = r.u8()?;
        self.regs.x = r.u8()?;
        self.regs.y = r.u8()?;
        self.regs.sp = r.u8()?;
        self.regs.pc = r.u16()?;
        self.regs.p = Status(r.u8()? | U);
        self.state = match r.u8()? {
            0 => State::FetchOpcode,
            1 => State::Execute,
            _ => State::Jammed,
        };
        self.opcode = r.u8()?;
        self.cycle = r.u8()?;
        self.addr = r.u16()?;
        self.data = r.u8()?;
        self.pointer = r.u8()?;
        self.int_kind = match r.u8()? {
            1 => IntKind::Irq,
            2 => IntKind::Nmi,
            _ => IntKind::None,
        };
        self.irq_line = r.u8()?;
        self.irq_line_since = r.u64()?;
        self.nmi_sources = r.u8()?;
        self.nmi_pending = r.bool()?;
        self.nmi_since = r.u64()?;
        self.total_cycles = r.u64()?;
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
