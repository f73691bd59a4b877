//! The machine: chip ensemble, system bus and the cycle scheduler.
//!
//! Every machine cycle has two phases, executed in a fixed order:
//!
//! ```text
//!  <---------- phi2 low ---------->|<------- phi2 high ------->
//!  VIC -> CIA1 -> CIA2 -> IEC sync | CPU -> drive -> datasette
//! ```
//!
//! The VIC may assert BA during its slot, stalling the CPU slot of the
//! same cycle (badline DMA). The drive is advanced by the main cycle's
//! duration in picoseconds so its fixed 1 MHz clock drifts correctly
//! against PAL/NTSC. At the end of each frame the TOD clocks tick, the
//! SID catches up, housekeeping runs, and the loop either sleeps to
//! real time or, in warp mode, immediately continues.

use crate::cia::{Cia, PortInputs};
use crate::clock::{HostClock, MonotonicClock};
use crate::config::{C64Config, C64Model};
use crate::cpu::{int_source, Bus, Cpu};
use crate::d64::D64;
use crate::datasette::Datasette;
use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::expansion::ExpansionPort;
use crate::iec::IecBus;
use crate::keyboard::KeyboardMatrix;
use crate::memory::{MemSrc, Memory};
use crate::messages::{Message, MessageQueue};
use crate::mouse::Mouse;
use crate::prg::Prg;
use crate::sid::Sid;
use crate::snapshot::{Reader, Writer, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
use crate::vic::Vic;
use crossbeam_channel::Receiver;

/// Restart the frame timer when it runs ahead by more than this
/// (host clock jumped backwards or we were paused).
const MAX_JITTER_NANOS: u64 = 1_000_000_000;

/// Restart the frame timer when we lag behind by more than this
/// instead of sleeping the debt away.
const MAX_LAG_NANOS: u64 = 200_000_000;

/// Everything the CPU can reach over the bus. Owning the chips here
/// keeps the borrow graph acyclic: the CPU borrows the bus per tick,
/// per-cycle chip calls borrow sibling fields.
pub struct C64Bus {
    pub mem: Memory,
    pub vic: Vic,
    pub sid: Sid,
    pub cia1: Cia,
    pub cia2: Cia,
    pub exp: ExpansionPort,
    pub iec: IecBus,
    pub keyboard: KeyboardMatrix,
    pub datasette: Datasette,
    pub mouse: Mouse,
    /// Joystick line states, active low (port 1 on CIA1 PB, port 2 on
    /// CIA1 PA).
    pub joystick1: u8,
    pub joystick2: u8,
    /// Mirror of the machine cycle, used for lazy SID catch-up during
    /// CPU bus accesses.
    cycle: u64,
}

impl C64Bus {
    fn new(config: &C64Config) -> Self {
        Self {
            mem: Memory::new(
                &config.roms.basic,
                &config.roms.charset,
                &config.roms.kernal,
            ),
            vic: Vic::new(config.model),
            sid: Sid::new(config.model.cpu_frequency(), config.sample_rate),
            cia1: Cia::new(),
            cia2: Cia::new(),
            exp: ExpansionPort::new(),
            iec: IecBus::new(),
            keyboard: KeyboardMatrix::new(),
            datasette: Datasette::new(),
            mouse: Mouse::new(),
            joystick1: 0xFF,
            joystick2: 0xFF,
            cycle: 0,
        }
    }

    /// Phi2-low VIC slot (separate fn so the field borrows are disjoint).
    fn tick_vic(&mut self) {
        let Self { vic, mem, .. } = self;
        vic.tick(mem);
    }

    /// CIA1 port inputs: keyboard columns and both joysticks.
    fn cia1_inputs(&self) -> PortInputs {
        let row_select = self.cia1.port_a_output();
        let mut b = self.keyboard.scan(row_select) & self.joystick1;
        let mut a = self.joystick2;
        match self.mouse.port() {
            1 => b &= self.mouse.control_port_bits(),
            2 => a &= self.mouse.control_port_bits(),
            _ => {}
        }
        PortInputs { a, b }
    }

    /// CIA2 port inputs: the IEC CLK/DATA read-back lines.
    fn cia2_inputs(&self) -> PortInputs {
        PortInputs {
            a: self.iec.cia2_port_a_in(),
            b: 0xFF,
        }
    }

    /// Push new CIA2 output levels to the VIC bank and IEC lines.
    fn cia2_port_a_changed(&mut self) {
        let out = self.cia2.port_a_output();
        self.vic.set_bank(!out & 0x03);
        self.iec.set_dirty_c64_side();
    }

    /// Pick up a GAME/EXROM move after any expansion-port access.
    fn sync_cartridge_lines(&mut self) {
        if self.exp.take_lines_dirty() {
            self.mem
                .set_cartridge_lines(self.exp.game_line(), self.exp.exrom_line());
        }
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        match addr {
            0xD000..=0xD3FF => self.vic.read((addr & 0x3F) as u8),
            0xD400..=0xD7FF => self.sid.read((addr & 0x1F) as u8, self.cycle),
            0xD800..=0xDBFF => self.mem.color_ram_read(addr - 0xD800),
            0xDC00..=0xDCFF => {
                let inputs = self.cia1_inputs();
                self.cia1.read((addr & 0x0F) as u8, inputs)
            }
            0xDD00..=0xDDFF => {
                let inputs = self.cia2_inputs();
                self.cia2.read((addr & 0x0F) as u8, inputs)
            }
            0xDE00..=0xDEFF => {
                let value = self.exp.peek_io1(addr);
                self.sync_cartridge_lines();
                value
            }
            _ => {
                let value = self.exp.peek_io2(addr);
                self.sync_cartridge_lines();
                value
            }
        }
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        match addr {
            0xD000..=0xD3FF => self.vic.write((addr & 0x3F) as u8, value),
            0xD400..=0xD7FF => self.sid.write((addr & 0x1F) as u8, value, self.cycle),
            0xD800..=0xDBFF => self.mem.color_ram_write(addr - 0xD800, value),
            0xDC00..=0xDCFF => self.cia1.write((addr & 0x0F) as u8, value),
            0xDD00..=0xDDFF => {
                self.cia2.write((addr & 0x0F) as u8, value);
                if matches!(addr & 0x0F, 0x00 | 0x02) {
                    self.cia2_port_a_changed();
                }
            }
            0xDE00..=0xDEFF => {
                self.exp.poke_io1(addr, value);
                self.sync_cartridge_lines();
            }
            _ => {
                self.exp.poke_io2(addr, value);
                self.sync_cartridge_lines();
            }
        }
    }

    /// Side-effect-free inspection read.
    pub fn spy(&self, addr: u16) -> u8 {
        match self.mem.peek_source(addr) {
            MemSrc::Io => match addr {
                0xD000..=0xD3FF => self.vic.spy((addr & 0x3F) as u8),
                0xD800..=0xDBFF => self.mem.color_ram_read(addr - 0xD800),
                0xDC00..=0xDCFF => self.cia1.spy((addr & 0x0F) as u8, self.cia1_inputs()),
                0xDD00..=0xDDFF => self.cia2.spy((addr & 0x0F) as u8, self.cia2_inputs()),
                // Spying the expansion I/O windows would trigger variant
                // side effects; report the floating bus instead.
                _ => 0xFF,
            },
            MemSrc::CrtLo => self
                .exp
                .cartridge()
                .map_or(0xFF, |cart| cart.spy_roml(addr)),
            MemSrc::CrtHi => 0xFF,
            src => self.mem.peek_internal(addr, src),
        }
    }
}

impl Bus for C64Bus {
    /// Every read consults the current lookup table (the tables are
    /// rebuilt before the next access whenever the port or cartridge
    /// lines move).
    fn read(&mut self, addr: u16) -> u8 {
        match self.mem.peek_source(addr) {
            MemSrc::Io => self.io_read(addr),
            MemSrc::CrtLo => {
                let value = self.exp.peek_roml(addr);
                self.sync_cartridge_lines();
                value
            }
            MemSrc::CrtHi => {
                let value = self.exp.peek_romh(addr);
                self.sync_cartridge_lines();
                value
            }
            src => self.mem.peek_internal(addr, src),
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match self.mem.poke_destination(addr) {
            MemSrc::Io => self.io_write(addr, value),
            MemSrc::CrtLo => {
                self.exp.poke_roml(addr, value);
                self.sync_cartridge_lines();
            }
            MemSrc::CrtHi => {
                self.exp.poke_romh(addr, value);
                self.sync_cartridge_lines();
            }
            MemSrc::Open if self.mem.ultimax() => {
                // Ultimax writes outside I/O are the cartridge's problem;
                // RAM never sees them.
                self.exp.poke_roml(addr, value);
                self.sync_cartridge_lines();
            }
            dst => {
                self.mem.poke_internal(addr, value, dst);
            }
        }
    }
}

/// The complete machine.
pub struct C64 {
    pub cpu: Cpu,
    pub bus: C64Bus,
    pub drive: Drive,

    model: C64Model,
    /// Master cycle counter; advances exactly once per executed cycle.
    cycle: u64,
    frame: u64,
    cycle_duration_ps: u64,

    warp: bool,
    warp_load: bool,
    always_warp: bool,

    clock: Box<dyn HostClock>,
    frame_delay_nanos: u64,
    nano_target: u64,

    msgq: MessageQueue,
}

impl C64 {
    pub fn new(config: C64Config) -> Result<Self> {
        let msgq = MessageQueue::new();
        let bus = C64Bus::new(&config);
        let drive = Drive::new(config.roms.drive.clone(), msgq.clone());
        let mut c64 = Self {
            cpu: Cpu::new(),
            bus,
            drive,
            model: config.model,
            cycle: 0,
            frame: 0,
            cycle_duration_ps: config.model.cycle_duration_ps(),
            warp: false,
            warp_load: config.warp_load,
            always_warp: config.always_warp,
            clock: Box::new(MonotonicClock::new()),
            frame_delay_nanos: config.model.frame_delay_nanos(),
            nano_target: 0,
            msgq,
        };
        c64.power_up();
        Ok(c64)
    }

    /// Swap the host clock (tests inject a manual one).
    pub fn set_clock(&mut self, clock: Box<dyn HostClock>) {
        self.clock = clock;
        self.restart_timer();
    }

    #[must_use]
    pub fn model(&self) -> C64Model {
        self.model
    }

    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[must_use]
    pub fn message_receiver(&self) -> Receiver<Message> {
        self.msgq.receiver()
    }

    #[must_use]
    pub fn message_queue(&self) -> MessageQueue {
        self.msgq.clone()
    }

    /// Cold start: apply the RAM pattern, then reset.
    pub fn power_up(&mut self) {
        self.bus.mem.apply_init_pattern();
        self.reset();
        self.msgq.put(Message::ReadyToRun);
    }

    /// Soft reset: RAM, disk and configuration survive; chip state and
    /// the CPU restart.
    pub fn reset(&mut self) {
        self.bus.cia1.reset();
        self.bus.cia2.reset();
        self.bus.sid.reset();
        self.bus.exp.reset();
        self.bus
            .mem
            .set_cartridge_lines(self.bus.exp.game_line(), self.bus.exp.exrom_line());
        self.bus.mem.update_peek_poke_tables();
        self.bus.vic.set_model(self.model);
        self.cpu.reset(&mut self.bus);
        self.drive.reset();
        self.cycle = 0;
        self.frame = 0;
        self.restart_timer();
    }

    /// Switch the chip revision (geometry, tables, frequencies).
    pub fn set_model(&mut self, model: C64Model) {
        self.model = model;
        self.cycle_duration_ps = model.cycle_duration_ps();
        self.frame_delay_nanos = model.frame_delay_nanos();
        self.bus.vic.set_model(model);
        self.restart_timer();
    }

    // --- Scheduler --------------------------------------------------------

    /// One machine cycle in the absolute half-cycle order. Returns
    /// `false` when the CPU hit a runtime trap.
    pub fn execute_one_cycle(&mut self) -> bool {
        self.cycle += 1;
        self.bus.cycle = self.cycle;

        // Phi2 low: VIC first, then the CIAs, then an IEC refresh.
        self.bus.tick_vic();
        if self.bus.vic.irq_line_active() {
            self.cpu.pull_down_irq(int_source::VIC);
        } else {
            self.cpu.release_irq(int_source::VIC);
        }

        if self.cycle >= self.bus.cia1.wake_up_cycle() {
            self.bus.cia1.tick();
        } else {
            self.bus.cia1.idle_counter += 1;
        }
        if self.bus.cia1.irq_line_active() {
            self.cpu.pull_down_irq(int_source::CIA);
        } else {
            self.cpu.release_irq(int_source::CIA);
        }

        if self.cycle >= self.bus.cia2.wake_up_cycle() {
            self.bus.cia2.tick();
        } else {
            self.bus.cia2.idle_counter += 1;
        }
        if self.bus.cia2.irq_line_active() {
            self.cpu.pull_down_nmi(int_source::CIA);
        } else {
            self.cpu.release_nmi(int_source::CIA);
        }

        if self.bus.iec.is_dirty_c64_side() {
            let out = self.bus.cia2.port_a_output();
            self.bus.iec.update_c64_side(out & 0x38);
            self.update_warp();
        }

        // Phi2 high: CPU (unless the VIC holds BA), then the drive,
        // then the tape.
        if !self.bus.vic.ba_low() {
            self.cpu.tick(&mut self.bus);
        }

        self.drive.execute(self.cycle_duration_ps, &mut self.bus.iec);

        self.bus.datasette.set_motor(self.bus.mem.tape_motor_on());
        self.bus.mem.set_tape_sense(self.bus.datasette.sense());
        if self.bus.datasette.execute() {
            self.bus.cia1.set_flag_line(false);
            self.bus.cia1.set_flag_line(true);
        }

        if self.bus.vic.advance() {
            self.end_of_frame();
        }

        !self.cpu.is_jammed()
    }

    /// Run to the end of the current frame. Returns `false` on a trap.
    pub fn execute_one_frame(&mut self) -> bool {
        let frame = self.frame;
        while self.frame == frame {
            if !self.execute_one_cycle() {
                return false;
            }
        }
        true
    }

    fn end_of_frame(&mut self) {
        self.frame += 1;

        // TOD pins tick at the power-line rate, approximated per frame.
        self.bus.cia1.tod_tick();
        self.bus.cia2.tod_tick();
        if self.bus.cia1.irq_line_active() {
            self.cpu.pull_down_irq(int_source::CIA);
        }
        if self.bus.cia2.irq_line_active() {
            self.cpu.pull_down_nmi(int_source::CIA);
        }

        // SID catches up to the machine cycle in one burst.
        self.bus.sid.execute_until(self.cycle);

        // Periodic housekeeping on the ports.
        self.bus.exp.execute_end_of_frame();
        self.bus.sync_cartridge_lines();
        self.bus.mouse.execute();
        if self.bus.mouse.port() != 0 {
            let (x, y) = (self.bus.mouse.pot_x(), self.bus.mouse.pot_y());
            self.bus.sid.set_pot_lines(x, y);
        }

        self.update_warp();
        if !self.warp {
            self.synchronize_timing();
        }
    }

    /// `warp = (warp_load && bus busy) || always_warp`.
    fn update_warp(&mut self) {
        let warp = (self.warp_load && self.bus.iec.is_busy()) || self.always_warp;
        if warp == self.warp {
            return;
        }
        self.warp = warp;
        self.bus.sid.set_warp(warp);
        self.msgq.put(if warp {
            Message::WarpOn
        } else {
            Message::WarpOff
        });
        if !warp {
            self.restart_timer();
        }
    }

    #[must_use]
    pub fn is_warping(&self) -> bool {
        self.warp
    }

    pub fn set_always_warp(&mut self, warp: bool) {
        self.always_warp = warp;
        self.msgq.put(if warp {
            Message::AlwaysWarpOn
        } else {
            Message::AlwaysWarpOff
        });
        self.update_warp();
    }

    pub fn set_warp_load(&mut self, warp_load: bool) {
        self.warp_load = warp_load;
        self.update_warp();
    }

    /// Sleep the remainder of the frame away. Drift beyond the
    /// thresholds restarts the timer instead of accumulating debt.
    fn synchronize_timing(&mut self) {
        let now = self.clock.now();
        if self.nano_target > now + MAX_JITTER_NANOS {
            log::debug!("frame timer too far ahead; restarting");
            self.restart_timer();
            return;
        }
        if now > self.nano_target + MAX_LAG_NANOS {
            log::debug!("frame timer lagging; dropping the debt");
            self.restart_timer();
            return;
        }
        self.nano_target += self.frame_delay_nanos;
        self.clock.sleep_until(self.nano_target);
    }

    fn restart_timer(&mut self) {
        // The next synchronize_timing() adds one frame delay on top.
        self.nano_target = self.clock.now();
    }

    // --- Debugger ---------------------------------------------------------

    /// Finish the current instruction, then stop at the next fetch.
    pub fn step(&mut self) {
        // Leave the fetch phase (start a new instruction) ...
        while self.cpu.in_fetch_phase() {
            if !self.execute_one_cycle() {
                return;
            }
        }
        // ... and run it to completion.
        while !self.cpu.in_fetch_phase() {
            if !self.execute_one_cycle() {
                return;
            }
        }
    }

    /// Like `step`, but a JSR is run to its return address via a soft
    /// breakpoint at PC+3.
    pub fn step_over(&mut self) {
        let pc = self.cpu.regs.pc;
        let opcode = self.bus.spy(pc);
        if opcode != 0x20 {
            self.step();
            return;
        }
        let breakpoint = pc.wrapping_add(3);
        self.cpu.breakpoint = Some(breakpoint);
        loop {
            self.step();
            if self.cpu.is_jammed() || self.cpu.regs.pc == breakpoint {
                break;
            }
        }
        self.cpu.breakpoint = None;
    }

    /// Run until the CPU sits in a fetch phase (used by `halt` so a
    /// cancelled machine never stops mid-instruction).
    pub fn finish_instruction(&mut self) {
        while !self.cpu.in_fetch_phase() && !self.cpu.is_jammed() {
            self.execute_one_cycle();
        }
    }

    // --- Media ------------------------------------------------------------

    /// Attach a parsed cartridge. The caller decides when to reset.
    pub fn attach_cartridge(&mut self, cartridge: crate::cartridge::Cartridge) {
        self.bus.exp.attach(cartridge);
        self.bus.sync_cartridge_lines();
        self.msgq.put(Message::Cartridge);
    }

    /// Detach; GAME/EXROM float high and the map is rebuilt.
    pub fn detach_cartridge(&mut self) {
        self.bus.exp.detach();
        self.bus.sync_cartridge_lines();
        self.msgq.put(Message::NoCartridge);
    }

    /// Press the cartridge freeze button.
    pub fn press_freeze_button(&mut self) {
        if self.bus.exp.press_freeze_button() {
            self.cpu.pull_down_nmi(int_source::EXPANSION);
        }
        self.bus.sync_cartridge_lines();
    }

    pub fn release_freeze_button(&mut self) {
        self.cpu.release_nmi(int_source::EXPANSION);
    }

    pub fn insert_disk(&mut self, d64: &D64) {
        self.drive.insert_d64(d64);
    }

    pub fn flash_prg(&mut self, prg: &Prg) {
        prg.flash(&mut self.bus.mem);
    }

    // --- Input ------------------------------------------------------------

    pub fn press_key(&mut self, row: u8, col: u8) {
        self.bus.keyboard.set_key(row, col, true);
    }

    pub fn release_key(&mut self, row: u8, col: u8) {
        self.bus.keyboard.set_key(row, col, false);
    }

    pub fn release_all_keys(&mut self) {
        self.bus.keyboard.release_all();
    }

    /// RESTORE is wired straight to the NMI line.
    pub fn press_restore_key(&mut self) {
        self.cpu.pull_down_nmi(int_source::KEYBOARD);
    }

    pub fn release_restore_key(&mut self) {
        self.cpu.release_nmi(int_source::KEYBOARD);
    }

    /// Joystick lines, active low (bit 0 up, 1 down, 2 left, 3 right,
    /// 4 fire).
    pub fn set_joystick(&mut self, port: u8, lines: u8) {
        match port {
            1 => self.bus.joystick1 = lines,
            2 => self.bus.joystick2 = lines,
            _ => {}
        }
    }

    pub fn trigger_light_pen(&mut self, x: u16, y: u16) {
        self.bus.vic.trigger_light_pen(x, y);
    }

    // --- Snapshot ---------------------------------------------------------

    /// Serialize the whole machine in fixed traversal order.
    #[must_use]
    pub fn save_snapshot(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(SNAPSHOT_MAGIC);
        w.u8(SNAPSHOT_VERSION);
        w.u8(self.model.tag());
        w.u64(self.clock.now());

        w.u64(self.cycle);
        w.u64(self.frame);
        w.bool(self.warp);
        w.bool(self.warp_load);
        w.bool(self.always_warp);

        self.cpu.serialize(&mut w);
        self.bus.mem.serialize(&mut w);
        self.bus.cia1.serialize(&mut w);
        self.bus.cia2.serialize(&mut w);
        self.bus.vic.serialize(&mut w);
        self.bus.sid.serialize(&mut w);
        self.bus.exp.serialize(&mut w);
        self.bus.iec.serialize(&mut w);
        self.drive.serialize(&mut w);
        self.bus.datasette.serialize(&mut w);
        self.bus.mouse.serialize(&mut w);
        let rows = self.bus.keyboard.rows();
        w.bytes(&rows);
        w.u8(self.bus.joystick1);
        w.u8(self.bus.joystick2);
        w.into_bytes()
    }

    /// Restore a snapshot. A header mismatch (magic, version, model)
    /// refuses the load outright; a decode failure mid-way rolls the
    /// machine back to its previous state.
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let mut r = Reader::new(bytes);
        let mut magic = [0u8; 4];
        r.bytes(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(Error::Snapshot("bad magic".into()));
        }
        let version = r.u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "version {version}, expected {SNAPSHOT_VERSION}"
            )));
        }
        let model = C64Model::from_tag(r.u8()?)?;
        if model != self.model {
            return Err(Error::Snapshot(format!(
                "snapshot model {model:?} does not match machine {:?}",
                self.model
            )));
        }
        let _timestamp = r.u64()?;

        let backup = self.save_snapshot();
        match self.load_snapshot_body(&mut r) {
            Ok(()) => {
                self.restart_timer();
                self.msgq.put(Message::SnapshotTaken);
                Ok(())
            }
            Err(err) => {
                // Roll back; the backup was produced by us and decodes.
                let mut back = Reader::new(&backup);
                let mut skip = [0u8; 14]; // magic, version, model, timestamp
                back.bytes(&mut skip).expect("backup header");
                self.load_snapshot_body(&mut back)
                    .expect("backup snapshot restores");
                Err(err)
            }
        }
    }

    fn load_snapshot_body(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.cycle = r.u64()?;
        self.frame = r.u64()?;
        self.warp = r.bool()?;
        self.warp_load = r.bool()?;
        self.always_warp = r.bool()?;
        self.bus.cycle = self.cycle;

        self.cpu.deserialize(r)?;
        self.bus.mem.deserialize(r)?;
        self.bus.cia1.deserialize(r)?;
        self.bus.cia2.deserialize(r)?;
        self.bus.vic.deserialize(r)?;
        self.bus.sid.deserialize(r)?;
        self.bus.exp.deserialize(r)?;
        self.bus.iec.deserialize(r)?;
        self.drive.deserialize(r)?;
        self.bus.datasette.deserialize(r)?;
        self.bus.mouse.deserialize(r)?;
        let mut rows = [0u8; 8];
        r.bytes(&mut rows)?;
        self.bus.keyboard.set_rows(rows);
        self.bus.joystick1 = r.u8()?;
        self.bus.joystick2 = r.u8()?;
        Ok(())
    }

    // --- Inspection ---------------------------------------------------------

    /// Bus read with full side effects (debugger "poke carefully").
    pub fn peek(&mut self, addr: u16) -> u8 {
        self.bus.read(addr)
    }

    /// Bus write with full side effects.
    pub fn poke(&mut self, addr: u16, value: u8) {
        self.bus.write(addr, value);
    }

    /// Side-effect-free read.
    #[must_use]
    pub fn spy(&self, addr: u16) -> u8 {
        self.bus.spy(addr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RomSet;

    /// A ROM set whose kernal parks the CPU in a tight loop at $E000.
    pub fn test_config() -> C64Config {
        let mut kernal = vec![0xEA; 8192];
        // Reset vector -> $E000, IRQ/NMI vector -> RTI at $E100.
        kernal[0x1FFC] = 0x00;
        kernal[0x1FFD] = 0xE0;
        kernal[0x1FFA] = 0x00;
        kernal[0x1FFB] = 0xE1;
        kernal[0x1FFE] = 0x00;
        kernal[0x1FFF] = 0xE1;
        kernal[0x0100] = 0x40; // RTI
        let roms = RomSet::new(
            vec![0; 8192],
            vec![0; 4096],
            kernal,
            {
                let mut rom = vec![0xEA; 16384];
                rom[0x3FFC] = 0x00;
                rom[0x3FFD] = 0xC0;
                rom
            },
        )
        .unwrap();
        let mut config = C64Config::new(C64Model::Pal6569R3, roms);
        config.warp_load = false;
        config
    }

    fn make_c64() -> C64 {
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(ManualClock::new()));
        c64
    }

    #[test]
    fn cycle_counter_advances_once_per_cycle() {
        let mut c64 = make_c64();
        for n in 1..=1000u64 {
            assert!(c64.execute_one_cycle());
            assert_eq!(c64.cycle(), n);
        }
    }

    #[test]
    fn frame_advances_after_rasterlines() {
        let mut c64 = make_c64();
        assert!(c64.execute_one_frame());
        assert_eq!(c64.frame(), 1);
        assert_eq!(c64.cycle(), 312 * 63);
    }

    #[test]
    fn cpu_starts_at_kernal_reset_vector() {
        let c64 = make_c64();
        assert_eq!(c64.cpu.regs.pc, 0xE000);
    }

    #[test]
    fn port_write_rebuilds_map_before_next_access() {
        let mut c64 = make_c64();
        c64.poke(0x0001, 0x35); // hiram off
        c64.bus.mem.ram_write(0xE123, 0x42);
        assert_eq!(c64.peek(0xE123), 0x42);
        c64.poke(0x0001, 0x37);
        assert_eq!(c64.peek(0xE123), 0xEA); // kernal again
    }

    #[test]
    fn cia1_timer_interrupt_reaches_cpu() {
        let mut c64 = make_c64();
        c64.poke(0xDC0D, 0x81); // enable timer A interrupt
        c64.poke(0xDC04, 0x10);
        c64.poke(0xDC05, 0x00);
        c64.poke(0xDC0E, 0x01); // start
        let mut saw_irq = false;
        for _ in 0..100 {
            c64.execute_one_cycle();
            if c64.cpu.irq_line() & int_source::CIA != 0 {
                saw_irq = true;
            }
        }
        assert!(saw_irq);
        // Acknowledging clears the line.
        let icr = c64.peek(0xDC0D);
        assert_eq!(icr & 0x81, 0x81);
        c64.execute_one_cycle();
        assert_eq!(c64.cpu.irq_line() & int_source::CIA, 0);
    }

    #[test]
    fn vic_bank_follows_cia2() {
        let mut c64 = make_c64();
        c64.poke(0xDD02, 0x03);
        c64.poke(0xDD00, 0x01); // %01 -> inverted bank 2
        assert_eq!(c64.bus.vic.bank(), 2);
    }

    #[test]
    fn cia2_write_marks_iec_dirty_and_low_phase_applies_it() {
        let mut c64 = make_c64();
        c64.poke(0xDD02, 0x38); // ATN/CLK/DATA as outputs
        c64.poke(0xDD00, 0x08); // assert ATN
        assert!(c64.bus.iec.is_dirty_c64_side());
        c64.execute_one_cycle();
        assert!(!c64.bus.iec.is_dirty_c64_side());
        assert!(!c64.bus.iec.atn());
        assert!(c64.bus.iec.is_busy());
    }

    #[test]
    fn warp_load_follows_bus_activity() {
        let mut c64 = make_c64();
        c64.set_warp_load(true);
        assert!(!c64.is_warping());
        c64.poke(0xDD02, 0x38);
        c64.poke(0xDD00, 0x08); // bus goes busy
        c64.execute_one_cycle();
        assert!(c64.is_warping());
        c64.poke(0xDD00, 0x00);
        c64.execute_one_cycle();
        assert!(!c64.is_warping());
    }

    #[test]
    fn warp_messages_posted() {
        let mut c64 = make_c64();
        let rx = c64.message_receiver();
        c64.set_always_warp(true);
        c64.set_always_warp(false);
        let messages: Vec<_> = rx.try_iter().collect();
        assert!(messages.contains(&Message::AlwaysWarpOn));
        assert!(messages.contains(&Message::WarpOn));
        assert!(messages.contains(&Message::WarpOff));
    }

    #[test]
    fn keyboard_reaches_cia1_port_b() {
        let mut c64 = make_c64();
        c64.poke(0xDC02, 0xFF); // PA all output
        c64.poke(0xDC03, 0x00); // PB all input
        c64.press_key(1, 2);
        c64.poke(0xDC00, !0x02); // select row 1
        assert_eq!(c64.peek(0xDC01) & 0x04, 0); // column 2 low
        c64.release_all_keys();
        assert_eq!(c64.peek(0xDC01) & 0x04, 0x04);
    }

    #[test]
    fn joystick_masks_port_lines() {
        let mut c64 = make_c64();
        c64.poke(0xDC03, 0x00);
        c64.set_joystick(1, !0x10); // fire pressed
        assert_eq!(c64.peek(0xDC01) & 0x10, 0);
    }

    #[test]
    fn jam_reports_trap() {
        let mut c64 = make_c64();
        c64.bus.mem.ram_write(0x2000, 0x02); // JAM
        c64.cpu.regs.pc = 0x2000;
        c64.poke(0x0001, 0x34); // all RAM so the fetch hits our byte
        let mut ok = true;
        for _ in 0..10 {
            ok = c64.execute_one_cycle();
        }
        assert!(!ok);
        assert!(c64.cpu.is_jammed());
    }

    #[test]
    fn step_runs_one_instruction() {
        let mut c64 = make_c64();
        let pc = c64.cpu.regs.pc;
        c64.step();
        assert!(c64.cpu.in_fetch_phase());
        assert_eq!(c64.cpu.regs.pc, pc.wrapping_add(1)); // NOP sled
    }

    #[test]
    fn step_over_jsr_uses_soft_breakpoint() {
        let mut c64 = make_c64();
        // JSR $3000 / NOP at $2000; subroutine: RTS.
        for (i, b) in [0x20, 0x00, 0x30, 0xEA].iter().enumerate() {
            c64.bus.mem.ram_write(0x2000 + i as u16, *b);
        }
        c64.bus.mem.ram_write(0x3000, 0x60);
        c64.poke(0x0001, 0x34);
        c64.cpu.regs.pc = 0x2000;
        c64.step_over();
        assert_eq!(c64.cpu.regs.pc, 0x2003);
    }

    #[test]
    fn finish_instruction_lands_in_fetch_phase() {
        let mut c64 = make_c64();
        c64.execute_one_cycle(); // mid-instruction somewhere
        c64.finish_instruction();
        assert!(c64.cpu.in_fetch_phase());
    }

    #[test]
    fn frame_pacing_with_manual_clock() {
        let clock = ManualClock::new();
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(clock.clone()));
        let before = clock.now();
        assert!(c64.execute_one_frame());
        // The sleep advanced the fake clock to the frame target.
        assert!(clock.now() > before);
        let delta = clock.now() - before;
        assert!(
            (19_000_000..21_000_000).contains(&delta),
            "frame slept {delta} ns"
        );
    }

    #[test]
    fn lag_restarts_timer_instead_of_sleeping_debt() {
        let clock = ManualClock::new();
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(clock.clone()));
        c64.execute_one_frame();
        // Simulate a long host stall.
        clock.advance(5_000_000_000);
        let stalled_at = clock.now();
        c64.execute_one_frame();
        // The timer restarted: only ~one frame was slept after the jump.
        assert!(clock.now() - stalled_at < 50_000_000);
    }

    #[test]
    fn warp_skips_frame_pacing() {
        let clock = ManualClock::new();
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(clock.clone()));
        c64.set_always_warp(true);
        let before = clock.now();
        for _ in 0..10 {
            c64.execute_one_frame();
        }
        assert_eq!(clock.now(), before); // never slept
    }

    #[test]
    fn snapshot_roundtrip_is_byte_identical() {
        let mut c64 = make_c64();
        for _ in 0..3 {
            c64.execute_one_frame();
        }
        let snap = c64.save_snapshot();
        for _ in 0..5 {
            c64.execute_one_frame();
        }
        c64.load_snapshot(&snap).unwrap();
        let again = c64.save_snapshot();
        // Everything except the header timestamp must match.
        assert_eq!(snap[14..], again[14..]);
    }

    #[test]
    fn snapshot_restores_execution_exactly() {
        let mut c64 = make_c64();
        for _ in 0..2 {
            c64.execute_one_frame();
        }
        let snap = c64.save_snapshot();
        c64.execute_one_frame();
        let reference = c64.bus.vic.visible_buffer().to_vec();
        let cycle_after = c64.cycle();

        for _ in 0..10 {
            c64.execute_one_frame();
        }
        c64.load_snapshot(&snap).unwrap();
        c64.execute_one_frame();
        assert_eq!(c64.cycle(), cycle_after);
        assert_eq!(c64.bus.vic.visible_buffer(), &reference[..]);
    }

    #[test]
    fn snapshot_header_mismatch_keeps_state() {
        let mut c64 = make_c64();
        c64.execute_one_frame();
        let cycle = c64.cycle();

        let mut bad = c64.save_snapshot();
        bad[0] = b'X';
        assert!(c64.load_snapshot(&bad).is_err());

        let mut wrong_version = c64.save_snapshot();
        wrong_version[4] = 99;
        assert!(c64.load_snapshot(&wrong_version).is_err());

        let mut wrong_model = c64.save_snapshot();
        wrong_model[5] = C64Model::Ntsc6567.tag();
        assert!(c64.load_snapshot(&wrong_model).is_err());

        let mut truncated = c64.save_snapshot();
        truncated.truncate(truncated.len() / 2);
        assert!(c64.load_snapshot(&truncated).is_err());

        assert_eq!(c64.cycle(), cycle); // untouched through all of it
    }

    #[test]
    fn ram_survives_reset_but_not_power_up() {
        let mut c64 = make_c64();
        c64.bus.mem.ram_write(0x4321, 0x99);
        c64.reset();
        assert_eq!(c64.bus.mem.ram_read(0x4321), 0x99);
        c64.power_up();
        // Back to the init pattern.
        assert_ne!(c64.bus.mem.ram_read(0x4321), 0x99);
    }

    #[test]
    fn datasette_pulse_hits_cia1_flag() {
        let mut c64 = make_c64();
        c64.bus.datasette.insert_tape(vec![5, 5, 5]);
        c64.bus.datasette.press_play();
        // Motor on: clear port bit 5 (output, active low).
        c64.poke(0x0000, 0x3F);
        c64.poke(0x0001, 0x17);
        for _ in 0..8 {
            c64.execute_one_cycle();
        }
        assert_ne!(c64.peek(0xDC0D) & 0x10, 0); // FLAG latched
    }
}
