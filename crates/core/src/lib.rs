//! Cycle-accurate ATmega32u4 emulator core.
//!
//! The crate models the AVR CPU, the on-chip peripherals, the SSD1306
//! display controller, and the external W25Q128 SPI flash. Everything
//! hangs off [`Machine`]; a frontend loads a program, calls
//! [`Machine::run`] or [`Machine::step`], and reads pixels, audio
//! samples, and serial bytes back out.
//!
//! ## Execution model
//!
//! The program is decoded up front into a flat instruction table
//! ([`opcodes::decode_program`]) and a second table with common
//! sequences batched ([`merge::merge_program`]). The engine is a small
//! state machine (running / waking / sleeping) driven by a
//! [`sched::Scheduler`] of pending peripheral deadlines: peripherals
//! never tick per instruction, they compute their next interesting
//! cycle and are called back when it arrives. Interrupts are likewise
//! only checked on a scheduled event, armed by flag-raising peripherals
//! and by I-bit 0-to-1 edges, which keeps the hot loop free of
//! per-instruction polling.
//!
//! ## Fault handling
//!
//! Suspicious program behavior (unknown opcodes, a program counter past
//! the end of flash, stack overflow, SPI write collisions) can pause
//! the machine with a [`BreakReason`]. Each class is independently
//! armed via [`Autobreak`]; a disarmed fault falls back to what the
//! silicon would do and execution continues.

pub mod disasm;
pub mod display;
pub mod exec;
pub mod memory;
pub mod merge;
pub mod opcodes;
pub mod peripherals;
pub mod savestate;
pub mod sched;

use serde::{Deserialize, Serialize};

use crate::display::Display;
use crate::memory::Memory;
use crate::opcodes::{decode_program, DecodedInstruction};
use crate::peripherals::{
    Adc, EepromCtrl, EventTag, FxFlash, Pll, Sound, Spi, Timer16, Timer16Addrs, Timer4, Timer8,
    Usb, Watchdog,
};
use crate::sched::Scheduler;

pub use crate::memory::{SPH, SPL, SREG};

/// Data space size: 32 registers + 224 I/O + 2560 bytes of SRAM.
pub const DATA_SIZE: usize = 0xb00;
/// Program flash size in bytes.
pub const FLASH_SIZE: usize = 0x8000;
/// EEPROM size in bytes.
pub const EEPROM_SIZE: usize = 0x400;
/// Last data-space address; initial stack pointer.
pub const RAMEND: u16 = 0x0aff;

/// CPU clock in Hz.
pub const CLOCK_HZ: u64 = 16_000_000;
/// Picoseconds per CPU cycle at 16 MHz.
pub const CYCLE_PS: u64 = 62_500;

// SREG flag masks
pub const SREG_C: u8 = 0x01;
pub const SREG_Z: u8 = 0x02;
pub const SREG_N: u8 = 0x04;
pub const SREG_V: u8 = 0x08;
pub const SREG_S: u8 = 0x10;
pub const SREG_H: u8 = 0x20;
pub const SREG_T: u8 = 0x40;
pub const SREG_I: u8 = 0x80;

/// Cycles charged for an interrupt entry; doubled when the CPU has to
/// wake from sleep first.
pub const WAKE_CYCLES: u32 = 4;

/// Upper bound on how far a sleeping CPU may jump in one go when no
/// peripheral deadline is pending (6.25 ms), so an idle machine still
/// returns to the caller at a reasonable rate.
pub const SLEEP_SKIP_MAX: u64 = 100_000;

const SPDR: u16 = 0x4e;
const DDRD: u16 = 0x2a;
const PORTD: u16 = 0x2b;

/// Why the machine paused itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakReason {
    /// Fetched an opcode the decoder does not recognize (or jumped into
    /// the second word of a two-word instruction).
    UnknownInstruction,
    /// Program counter past the end of flash.
    OutOfBoundsProgramCounter,
    /// Stack pointer dropped below [`Machine::stack_limit`].
    StackOverflow,
    /// SPDR written while a transfer was still shifting.
    SpiWriteCollision,
    /// A user breakpoint.
    Breakpoint,
}

/// Which fault classes pause the machine. A disarmed class falls back
/// to continuing the way the hardware would.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Autobreak {
    pub unknown_instruction: bool,
    pub out_of_bounds_pc: bool,
    pub stack_overflow: bool,
    pub spi_write_collision: bool,
}

impl Default for Autobreak {
    fn default() -> Self {
        Autobreak {
            unknown_instruction: true,
            out_of_bounds_pc: true,
            stack_overflow: true,
            // real sketches shrug this off, so default quiet
            spi_write_collision: false,
        }
    }
}

/// Arduboy buttons and their port pins (all active low).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
}

/// The whole emulated system.
pub struct Machine {
    pub mem: Memory,
    /// Program counter in words.
    pub pc: u16,
    /// Cycles elapsed since reset.
    pub cycle: u64,
    /// False while sleeping or waking.
    pub active: bool,
    /// Remaining interrupt-entry cycles; while nonzero the CPU is waking.
    pub wakeup_cycles: u32,
    /// True when stopped on a breakpoint, BREAK, or an armed fault.
    pub paused: bool,
    pub break_reason: Option<BreakReason>,
    pub autobreak: Autobreak,

    /// One decoded record per flash word.
    pub decoded: Vec<DecodedInstruction>,
    /// Same table with mergeable runs batched.
    pub merged: Vec<DecodedInstruction>,
    breakpoints: Vec<u32>,
    skip_breakpoint: bool,

    sched: Scheduler,
    pub timer0: Timer8,
    pub timer1: Timer16,
    pub timer3: Timer16,
    pub timer4: Timer4,
    pub spi: Spi,
    pub eeprom_ctrl: EepromCtrl,
    pub adc: Adc,
    pub pll: Pll,
    pub watchdog: Watchdog,
    pub usb: Usb,
    pub sound: Sound,
    pub display: Display,
    pub fx_flash: FxFlash,

    // external pin state (buttons); merged into PINx reads
    pub pin_b: u8,
    pub pin_c: u8,
    pub pin_d: u8,
    pub pin_e: u8,
    pub pin_f: u8,

    /// Pausing threshold for the stack guard.
    pub stack_limit: u16,
    /// Lowest stack pointer seen since reset.
    pub min_stack: u16,
    /// Completed display frames since reset.
    pub frame_count: u64,
    pub dbg_irq_count: u64,

    /// Set by any I/O-space access during the current instruction;
    /// merged runs abort on it and the fast loop falls back to the
    /// event dispatcher.
    io_touched: bool,
    /// SREG as of the previous instruction, for I-bit edge detection.
    prev_sreg: u8,
    /// Cycle up to which the display, FX flash, and sampler have been
    /// advanced.
    device_sync_cycle: u64,
}

impl Machine {
    pub fn new() -> Self {
        let mut m = Machine {
            mem: Memory::new(),
            pc: 0,
            cycle: 0,
            active: true,
            wakeup_cycles: 0,
            paused: false,
            break_reason: None,
            autobreak: Autobreak::default(),
            decoded: Vec::new(),
            merged: Vec::new(),
            breakpoints: vec![0u32; FLASH_SIZE / 2 / 32],
            skip_breakpoint: false,
            sched: Scheduler::new(),
            timer0: Timer8::new(),
            timer1: Timer16::new(Timer16Addrs::timer1()),
            timer3: Timer16::new(Timer16Addrs::timer3()),
            timer4: Timer4::new(),
            spi: Spi::new(),
            eeprom_ctrl: EepromCtrl::new(),
            adc: Adc::new(),
            pll: Pll::new(),
            watchdog: Watchdog::new(),
            usb: Usb::new(),
            sound: Sound::new(),
            display: Display::new(),
            fx_flash: FxFlash::new(),
            pin_b: 0xff,
            pin_c: 0xff,
            pin_d: 0xff,
            pin_e: 0xff,
            pin_f: 0xff,
            stack_limit: 0x100,
            min_stack: RAMEND,
            frame_count: 0,
            dbg_irq_count: 0,
            io_touched: false,
            prev_sreg: 0,
            device_sync_cycle: 0,
        };
        m.redecode();
        m.reset();
        m
    }

    /// Reset the system: clears data space and peripherals, keeps the
    /// program, FX flash contents, EEPROM, breakpoints, and fault
    /// configuration.
    pub fn reset(&mut self) {
        self.mem.data.iter_mut().for_each(|b| *b = 0);
        self.mem.set_sp(RAMEND);
        self.pc = 0;
        self.cycle = 0;
        self.active = true;
        self.wakeup_cycles = 0;
        self.paused = false;
        self.break_reason = None;
        self.skip_breakpoint = false;
        self.io_touched = false;
        self.prev_sreg = 0;
        self.device_sync_cycle = 0;
        self.min_stack = RAMEND;
        self.frame_count = 0;
        self.dbg_irq_count = 0;
        self.sched.clear();
        self.timer0.reset();
        self.timer1.reset();
        self.timer3.reset();
        self.timer4.reset();
        self.spi.reset();
        self.eeprom_ctrl.reset();
        self.adc.reset();
        self.pll.reset();
        self.watchdog.reset();
        self.sound.reset();
        self.display.reset();
        self.fx_flash.reset();
        self.usb.reset(&mut self.mem.data);
    }

    fn redecode(&mut self) {
        self.decoded = decode_program(&self.mem.flash, FLASH_SIZE / 2);
        self.merged = merge::merge_program(&self.decoded);
    }

    /// Load a raw program image into flash and reset.
    pub fn load_program(&mut self, bin: &[u8]) {
        self.mem.flash.iter_mut().for_each(|b| *b = 0);
        let n = bin.len().min(FLASH_SIZE);
        self.mem.flash[..n].copy_from_slice(&bin[..n]);
        self.redecode();
        self.reset();
    }

    /// Load an image into the external FX flash chip.
    pub fn load_flash_image(&mut self, bin: &[u8]) {
        self.fx_flash.load_data(bin);
    }

    pub fn load_eeprom(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(EEPROM_SIZE);
        self.mem.eeprom[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.mem.eeprom
    }

    /// Grayscale output frame, one byte per pixel.
    pub fn pixels(&self) -> &[u8] {
        if self.display.enable_filter {
            &self.display.filtered_pixels
        } else {
            self.display.current_frame()
        }
    }

    /// Serial bytes the firmware pushed out over USB CDC since the
    /// last call.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.usb.serial_bytes)
    }

    /// Audio samples produced since the last call.
    pub fn drain_audio(&mut self) -> Vec<i16> {
        self.sound.drain_samples()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        let (pin, mask) = match button {
            Button::Up => (&mut self.pin_f, 0x80),
            Button::Right => (&mut self.pin_f, 0x40),
            Button::Left => (&mut self.pin_f, 0x20),
            Button::Down => (&mut self.pin_f, 0x10),
            Button::A => (&mut self.pin_e, 0x40),
            Button::B => (&mut self.pin_b, 0x10),
        };
        if pressed {
            *pin &= !mask;
        } else {
            *pin |= mask;
        }
    }

    // --- Breakpoints ---

    pub fn set_breakpoint(&mut self, word_addr: u16, enabled: bool) {
        let i = word_addr as usize;
        if i >= FLASH_SIZE / 2 {
            return;
        }
        if enabled {
            self.breakpoints[i >> 5] |= 1 << (i & 31);
        } else {
            self.breakpoints[i >> 5] &= !(1 << (i & 31));
        }
    }

    fn any_breakpoint(&self) -> bool {
        self.breakpoints.iter().any(|&w| w != 0)
    }

    pub fn has_breakpoint(&self, word_addr: u16) -> bool {
        let i = word_addr as usize;
        i < FLASH_SIZE / 2 && self.breakpoints[i >> 5] & (1 << (i & 31)) != 0
    }

    /// Continue after a pause. The breakpoint at the current program
    /// counter, if any, is skipped once.
    pub fn resume(&mut self) {
        self.paused = false;
        self.break_reason = None;
        self.skip_breakpoint = true;
    }

    // --- Engine ---

    /// Execute one instruction (or one sleep skip) and return its cycle
    /// cost. Single-stepping always runs the unmerged table so it stops
    /// after every original instruction.
    pub fn step(&mut self) -> u32 {
        if self.paused {
            return 0;
        }
        self.run_due_events();
        self.sync_devices();
        if self.paused {
            return 0;
        }
        if !self.active {
            if self.wakeup_cycles > 0 {
                self.cycle += 1;
                self.wakeup_cycles -= 1;
                if self.wakeup_cycles == 0 {
                    self.active = true;
                }
                return 1;
            }
            // asleep: jump straight to the next deadline
            let target = self.sched.next_cycle().min(self.cycle + SLEEP_SKIP_MAX);
            let skipped = (target - self.cycle) as u32;
            self.cycle = target;
            self.run_due_events();
            return skipped;
        }
        let mut pc = self.pc as usize;
        if pc >= self.decoded.len() {
            self.autobreak(BreakReason::OutOfBoundsProgramCounter);
            if self.paused {
                return 0;
            }
            pc %= self.decoded.len();
            self.pc = pc as u16;
        }
        if self.breakpoint_hit() {
            return 0;
        }
        self.io_touched = false;
        let i = self.decoded[pc];
        let n = exec::exec_one(self, i);
        self.skip_breakpoint = false;
        self.cycle += n as u64;
        self.check_i_bit_edge();
        n
    }

    /// Run for up to `cycles` cycles; returns the number actually
    /// elapsed. Stops early if the machine pauses.
    pub fn run(&mut self, cycles: u64) -> u64 {
        let start = self.cycle;
        let end = start + cycles;
        // any breakpoint disables the fused table: a breakpoint landing
        // on the 2nd..Nth slot of a fused run must still pause there
        let use_merged = !self.any_breakpoint();
        while self.cycle < end && !self.paused {
            self.run_due_events();
            if self.paused {
                break;
            }
            self.sync_devices();
            if !self.active {
                if self.wakeup_cycles > 0 {
                    let due = self.sched.next_cycle();
                    let n = (self.wakeup_cycles as u64)
                        .min(end - self.cycle)
                        .min(due.saturating_sub(self.cycle).max(1));
                    self.cycle += n;
                    self.wakeup_cycles -= n as u32;
                    if self.wakeup_cycles == 0 {
                        self.active = true;
                    }
                } else {
                    self.cycle = self
                        .sched
                        .next_cycle()
                        .min(end)
                        .min(self.cycle + SLEEP_SKIP_MAX);
                }
                continue;
            }
            // fast path over the merged table, up to the next deadline
            let limit = self.sched.next_cycle().min(end);
            while self.cycle < limit && self.active && !self.paused {
                let mut pc = self.pc as usize;
                if pc >= self.merged.len() {
                    self.autobreak(BreakReason::OutOfBoundsProgramCounter);
                    if self.paused {
                        break;
                    }
                    pc %= self.merged.len();
                    self.pc = pc as u16;
                }
                if self.breakpoint_hit() {
                    break;
                }
                self.io_touched = false;
                let i = if use_merged {
                    self.merged[pc]
                } else {
                    self.decoded[pc]
                };
                let n = exec::exec_one(self, i);
                self.skip_breakpoint = false;
                self.cycle += n as u64;
                self.check_i_bit_edge();
                if self.io_touched || self.sched.next_cycle() <= self.cycle {
                    break;
                }
            }
        }
        self.sync_devices();
        self.cycle - start
    }

    fn breakpoint_hit(&mut self) -> bool {
        if !self.has_breakpoint(self.pc) {
            return false;
        }
        if self.skip_breakpoint {
            return false;
        }
        self.paused = true;
        self.break_reason = Some(BreakReason::Breakpoint);
        true
    }

    fn check_i_bit_edge(&mut self) {
        let sreg = self.mem.sreg();
        if sreg & SREG_I != 0 && self.prev_sreg & SREG_I == 0 {
            self.sched.schedule(self.cycle, EventTag::Interrupt);
        }
        self.prev_sreg = sreg;
    }

    fn run_due_events(&mut self) {
        while let Some((due, tag)) = self.sched.next() {
            if due > self.cycle {
                break;
            }
            self.sched.pop();
            self.dispatch_event(tag);
        }
    }

    fn dispatch_event(&mut self, tag: EventTag) {
        let cycle = self.cycle;
        match tag {
            EventTag::Timer0 => self.timer0.update(cycle, &mut self.mem.data, &mut self.sched),
            EventTag::Timer1 => self.timer1.update(cycle, &mut self.mem.data, &mut self.sched),
            EventTag::Timer3 => {
                // sample the speaker level before OC3A can toggle
                self.sound.update(cycle, &self.mem.data);
                self.timer3.update(cycle, &mut self.mem.data, &mut self.sched);
            }
            EventTag::Timer4 => {
                self.sound.update(cycle, &self.mem.data);
                self.timer4.update(cycle, &mut self.mem.data, &mut self.sched);
            }
            EventTag::Spi => {
                self.spi.update(cycle, &mut self.sched);
                self.route_spi_byte();
            }
            EventTag::Eeprom => self.eeprom_ctrl.update(cycle, &mut self.sched),
            EventTag::Adc => self.adc.update(cycle, &mut self.mem.data, &mut self.sched),
            EventTag::Pll => {
                self.pll.update(cycle, &mut self.mem.data, &mut self.sched);
                self.timer4
                    .set_rate(self.pll.num12, cycle, &mut self.mem.data, &mut self.sched);
            }
            EventTag::Watchdog => {
                self.watchdog.update(cycle, &mut self.mem.data, &mut self.sched);
                if self.watchdog.reset_request {
                    self.watchdog.reset_request = false;
                    self.reset();
                }
            }
            EventTag::Usb => self.usb.update(cycle, &mut self.mem.data, &mut self.sched),
            EventTag::Interrupt => self.check_interrupts(),
        }
    }

    /// Deliver the highest-priority enabled pending interrupt, if any.
    /// Runs only on the interrupt-check event.
    fn check_interrupts(&mut self) {
        if self.mem.sreg() & SREG_I == 0 {
            return;
        }
        if let Some(vector) = self.pending_vector() {
            let ret = self.pc;
            self.push_word(ret);
            let s = self.mem.sreg();
            self.mem.set_sreg(s & !SREG_I);
            self.prev_sreg = self.mem.sreg();
            self.pc = vector;
            // entry latency; doubled when waking from sleep
            self.wakeup_cycles = if self.active {
                WAKE_CYCLES
            } else {
                2 * WAKE_CYCLES
            };
            self.active = false;
            self.dbg_irq_count += 1;
        }
    }

    /// Vector priority follows the vector table order.
    fn pending_vector(&mut self) -> Option<u16> {
        if let Some(v) = self.usb.check_interrupt_general(&mut self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.usb.check_interrupt_endpoint(&self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.watchdog.check_interrupt(&mut self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.timer1.check_interrupt(&mut self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.timer0.check_interrupt(&mut self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.spi.check_interrupt() {
            return Some(v);
        }
        if let Some(v) = self.adc.check_interrupt(&mut self.mem.data) {
            return Some(v);
        }
        if let Some(v) = self.timer3.check_interrupt(&mut self.mem.data) {
            return Some(v);
        }
        self.timer4.check_interrupt(&mut self.mem.data)
    }

    /// Bring the display, FX flash, and audio sampler up to the current
    /// cycle. Called between instruction batches, not per instruction.
    fn sync_devices(&mut self) {
        let elapsed = self.cycle - self.device_sync_cycle;
        if elapsed == 0 {
            return;
        }
        self.device_sync_cycle = self.cycle;
        let ps = elapsed * CYCLE_PS;
        if self.display.advance(ps) {
            self.frame_count += 1;
        }
        self.fx_flash.advance(ps);
        self.sound.update(self.cycle, &self.mem.data);
    }

    /// A completed SPI transfer lands here: route the MOSI byte to
    /// whichever slave is selected and latch its response into SPDR.
    fn route_spi_byte(&mut self) {
        let byte = match self.spi.take_done() {
            Some(b) => b,
            None => return,
        };
        let ddrd = self.mem.data[DDRD as usize];
        let portd = self.mem.data[PORTD as usize];
        let mut miso = 0xff;
        // FX flash: chip select on PD1, active low
        if ddrd & 0x02 != 0 && portd & 0x02 == 0 {
            miso = self.fx_flash.transfer(byte);
        }
        // display: chip select on PD6, data/command on PD4
        if ddrd & 0x40 != 0 && portd & 0x40 == 0 {
            if portd & 0x10 != 0 {
                self.display.send_data(byte);
            } else {
                self.display.send_command(byte);
            }
        }
        self.mem.data[SPDR as usize] = miso;
    }

    // --- Data space access ---

    fn pin_input(&self, pin_addr: u16, external: u8) -> u8 {
        let ddr = self.mem.data[(pin_addr + 1) as usize];
        let port = self.mem.data[(pin_addr + 2) as usize];
        // driven bits read back the port latch, inputs read the pin
        (port & ddr) | (external & !ddr)
    }

    /// CPU-visible data space read, routed through the peripheral
    /// models where one owns the address.
    pub fn read_data(&mut self, addr: u16) -> u8 {
        if addr < 0x20 {
            return self.mem.data[addr as usize];
        }
        if addr < 0x100 {
            self.io_touched = true;
        }
        let cycle = self.cycle;
        if let Some(v) = self
            .timer0
            .read(addr, cycle, &mut self.mem.data, &mut self.sched)
        {
            return v;
        }
        if let Some(v) = self
            .timer1
            .read(addr, cycle, &mut self.mem.data, &mut self.sched)
        {
            return v;
        }
        if let Some(v) = self
            .timer3
            .read(addr, cycle, &mut self.mem.data, &mut self.sched)
        {
            return v;
        }
        if let Some(v) = self
            .timer4
            .read(addr, cycle, &mut self.mem.data, &mut self.sched)
        {
            return v;
        }
        if let Some(v) = self.spi.read(addr, &self.mem.data) {
            return v;
        }
        if let Some(v) = self.eeprom_ctrl.read(addr, cycle, &self.mem.data) {
            self.consume_eeprom_stall();
            return v;
        }
        if let Some(v) = self.adc.read(addr, &self.mem.data) {
            return v;
        }
        if let Some(v) = self.usb.read(addr, &mut self.mem.data) {
            return v;
        }
        match addr {
            0x23 => self.pin_input(0x23, self.pin_b),
            0x26 => self.pin_input(0x26, self.pin_c),
            0x29 => self.pin_input(0x29, self.pin_d),
            0x2c => self.pin_input(0x2c, self.pin_e),
            0x2f => self.pin_input(0x2f, self.pin_f),
            _ => self.mem.read_raw(addr),
        }
    }

    /// CPU-visible data space write.
    pub fn write_data(&mut self, addr: u16, value: u8) {
        if addr < 0x20 {
            self.mem.data[addr as usize] = value;
            return;
        }
        if addr < 0x100 {
            self.io_touched = true;
        }
        match addr {
            // writing 1 bits to PINx toggles PORTx
            0x23 | 0x26 | 0x29 | 0x2c | 0x2f => {
                let port = self.mem.data[(addr + 2) as usize];
                self.write_data(addr + 2, port ^ value);
                return;
            }
            // speaker pins: sample the outgoing level first
            0x27 | 0x28 => {
                self.sound.update(self.cycle, &self.mem.data);
                self.mem.data[addr as usize] = value;
                return;
            }
            PORTD => {
                let old = self.mem.data[PORTD as usize];
                self.mem.data[PORTD as usize] = value;
                let ddrd = self.mem.data[DDRD as usize];
                // FX chip select rising edge ends the transaction
                if ddrd & 0x02 != 0 && old & 0x02 == 0 && value & 0x02 != 0 {
                    self.fx_flash.deselect();
                }
                return;
            }
            // power reduction: let every gated model re-evaluate
            0x64 | 0x65 => {
                self.mem.data[addr as usize] = value;
                let c = self.cycle;
                for tag in [
                    EventTag::Timer0,
                    EventTag::Timer1,
                    EventTag::Timer3,
                    EventTag::Timer4,
                    EventTag::Spi,
                    EventTag::Adc,
                    EventTag::Usb,
                ] {
                    self.sched.schedule(c, tag);
                }
                return;
            }
            _ => {}
        }
        let cycle = self.cycle;
        if self
            .timer0
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .timer1
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .timer3
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .timer4
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .spi
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            if self.spi.collision_event {
                self.spi.collision_event = false;
                self.autobreak(BreakReason::SpiWriteCollision);
            }
            return;
        }
        if self.eeprom_ctrl.write(
            addr,
            value,
            cycle,
            &mut self.mem.data,
            &mut self.mem.eeprom,
            &mut self.sched,
        ) {
            self.consume_eeprom_stall();
            return;
        }
        if self
            .adc
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .pll
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            self.timer4
                .set_rate(self.pll.num12, cycle, &mut self.mem.data, &mut self.sched);
            return;
        }
        if self
            .watchdog
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        if self
            .usb
            .write(addr, value, cycle, &mut self.mem.data, &mut self.sched)
        {
            return;
        }
        self.mem.write_raw(addr, value);
    }

    /// EEPROM accesses halt the CPU; the controller leaves the cost
    /// here and the engine charges it.
    fn consume_eeprom_stall(&mut self) {
        if self.eeprom_ctrl.stall_cycles > 0 {
            self.cycle += self.eeprom_ctrl.stall_cycles as u64;
            self.eeprom_ctrl.stall_cycles = 0;
        }
    }

    // --- Stack ---

    pub fn push(&mut self, v: u8) {
        let sp = self.mem.sp();
        self.mem.write_raw(sp, v);
        let sp = sp.wrapping_sub(1);
        self.mem.set_sp(sp);
        if sp < self.min_stack {
            self.min_stack = sp;
        }
        if sp < self.stack_limit {
            self.autobreak(BreakReason::StackOverflow);
        }
    }

    pub fn pop(&mut self) -> u8 {
        let sp = self.mem.sp().wrapping_add(1);
        self.mem.set_sp(sp);
        self.mem.read_raw(sp)
    }

    pub fn push_word(&mut self, v: u16) {
        self.push(v as u8);
        self.push((v >> 8) as u8);
    }

    pub fn pop_word(&mut self) -> u16 {
        let hi = self.pop();
        let lo = self.pop();
        ((hi as u16) << 8) | lo as u16
    }

    // --- Fault hooks ---

    /// Pause with `reason` if that fault class is armed; otherwise the
    /// caller carries on with the hardware fallback.
    pub fn autobreak(&mut self, reason: BreakReason) {
        let armed = match reason {
            BreakReason::UnknownInstruction => self.autobreak.unknown_instruction,
            BreakReason::OutOfBoundsProgramCounter => self.autobreak.out_of_bounds_pc,
            BreakReason::StackOverflow => self.autobreak.stack_overflow,
            BreakReason::SpiWriteCollision => self.autobreak.spi_write_collision,
            BreakReason::Breakpoint => true,
        };
        if armed {
            self.paused = true;
            self.break_reason = Some(reason);
        }
    }

    /// Abort condition checked between the sub-steps of a merged run.
    pub fn merge_abort(&self) -> bool {
        self.paused || self.io_touched
    }

    /// WDR instruction.
    pub fn watchdog_restart(&mut self) {
        self.watchdog
            .restart(self.cycle, &self.mem.data, &mut self.sched);
    }

    // --- Introspection ---

    /// Disassembly of a word-address range of the loaded program.
    pub fn disassembly(&self, start_word: usize, end_word: usize) -> Vec<String> {
        disasm::disassemble_range(&self.mem.flash, start_word, end_word)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // hand-assembled opcode words
    const W_NOP: u16 = 0x0000;
    const W_SLEEP: u16 = 0x9588;
    const W_BREAK: u16 = 0x9598;
    const W_SEI: u16 = 0x9478;
    const W_RETI: u16 = 0x9518;

    fn prog(words: &[u16]) -> Vec<u8> {
        let mut bin = Vec::with_capacity(words.len() * 2);
        for w in words {
            bin.extend_from_slice(&w.to_le_bytes());
        }
        bin
    }

    fn ldi(d: u8, k: u8) -> u16 {
        // LDI Rd,K with d in 16..32
        0xe000 | ((k as u16 & 0xf0) << 4) | ((d as u16 - 16) << 4) | (k as u16 & 0x0f)
    }

    fn rjmp(from: u16, to: u16) -> u16 {
        let k = (to as i32 - from as i32 - 1) & 0xfff;
        0xc000 | k as u16
    }

    #[test]
    fn test_count_to_ten_and_sleep() {
        // LDI r16,0; loop: INC r16; CPI r16,10; BRNE loop; SLEEP
        let mut m = Machine::new();
        m.load_program(&prog(&[ldi(16, 0), 0x9503, 0x300a, 0xf7e9, W_SLEEP]));
        m.write_data(0x53, 1); // SMCR sleep enable
        let mut total = 0u32;
        while m.active {
            total += m.step();
            assert!(!m.paused);
        }
        assert_eq!(m.mem.reg(16), 10);
        // 1 + 10*(1+1) + 9*2 + 1 + 1
        assert_eq!(total, 41);
        assert_eq!(m.cycle, 41);
    }

    #[test]
    fn test_timer0_overflow_at_16384_cycles() {
        // prescaler 64, normal mode: overflow after 256 * 64 cycles
        let mut m = Machine::new();
        m.load_program(&prog(&[rjmp(0, 0)]));
        m.write_data(0x45, 0x03); // TCCR0B clk/64
        m.run(16_000);
        assert_eq!(m.read_data(0x35) & 1, 0);
        m.run(1_000);
        assert_eq!(m.read_data(0x35) & 1, 1);
        // the flag is a latch; clear it and the next period matches
        m.write_data(0x35, 1);
        m.run(15_000);
        assert_eq!(m.read_data(0x35) & 1, 0);
        m.run(1_000);
        assert_eq!(m.read_data(0x35) & 1, 1);
    }

    #[test]
    fn test_spi_transfer_completes_after_64_cycles() {
        // SPI2X + SPR0: 8 cycles per bit
        let mut m = Machine::new();
        m.load_program(&prog(&[rjmp(0, 0)]));
        m.write_data(0x4c, 0x51); // SPCR: SPE | MSTR | SPR0
        m.write_data(0x4d, 0x01); // SPSR: SPI2X
        m.write_data(SPDR, 0xab);
        assert!(m.spi.is_busy());
        m.run(62);
        assert!(m.spi.is_busy());
        assert_eq!(m.read_data(0x4d) & 0x80, 0);
        m.run(4);
        assert!(!m.spi.is_busy());
        assert_eq!(m.read_data(0x4d) & 0x80, 0x80);
        // nothing selected, so the bus reads back idle-high
        assert_eq!(m.read_data(SPDR), 0xff);
    }

    #[test]
    fn test_unknown_opcode_pauses_with_pc_unchanged() {
        let mut m = Machine::new();
        m.load_program(&[0xff, 0xff]);
        let n = m.step();
        assert_eq!(n, 0);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::UnknownInstruction));
        assert_eq!(m.pc, 0);
        // disarmed, the word executes as a one-cycle no-op
        m.autobreak.unknown_instruction = false;
        m.resume();
        assert_eq!(m.step(), 1);
        assert_eq!(m.pc, 1);
    }

    #[test]
    fn test_merged_execution_matches_single_step() {
        let program = prog(&[
            ldi(16, 0xaa),
            ldi(17, 0xbb),
            0x930f, // PUSH r16
            0x931f, // PUSH r17
            0x902f, // POP r2
            0x903f, // POP r3
            ldi(20, 3),
            0x954a, // DEC r20
            0xf7f1, // BRNE .-2
            W_BREAK,
        ]);
        let mut m1 = Machine::new();
        m1.load_program(&program);
        while !m1.paused {
            m1.step();
        }
        let mut m2 = Machine::new();
        m2.load_program(&program);
        m2.run(10_000);
        assert!(m2.paused);
        assert_eq!(m1.cycle, m2.cycle);
        assert_eq!(m1.cycle, 20);
        assert_eq!(m1.pc, m2.pc);
        for r in 0..32 {
            assert_eq!(m1.mem.reg(r), m2.mem.reg(r), "r{}", r);
        }
        assert_eq!(m2.mem.reg(2), 0xbb);
        assert_eq!(m2.mem.reg(3), 0xaa);
        assert_eq!(m2.mem.sp(), m1.mem.sp());
    }

    #[test]
    fn test_timer0_interrupt_dispatch() {
        // vector 0x2E holds RETI; main enables interrupts and spins
        let mut words = vec![rjmp(0, 0x30)];
        words.resize(0x2e, W_NOP);
        words.push(W_RETI);
        words.resize(0x30, W_NOP);
        words.push(W_SEI);
        words.push(rjmp(0x31, 0x31));
        let mut m = Machine::new();
        m.load_program(&prog(&words));
        m.write_data(0x6e, 0x01); // TIMSK0: TOIE0
        m.write_data(0x45, 0x01); // TCCR0B: clk/1, overflow at 256
        m.run(400);
        assert_eq!(m.dbg_irq_count, 1);
        // back in the idle loop with the flag consumed and I restored
        assert_eq!(m.pc, 0x31);
        assert_eq!(m.read_data(0x35) & 1, 0);
        assert_ne!(m.mem.sreg() & SREG_I, 0);
        assert!(m.active);
    }

    #[test]
    fn test_sleep_skips_to_next_deadline() {
        let mut words = vec![rjmp(0, 0x30)];
        words.resize(0x2e, W_NOP);
        words.push(W_RETI);
        words.resize(0x30, W_NOP);
        words.push(W_SEI);
        words.push(W_SLEEP);
        words.push(rjmp(0x32, 0x32));
        let mut m = Machine::new();
        m.load_program(&prog(&words));
        m.write_data(0x53, 1); // SMCR
        m.write_data(0x6e, 0x01); // TOIE0
        m.write_data(0x45, 0x03); // clk/64: overflow at 16384
        m.run(20_000);
        // slept through to the overflow, took the interrupt, returned
        assert_eq!(m.dbg_irq_count, 1);
        assert_eq!(m.pc, 0x32);
        assert!(m.active);
        assert!(m.cycle >= 16_384);
    }

    #[test]
    fn test_sleep_skip_is_bounded_without_deadlines() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_SLEEP, rjmp(1, 1)]));
        m.write_data(0x53, 1);
        assert_eq!(m.step(), 1);
        assert!(!m.active);
        assert_eq!(m.step(), SLEEP_SKIP_MAX as u32);
    }

    #[test]
    fn test_breakpoint_and_resume() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_NOP, W_NOP, W_NOP, W_NOP, W_BREAK]));
        m.set_breakpoint(2, true);
        m.run(100);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::Breakpoint));
        assert_eq!(m.pc, 2);
        assert_eq!(m.cycle, 2);
        m.resume();
        m.run(100);
        // ran past the breakpoint to the BREAK instruction
        assert!(m.paused);
        assert_eq!(m.pc, 5);
    }

    #[test]
    fn test_breakpoint_inside_fused_run() {
        // PUSH r16..r19 fuses into one record; a breakpoint on its 3rd
        // slot must still pause there under run()
        let mut m = Machine::new();
        m.load_program(&prog(&[0x930f, 0x931f, 0x932f, 0x933f, W_BREAK]));
        m.set_breakpoint(2, true);
        m.run(100);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::Breakpoint));
        assert_eq!(m.pc, 2);
        assert_eq!(m.cycle, 4);
        assert_eq!(m.mem.sp(), RAMEND - 2);
        m.resume();
        m.run(100);
        assert!(m.paused);
        assert_eq!(m.pc, 5);
    }

    #[test]
    fn test_out_of_bounds_pc() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_NOP]));
        m.pc = 0x4000;
        assert_eq!(m.step(), 0);
        assert_eq!(m.break_reason, Some(BreakReason::OutOfBoundsProgramCounter));
        // disarmed, the counter wraps the way the silicon's does
        m.autobreak.out_of_bounds_pc = false;
        m.resume();
        m.step();
        assert_eq!(m.pc, 1);
    }

    #[test]
    fn test_stack_guard() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_NOP]));
        m.mem.set_sp(0x101);
        m.push(0xaa);
        assert!(!m.paused);
        m.push(0xbb);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::StackOverflow));
        assert_eq!(m.min_stack, 0xff);
    }

    #[test]
    fn test_spi_write_collision_break() {
        let mut m = Machine::new();
        m.load_program(&prog(&[rjmp(0, 0)]));
        m.write_data(0x4c, 0x50);
        m.write_data(SPDR, 0x11);
        m.write_data(SPDR, 0x22);
        // quiet by default
        assert!(!m.paused);
        m.run(200);
        // SPSR-then-SPDR read sequence clears WCOL
        m.read_data(0x4d);
        m.read_data(SPDR);
        m.autobreak.spi_write_collision = true;
        m.write_data(SPDR, 0x33);
        m.write_data(SPDR, 0x44);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::SpiWriteCollision));
    }

    #[test]
    fn test_spi_routes_to_display() {
        let mut m = Machine::new();
        m.load_program(&prog(&[rjmp(0, 0)]));
        m.write_data(DDRD, 0xff);
        m.write_data(PORTD, 0x02); // display selected, command mode, FX deselected
        m.write_data(0x4c, 0x50); // SPCR: SPE | MSTR
        m.write_data(SPDR, 0xaf); // display on
        m.run(40);
        assert!(m.display.display_on);
        m.write_data(PORTD, 0x12); // D/C high: data
        m.write_data(SPDR, 0x5a);
        m.run(40);
        assert_eq!(m.display.ram[0], 0x5a);
    }

    #[test]
    fn test_spi_routes_to_fx_flash() {
        let mut m = Machine::new();
        m.load_flash_image(&[0x11, 0x22, 0x33]);
        m.load_program(&prog(&[rjmp(0, 0)]));
        m.write_data(DDRD, 0xff);
        m.write_data(0x4c, 0x50);
        let xfer = |m: &mut Machine, b: u8| {
            m.write_data(SPDR, b);
            m.run(40);
            m.read_data(SPDR)
        };
        // wake the chip, then read the JEDEC id
        m.write_data(PORTD, 0x40); // PD1 low selects the FX chip
        xfer(&mut m, 0xab);
        m.write_data(PORTD, 0x42); // deselect
        m.write_data(PORTD, 0x40);
        xfer(&mut m, 0x9f);
        assert_eq!(xfer(&mut m, 0x00), 0xef);
        m.write_data(PORTD, 0x42);
        // streaming read from address 0
        m.write_data(PORTD, 0x40);
        xfer(&mut m, 0x03);
        xfer(&mut m, 0x00);
        xfer(&mut m, 0x00);
        xfer(&mut m, 0x00);
        assert_eq!(xfer(&mut m, 0x00), 0x11);
        assert_eq!(xfer(&mut m, 0x00), 0x22);
    }

    #[test]
    fn test_button_reads_active_low() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_NOP]));
        // DDRF all inputs after reset
        assert_eq!(m.read_data(0x2f) & 0x80, 0x80);
        m.set_button(Button::Up, true);
        assert_eq!(m.read_data(0x2f) & 0x80, 0);
        m.set_button(Button::Up, false);
        assert_eq!(m.read_data(0x2f) & 0x80, 0x80);
        m.set_button(Button::A, true);
        assert_eq!(m.read_data(0x2c) & 0x40, 0);
    }

    #[test]
    fn test_pin_toggle_write() {
        let mut m = Machine::new();
        m.load_program(&prog(&[W_NOP]));
        m.write_data(0x24, 0xff); // DDRB
        m.write_data(0x25, 0x0f); // PORTB
        m.write_data(0x23, 0xff); // PINB write toggles
        assert_eq!(m.mem.data[0x25], 0xf0);
    }

    #[test]
    fn test_merged_run_aborts_mid_batch() {
        // four pushes merge into one batch; the stack guard trips on the
        // second, so only two sub-steps may land
        let mut m = Machine::new();
        m.load_program(&prog(&[0x930f, 0x931f, 0x932f, 0x933f, W_BREAK]));
        m.mem.set_sp(0x101);
        m.run(100);
        assert!(m.paused);
        assert_eq!(m.break_reason, Some(BreakReason::StackOverflow));
        assert_eq!(m.pc, 2);
        assert_eq!(m.cycle, 4);
        assert_eq!(m.mem.sp(), 0xff);
    }

    #[test]
    fn test_timer0_ctc_period() {
        // CTC: compare fires every (OCR0A + 1) * prescale cycles
        for (top, tccr0b, prescale) in [(99u8, 0x02u8, 8u64), (9, 0x03, 64)] {
            let mut m = Machine::new();
            m.load_program(&prog(&[rjmp(0, 0)]));
            m.write_data(0x47, top); // OCR0A
            m.write_data(0x44, 0x02); // TCCR0A: WGM01
            m.write_data(0x45, tccr0b);
            // first match when the counter reaches TOP, then every
            // (TOP + 1) * prescale cycles after the wrap
            let first = top as u64 * prescale;
            let period = (top as u64 + 1) * prescale;
            m.run(first - 5);
            assert_eq!(m.read_data(0x35) & 0x02, 0, "early, top={}", top);
            m.run(10);
            assert_eq!(m.read_data(0x35) & 0x02, 0x02, "first, top={}", top);
            m.write_data(0x35, 0x02);
            m.run(period - 10);
            assert_eq!(m.read_data(0x35) & 0x02, 0, "mid, top={}", top);
            m.run(10);
            assert_eq!(m.read_data(0x35) & 0x02, 0x02, "second, top={}", top);
        }
    }

    #[test]
    fn test_eeprom_write_and_read_back() {
        let mut m = Machine::new();
        m.load_program(&prog(&[rjmp(0, 0)]));
        // write 0x42 to EEPROM address 7
        m.write_data(0x41, 7); // EEARL
        m.write_data(0x40, 0x42); // EEDR
        m.write_data(0x3f, 0x04); // EEMPE
        m.write_data(0x3f, 0x02); // EEPE
        assert!(m.eeprom_ctrl.is_busy());
        m.run(60_000);
        assert!(!m.eeprom_ctrl.is_busy());
        assert_eq!(m.mem.eeprom[7], 0x42);
        // read it back: EERE latches into EEDR
        m.write_data(0x41, 7);
        m.write_data(0x3f, 0x01);
        assert_eq!(m.read_data(0x40), 0x42);
    }
}
