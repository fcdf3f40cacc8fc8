//! Machine save states.
//!
//! Captures the full machine to an opaque byte blob: bincode payload,
//! deflate-compressed, behind a small magic/version header. The
//! scheduler is deliberately not serialized; on load every event tag is
//! re-armed at the restored cycle so each peripheral recomputes its own
//! next deadline from register state.
//!
//! ## Blob format
//!
//! ```text
//! +------------------+
//! | Magic "AVSS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::display::Display;
use crate::peripherals::{
    Adc, EepromCtrl, EventTag, FxFlash, Pll, Sound, Spi, Timer16, Timer4, Timer8, Usb, Watchdog,
};
use crate::{BreakReason, Machine};

const MAGIC: &[u8; 4] = b"AVSS";
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SaveState {
    // CPU
    pc: u16,
    cycle: u64,
    active: bool,
    wakeup_cycles: u32,
    paused: bool,
    break_reason: Option<BreakReason>,
    prev_sreg: u8,

    // memory
    data: Vec<u8>,
    flash: Vec<u8>,
    eeprom: Vec<u8>,

    // peripherals
    timer0: Timer8,
    timer1: Timer16,
    timer3: Timer16,
    timer4: Timer4,
    spi: Spi,
    eeprom_ctrl: EepromCtrl,
    adc: Adc,
    pll: Pll,
    watchdog: Watchdog,
    usb: Usb,
    sound: Sound,
    display: Display,
    fx_flash: FxFlash,

    // pins and telemetry
    pin_b: u8,
    pin_c: u8,
    pin_d: u8,
    pin_e: u8,
    pin_f: u8,
    min_stack: u16,
    frame_count: u64,
    dbg_irq_count: u64,
}

impl Machine {
    /// Serialize the whole machine to a compressed blob.
    pub fn save_state(&self) -> Vec<u8> {
        let state = SaveState {
            pc: self.pc,
            cycle: self.cycle,
            active: self.active,
            wakeup_cycles: self.wakeup_cycles,
            paused: self.paused,
            break_reason: self.break_reason,
            prev_sreg: self.prev_sreg,
            data: self.mem.data.clone(),
            flash: self.mem.flash.clone(),
            eeprom: self.mem.eeprom.clone(),
            timer0: self.timer0.clone(),
            timer1: self.timer1.clone(),
            timer3: self.timer3.clone(),
            timer4: self.timer4.clone(),
            spi: self.spi.clone(),
            eeprom_ctrl: self.eeprom_ctrl.clone(),
            adc: self.adc.clone(),
            pll: self.pll.clone(),
            watchdog: self.watchdog.clone(),
            usb: self.usb.clone(),
            sound: self.sound.clone(),
            display: self.display.clone(),
            fx_flash: self.fx_flash.clone(),
            pin_b: self.pin_b,
            pin_c: self.pin_c,
            pin_d: self.pin_d,
            pin_e: self.pin_e,
            pin_f: self.pin_f,
            min_stack: self.min_stack,
            frame_count: self.frame_count,
            dbg_irq_count: self.dbg_irq_count,
        };
        // the struct serializes infallibly
        let payload = bincode::serialize(&state).unwrap_or_default();
        let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);
        let mut out = Vec::with_capacity(8 + compressed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&compressed);
        out
    }

    /// Restore the machine from a blob produced by [`Machine::save_state`].
    ///
    /// Breakpoints and fault arming are session settings and survive the
    /// load untouched.
    pub fn load_state(&mut self, blob: &[u8]) -> Result<(), String> {
        if blob.len() < 8 {
            return Err("save state too small".into());
        }
        if &blob[0..4] != MAGIC {
            return Err("not a save state (bad magic)".into());
        }
        let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        if version != FORMAT_VERSION {
            return Err(format!(
                "unsupported save state version {} (expected {})",
                version, FORMAT_VERSION
            ));
        }
        let payload = miniz_oxide::inflate::decompress_to_vec(&blob[8..])
            .map_err(|e| format!("decompress error: {:?}", e))?;
        let state: SaveState =
            bincode::deserialize(&payload).map_err(|e| format!("deserialize error: {}", e))?;
        if state.data.len() != crate::DATA_SIZE
            || state.flash.len() != crate::FLASH_SIZE
            || state.eeprom.len() != crate::EEPROM_SIZE
        {
            return Err("save state memory sizes do not match".into());
        }

        self.pc = state.pc;
        self.cycle = state.cycle;
        self.active = state.active;
        self.wakeup_cycles = state.wakeup_cycles;
        self.paused = state.paused;
        self.break_reason = state.break_reason;
        self.prev_sreg = state.prev_sreg;
        self.mem.data = state.data;
        self.mem.flash = state.flash;
        self.mem.eeprom = state.eeprom;
        self.timer0 = state.timer0;
        self.timer1 = state.timer1;
        self.timer3 = state.timer3;
        self.timer4 = state.timer4;
        self.spi = state.spi;
        self.eeprom_ctrl = state.eeprom_ctrl;
        self.adc = state.adc;
        self.pll = state.pll;
        self.watchdog = state.watchdog;
        self.usb = state.usb;
        self.sound = state.sound;
        self.display = state.display;
        self.fx_flash = state.fx_flash;
        self.pin_b = state.pin_b;
        self.pin_c = state.pin_c;
        self.pin_d = state.pin_d;
        self.pin_e = state.pin_e;
        self.pin_f = state.pin_f;
        self.min_stack = state.min_stack;
        self.frame_count = state.frame_count;
        self.dbg_irq_count = state.dbg_irq_count;
        self.skip_breakpoint = false;
        self.io_touched = false;
        self.device_sync_cycle = self.cycle;

        self.redecode();

        // re-arm the scheduler: every model reschedules itself from its
        // restored registers when its tag fires
        self.sched.clear();
        for i in 0..EventTag::COUNT {
            self.sched.schedule(self.cycle, EventTag::from_index(i));
        }
        Ok(())
    }

    /// Save to a file.
    pub fn save_state_to_file(&self, path: &Path) -> Result<(), String> {
        std::fs::write(path, self.save_state()).map_err(|e| format!("write error: {}", e))
    }

    /// Load from a file.
    pub fn load_state_from_file(&mut self, path: &Path) -> Result<(), String> {
        let blob = std::fs::read(path).map_err(|e| format!("read error: {}", e))?;
        self.load_state(&blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_program() -> Vec<u8> {
        // LDI r16,0; loop: INC r16; RJMP loop
        let words: [u16; 3] = [0xe000, 0x9503, 0xcffe];
        let mut bin = Vec::new();
        for w in words {
            bin.extend_from_slice(&w.to_le_bytes());
        }
        bin
    }

    #[test]
    fn test_round_trip_restores_execution() {
        let mut m = Machine::new();
        m.load_program(&counting_program());
        m.run(31);
        let blob = m.save_state();
        let mid = (m.pc, m.cycle, m.mem.reg(16));
        m.run(100);
        let end = (m.pc, m.cycle, m.mem.reg(16));

        let mut m2 = Machine::new();
        m2.load_state(&blob).unwrap();
        assert_eq!((m2.pc, m2.cycle, m2.mem.reg(16)), mid);
        m2.run(100);
        assert_eq!((m2.pc, m2.cycle, m2.mem.reg(16)), end);
    }

    #[test]
    fn test_restore_preserves_pending_timer() {
        let mut m = Machine::new();
        m.load_program(&counting_program());
        m.write_data(0x45, 0x03); // timer0, clk/64
        m.run(10_000);
        let blob = m.save_state();

        let mut m2 = Machine::new();
        m2.load_state(&blob).unwrap();
        // overflow still lands at 16384 total cycles
        m2.run(6_000);
        assert_eq!(m2.read_data(0x35) & 1, 0);
        m2.run(1_000);
        assert_eq!(m2.read_data(0x35) & 1, 1);
    }

    #[test]
    fn test_bad_blobs_are_rejected() {
        let mut m = Machine::new();
        assert!(m.load_state(b"AV").is_err());
        assert!(m.load_state(b"NOPEnope----").is_err());
        let mut blob = m.save_state();
        blob[4] = 99; // version
        assert!(m.load_state(&blob).is_err());
    }
}
