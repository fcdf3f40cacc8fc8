//! EEPROM programming controller.
//!
//! Programming really takes milliseconds of simulated time: 3.4 ms for
//! atomic erase+write, 1.8 ms for erase-only or write-only. While the
//! window is open EEPE reads back as set and new program requests are
//! ignored, so firmware that polls EEPE behaves exactly as on hardware.
//! EEMPE arms a 4-cycle window, enforced against the cycle counter, not
//! an instruction count.
//!
//! Write-only mode can only clear bits (cell AND data), matching what
//! the silicon does to a non-erased cell.

use serde::{Deserialize, Serialize};

use crate::peripherals::EventTag;
use crate::sched::Scheduler;

pub const EECR: u16 = 0x3f;
pub const EEDR: u16 = 0x40;
pub const EEARL: u16 = 0x41;
pub const EEARH: u16 = 0x42;

const EERE: u8 = 1 << 0;
const EEPE: u8 = 1 << 1;
const EEMPE: u8 = 1 << 2;

// 3.4 ms / 1.8 ms at 16 MHz
const ERASE_WRITE_CYCLES: u64 = 16 * 3400;
const SPLIT_OP_CYCLES: u64 = 16 * 1800;

#[derive(Clone, Serialize, Deserialize)]
pub struct EepromCtrl {
    /// EEMPE window closes at this cycle; 0 = unarmed
    eempe_until: u64,
    busy: bool,
    busy_until: u64,
    /// CPU stall cycles requested by the last register access
    pub stall_cycles: u32,
    pub dbg_program_count: u32,
}

impl EepromCtrl {
    pub fn new() -> Self {
        EepromCtrl {
            eempe_until: 0,
            busy: false,
            busy_until: 0,
            stall_cycles: 0,
            dbg_program_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = EepromCtrl::new();
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        eeprom: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        match addr {
            EEDR | EEARL => {
                data[addr as usize] = value;
                true
            }
            EEARH => {
                data[addr as usize] = value & 3;
                true
            }
            EECR => {
                let cell = ((data[EEARH as usize] as usize & 3) << 8 | data[EEARL as usize] as usize)
                    % eeprom.len();
                if value & EEMPE != 0 && !self.busy {
                    self.eempe_until = cycle + 4;
                    sched.schedule(self.eempe_until, EventTag::Eeprom);
                }
                if value & EEPE != 0 && !self.busy && cycle < self.eempe_until {
                    let duration = match (value >> 4) & 3 {
                        0 => {
                            eeprom[cell] = data[EEDR as usize];
                            ERASE_WRITE_CYCLES
                        }
                        1 => {
                            eeprom[cell] = 0xff;
                            SPLIT_OP_CYCLES
                        }
                        2 => {
                            eeprom[cell] &= data[EEDR as usize];
                            SPLIT_OP_CYCLES
                        }
                        _ => 0,
                    };
                    if duration > 0 {
                        self.busy = true;
                        self.busy_until = cycle + duration;
                        self.eempe_until = 0;
                        self.dbg_program_count += 1;
                        sched.schedule(self.busy_until, EventTag::Eeprom);
                        // starting a program halts the CPU for two cycles
                        self.stall_cycles = 2;
                    }
                } else if value & EERE != 0 && !self.busy {
                    data[EEDR as usize] = eeprom[cell];
                    // read stalls the CPU four cycles
                    self.stall_cycles = 4;
                }
                // EEPM and EERIE are plain stored bits; EEPE/EEMPE read
                // back from controller state
                data[EECR as usize] = value & 0x38;
                true
            }
            _ => false,
        }
    }

    pub fn read(&mut self, addr: u16, cycle: u64, data: &[u8]) -> Option<u8> {
        if addr != EECR {
            return None;
        }
        let mut v = data[EECR as usize];
        if self.busy && cycle < self.busy_until {
            v |= EEPE;
        }
        if cycle < self.eempe_until {
            v |= EEMPE;
        }
        Some(v)
    }

    /// Scheduled-event entry point: close expired windows. The EEMPE
    /// window entry can shadow the busy-completion entry under the
    /// shared tag, so an early call re-arms the completion cycle.
    pub fn update(&mut self, cycle: u64, sched: &mut Scheduler) {
        if self.busy {
            if cycle >= self.busy_until {
                self.busy = false;
            } else {
                sched.schedule(self.busy_until, EventTag::Eeprom);
            }
        }
        if self.eempe_until != 0 && cycle >= self.eempe_until {
            self.eempe_until = 0;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

impl Default for EepromCtrl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (EepromCtrl, Vec<u8>, Vec<u8>, Scheduler) {
        (
            EepromCtrl::new(),
            vec![0u8; crate::DATA_SIZE],
            vec![0xffu8; crate::EEPROM_SIZE],
            Scheduler::new(),
        )
    }

    #[test]
    fn test_read_is_immediate_with_stall() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        eeprom[0x123] = 0x42;
        e.write(EEARH, 0x01, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EEARL, 0x23, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EERE, 0, &mut data, &mut eeprom, &mut sched);
        assert_eq!(data[EEDR as usize], 0x42);
        assert_eq!(e.stall_cycles, 4);
    }

    #[test]
    fn test_atomic_write_busy_window() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        e.write(EEARL, 0x10, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EEDR, 0x5a, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, 100, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 102, &mut data, &mut eeprom, &mut sched);
        assert_eq!(eeprom[0x10], 0x5a);
        // EEPE polls as busy for 3.4 ms
        assert_eq!(e.read(EECR, 103, &data).unwrap() & EEPE, EEPE);
        assert_eq!(e.read(EECR, 102 + 16 * 3400, &data).unwrap() & EEPE, 0);
        e.update(102 + 16 * 3400, &mut sched);
        assert!(!e.is_busy());
    }

    #[test]
    fn test_early_event_rearms_busy_completion() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        e.write(EEDR, 0x5a, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, 100, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 102, &mut data, &mut eeprom, &mut sched);
        // the EEMPE window entry (cycle 104) fires before the busy
        // window closes; the completion cycle must come back
        let (due, _) = sched.next().unwrap();
        assert_eq!(due, 104);
        sched.pop();
        e.update(104, &mut sched);
        assert!(e.is_busy());
        let (due, tag) = sched.next().unwrap();
        assert_eq!(tag, EventTag::Eeprom);
        assert_eq!(due, 102 + 16 * 3400);
        e.update(due, &mut sched);
        assert!(!e.is_busy());
        // a second program request now lands
        e.write(EEARL, 1, due + 1, &mut data, &mut eeprom, &mut sched);
        e.write(EEDR, 0x22, due + 1, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, due + 2, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, due + 4, &mut data, &mut eeprom, &mut sched);
        assert_eq!(eeprom[1], 0x22);
    }

    #[test]
    fn test_eepe_without_eempe_window_ignored() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        e.write(EEDR, 0x5a, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 0, &mut data, &mut eeprom, &mut sched);
        assert_eq!(eeprom[0], 0xff);
        assert!(!e.is_busy());
        // window expired: armed at 100, EEPE at 105
        e.write(EECR, EEMPE, 100, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 105, &mut data, &mut eeprom, &mut sched);
        assert!(!e.is_busy());
    }

    #[test]
    fn test_write_only_mode_ands_cell() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        eeprom[0] = 0xf0;
        e.write(EEDR, 0x3c, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE | 0x20, 2, &mut data, &mut eeprom, &mut sched);
        assert_eq!(eeprom[0], 0x30);
    }

    #[test]
    fn test_program_while_busy_ignored() {
        let (mut e, mut data, mut eeprom, mut sched) = setup();
        e.write(EEDR, 0x11, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, 0, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 1, &mut data, &mut eeprom, &mut sched);
        e.write(EEARL, 1, 2, &mut data, &mut eeprom, &mut sched);
        e.write(EEDR, 0x22, 2, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEMPE, 3, &mut data, &mut eeprom, &mut sched);
        e.write(EECR, EEPE, 4, &mut data, &mut eeprom, &mut sched);
        assert_eq!(eeprom[1], 0xff);
    }
}
