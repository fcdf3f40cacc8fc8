//! PLL frequency synthesizer.
//!
//! Enabling the PLL starts a 3 ms lock interval; PLOCK only reads back
//! set after the scheduled lock event fires, so startup code that spins
//! on PLOCK burns the same time it burns on hardware. Once locked, the
//! PLLFRQ postscaler selection is folded into a Timer4 tick rate
//! expressed as a numerator over 12 (a 96 MHz output on the /2 tap gives
//! 36/12 = 3 timer ticks per CPU cycle).

use serde::{Deserialize, Serialize};

use crate::peripherals::EventTag;
use crate::sched::Scheduler;

pub const PLLCSR: u16 = 0x49;
pub const PLLFRQ: u16 = 0x52;

const PLOCK: u8 = 1 << 0;
const PLLE: u8 = 1 << 1;

// 3 ms at 16 MHz
const LOCK_CYCLES: u64 = 16_000_000 * 3 / 1000;

#[derive(Clone, Serialize, Deserialize)]
pub struct Pll {
    locking: bool,
    lock_at: u64,
    pub locked: bool,
    /// Timer4 ticks per CPU cycle, times 12
    pub num12: u32,
}

impl Pll {
    pub fn new() -> Self {
        Pll {
            locking: false,
            lock_at: 0,
            locked: false,
            num12: 12,
        }
    }

    pub fn reset(&mut self) {
        *self = Pll::new();
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        match addr {
            PLLCSR => {
                // PLOCK is read-only
                data[addr as usize] = (value & !PLOCK) | (self.locked as u8);
                if value & PLLE != 0 {
                    if !self.locked && !self.locking {
                        self.locking = true;
                        self.lock_at = cycle + LOCK_CYCLES;
                        sched.schedule(self.lock_at, EventTag::Pll);
                    }
                } else {
                    self.locked = false;
                    self.locking = false;
                    self.num12 = 12;
                    data[addr as usize] &= !PLOCK;
                }
                true
            }
            PLLFRQ => {
                data[addr as usize] = value;
                self.recompute_rate(data);
                true
            }
            _ => false,
        }
    }

    /// Scheduled-event entry point: finish a due lock.
    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        if !self.locking {
            return;
        }
        if cycle < self.lock_at {
            sched.schedule(self.lock_at, EventTag::Pll);
            return;
        }
        self.locking = false;
        self.locked = true;
        data[PLLCSR as usize] |= PLOCK;
        self.recompute_rate(data);
    }

    fn recompute_rate(&mut self, data: &[u8]) {
        if !self.locked {
            self.num12 = 12;
            return;
        }
        let frq = data[PLLFRQ as usize];
        let pdiv = frq & 0x0f;
        // output frequency in MHz; only the documented taps synthesize
        let f = if (3..=10).contains(&pdiv) && pdiv != 6 {
            pdiv as u32 * 8 + 16
        } else {
            48
        };
        self.num12 = match (frq >> 4) & 3 {
            // PLLTM: off, /1, /1.5, /2
            1 => f * 3 / 4,
            2 => f / 2,
            3 => f * 3 / 8,
            _ => 12,
        };
    }
}

impl Default for Pll {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plock_after_lock_interval() {
        let mut p = Pll::new();
        let mut data = vec![0u8; crate::DATA_SIZE];
        let mut sched = Scheduler::new();
        p.write(PLLCSR, PLLE, 0, &mut data, &mut sched);
        assert_eq!(data[PLLCSR as usize] & PLOCK, 0);
        let (due, tag) = sched.next().unwrap();
        assert_eq!(tag, EventTag::Pll);
        assert_eq!(due, 48000);
        p.update(due, &mut data, &mut sched);
        assert_eq!(data[PLLCSR as usize] & PLOCK, PLOCK);
    }

    #[test]
    fn test_disable_drops_lock() {
        let mut p = Pll::new();
        let mut data = vec![0u8; crate::DATA_SIZE];
        let mut sched = Scheduler::new();
        p.write(PLLCSR, PLLE, 0, &mut data, &mut sched);
        p.update(48000, &mut data, &mut sched);
        p.write(PLLCSR, 0, 50000, &mut data, &mut sched);
        assert_eq!(data[PLLCSR as usize] & PLOCK, 0);
        assert_eq!(p.num12, 12);
    }

    #[test]
    fn test_timer4_rate_from_pllfrq() {
        let mut p = Pll::new();
        let mut data = vec![0u8; crate::DATA_SIZE];
        let mut sched = Scheduler::new();
        // 96 MHz output on the /2 tap -> 48 MHz timer clock
        p.write(PLLFRQ, 0x3a, 0, &mut data, &mut sched);
        p.write(PLLCSR, PLLE, 0, &mut data, &mut sched);
        assert_eq!(p.num12, 12);
        p.update(48000, &mut data, &mut sched);
        assert_eq!(p.num12, 36);
    }
}
