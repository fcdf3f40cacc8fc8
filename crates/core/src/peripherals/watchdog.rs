//! Watchdog timer.
//!
//! Runs from the 128 kHz oscillator, modeled as 125 CPU cycles per
//! watchdog tick. The timeout is (2048 << WDP) watchdog ticks. WDR and
//! any WDTCSR write restart the countdown. In interrupt mode expiry sets
//! WDIF; in reset mode it raises a system reset request that the engine
//! honors at the next instruction boundary.

use serde::{Deserialize, Serialize};

use crate::peripherals::{EventTag, INT_WDT};
use crate::sched::Scheduler;

pub const WDTCSR: u16 = 0x60;

const WDIF: u8 = 1 << 7;
const WDIE: u8 = 1 << 6;
const WDP3: u8 = 1 << 5;
const WDE: u8 = 1 << 3;

// 16 MHz / 128 kHz
const CYCLES_PER_WD_TICK: u64 = 125;

#[derive(Clone, Serialize, Deserialize)]
pub struct Watchdog {
    deadline: u64,
    /// Reset-mode expiry pending; the engine consumes this
    pub reset_request: bool,
    pub dbg_timeout_count: u32,
}

fn timeout_cycles(csr: u8) -> u64 {
    let wdp = (csr & 7) | if csr & WDP3 != 0 { 8 } else { 0 };
    (2048u64 << wdp) * CYCLES_PER_WD_TICK
}

fn running(csr: u8) -> bool {
    csr & (WDE | WDIE) != 0
}

impl Watchdog {
    pub fn new() -> Self {
        Watchdog {
            deadline: 0,
            reset_request: false,
            dbg_timeout_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Watchdog::new();
    }

    /// WDR instruction: restart the countdown.
    pub fn restart(&mut self, cycle: u64, data: &[u8], sched: &mut Scheduler) {
        let csr = data[WDTCSR as usize];
        if running(csr) {
            self.deadline = cycle + timeout_cycles(csr);
            sched.schedule(self.deadline, EventTag::Watchdog);
        }
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        if addr != WDTCSR {
            return false;
        }
        let old_if = data[WDTCSR as usize] & WDIF;
        let mut v = value & !WDIF;
        // WDIF is write-1-to-clear
        if value & WDIF == 0 {
            v |= old_if;
        }
        data[WDTCSR as usize] = v;
        if running(v) {
            self.deadline = cycle + timeout_cycles(v);
            sched.schedule(self.deadline, EventTag::Watchdog);
        }
        if v & WDIF != 0 && v & WDIE != 0 {
            sched.schedule(cycle, EventTag::Interrupt);
        }
        true
    }

    /// Scheduled-event entry point: fire a due timeout.
    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        let csr = data[WDTCSR as usize];
        if !running(csr) {
            return;
        }
        if cycle < self.deadline {
            sched.schedule(self.deadline, EventTag::Watchdog);
            return;
        }
        self.dbg_timeout_count += 1;
        if csr & WDIE != 0 {
            data[WDTCSR as usize] |= WDIF;
            sched.schedule(cycle, EventTag::Interrupt);
            self.deadline = cycle + timeout_cycles(csr);
            sched.schedule(self.deadline, EventTag::Watchdog);
        } else {
            self.reset_request = true;
        }
    }

    pub fn check_interrupt(&mut self, data: &mut [u8]) -> Option<u16> {
        let csr = data[WDTCSR as usize];
        if csr & WDIF != 0 && csr & WDIE != 0 {
            // combined mode drops back to reset-only after the interrupt
            data[WDTCSR as usize] &= !(WDIF | WDIE);
            Some(INT_WDT)
        } else {
            None
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Watchdog, Vec<u8>, Scheduler) {
        (Watchdog::new(), vec![0u8; crate::DATA_SIZE], Scheduler::new())
    }

    #[test]
    fn test_interrupt_mode_timeout() {
        let (mut w, mut data, mut sched) = setup();
        // WDIE, shortest period: 2048 wd ticks = 256000 cycles
        w.write(WDTCSR, WDIE, 0, &mut data, &mut sched);
        let (due, tag) = sched.next().unwrap();
        assert_eq!(tag, EventTag::Watchdog);
        assert_eq!(due, 2048 * 125);
        w.update(due, &mut data, &mut sched);
        assert_eq!(data[WDTCSR as usize] & WDIF, WDIF);
        assert_eq!(w.check_interrupt(&mut data), Some(INT_WDT));
        // WDIE cleared after the interrupt
        assert_eq!(data[WDTCSR as usize] & WDIE, 0);
    }

    #[test]
    fn test_wdr_postpones_timeout() {
        let (mut w, mut data, mut sched) = setup();
        w.write(WDTCSR, WDE, 0, &mut data, &mut sched);
        let first = w.deadline;
        w.restart(100_000, &data, &mut sched);
        assert_eq!(w.deadline, 100_000 + 2048 * 125);
        assert!(w.deadline > first);
        // old event fires early and does nothing
        w.update(first, &mut data, &mut sched);
        assert!(!w.reset_request);
        w.update(w.deadline, &mut data, &mut sched);
        assert!(w.reset_request);
    }

    #[test]
    fn test_wdp_scales_period() {
        let (mut w, mut data, mut sched) = setup();
        // WDP = 6: 2048<<6 ticks = 1.024 s
        w.write(WDTCSR, WDE | 6, 0, &mut data, &mut sched);
        assert_eq!(w.deadline, (2048u64 << 6) * 125);
        let _ = sched;
    }

    #[test]
    fn test_disabled_watchdog_never_fires() {
        let (mut w, mut data, mut sched) = setup();
        w.update(u64::MAX / 2, &mut data, &mut sched);
        assert!(!w.reset_request);
        assert_eq!(data[WDTCSR as usize], 0);
    }
}
