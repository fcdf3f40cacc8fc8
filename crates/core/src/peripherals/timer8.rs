//! 8-bit Timer/Counter0.
//!
//! Supports Normal, CTC, Fast PWM, and phase-correct PWM with the
//! standard prescaler table (1/8/64/256/1024). The counter is never
//! ticked per cycle: on each register access or scheduled event the model
//! advances by the whole elapsed span, walking edge to edge (compare
//! match, wrap, bottom) so every flag lands on its exact cycle, then
//! schedules the next flag edge with the global scheduler.
//!
//! Interrupt flags live in the TIFR0 register in data space, so guest
//! polling loops see them without any read hook.

use serde::{Deserialize, Serialize};

use crate::peripherals::{EventTag, INT_TIMER0_COMPA, INT_TIMER0_COMPB, INT_TIMER0_OVF};
use crate::sched::Scheduler;

pub const TIFR0: u16 = 0x35;
pub const TCCR0A: u16 = 0x44;
pub const TCCR0B: u16 = 0x45;
pub const TCNT0: u16 = 0x46;
pub const OCR0A: u16 = 0x47;
pub const OCR0B: u16 = 0x48;
pub const TIMSK0: u16 = 0x6e;

const PRR0: u16 = 0x64;
const PRTIM0: u8 = 1 << 5;

const FLAG_TOV: u8 = 1;
const FLAG_OCFA: u8 = 2;
const FLAG_OCFB: u8 = 4;

fn divider_for(cs: u8) -> u32 {
    match cs {
        1 => 1,
        2 => 8,
        3 => 64,
        4 => 256,
        5 => 1024,
        // stopped, or external clock pin (not modeled)
        _ => 0,
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Timer8 {
    /// Cycle of the last counter update
    tick: u64,
    divider: u32,
    /// Cycles already consumed toward the next prescaled tick
    divider_cycle: u32,
    mode: u8,
    com_a: u8,
    com_b: u8,
    ocr_a: u8,
    ocr_b: u8,
    /// Double-buffered compare values, latched at top in PWM modes
    next_ocr_a: u8,
    next_ocr_b: u8,
    tcnt: u16,
    count_down: bool,
    pub dbg_ovf_count: u32,
    pub dbg_int_fire_count: u32,
}

impl Timer8 {
    pub fn new() -> Self {
        Timer8 {
            tick: 0,
            divider: 0,
            divider_cycle: 0,
            mode: 0,
            com_a: 0,
            com_b: 0,
            ocr_a: 0,
            ocr_b: 0,
            next_ocr_a: 0,
            next_ocr_b: 0,
            tcnt: 0,
            count_down: false,
            dbg_ovf_count: 0,
            dbg_int_fire_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Timer8::new();
    }

    fn pwm(&self) -> bool {
        matches!(self.mode, 1 | 3 | 5 | 7)
    }

    fn phase_correct(&self) -> bool {
        matches!(self.mode, 1 | 5)
    }

    fn top(&self) -> u16 {
        match self.mode {
            0 => 0xff,
            2 => self.ocr_a as u16,
            3 => 0xff,
            1 => 0xff,
            // PWM with OCRA top: clamp so a tiny top cannot stall the walk
            5 | 7 => (self.ocr_a as u16).max(3),
            _ => 0xff,
        }
    }

    /// Handle a write to a timer register. Returns true if handled.
    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        match addr {
            TIFR0 => {
                self.update(cycle, data, sched);
                // writing 1 to a TIFR bit clears the flag
                data[TIFR0 as usize] &= !value;
                true
            }
            TCCR0A => {
                self.update(cycle, data, sched);
                self.com_a = (value >> 6) & 3;
                self.com_b = (value >> 4) & 3;
                self.mode = (self.mode & 4) | (value & 3);
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TCCR0B => {
                self.update(cycle, data, sched);
                self.mode = (self.mode & 3) | ((value >> 1) & 4);
                let div = divider_for(value & 7);
                if div != self.divider {
                    self.divider = div;
                    self.divider_cycle = 0;
                    self.tick = cycle;
                }
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            OCR0A => {
                self.update(cycle, data, sched);
                self.next_ocr_a = value;
                if !self.pwm() {
                    self.ocr_a = value;
                }
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            OCR0B => {
                self.update(cycle, data, sched);
                self.next_ocr_b = value;
                if !self.pwm() {
                    self.ocr_b = value;
                }
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TCNT0 => {
                self.update(cycle, data, sched);
                self.tcnt = value as u16;
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TIMSK0 => {
                data[addr as usize] = value;
                // newly enabled interrupt may already have a pending flag
                if data[TIFR0 as usize] & value & 7 != 0 {
                    sched.schedule(cycle, EventTag::Interrupt);
                }
                true
            }
            _ => false,
        }
    }

    /// Handle a read from a timer register. Returns Some(value) if handled.
    pub fn read(
        &mut self,
        addr: u16,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> Option<u8> {
        match addr {
            TCNT0 | TIFR0 => {
                self.update(cycle, data, sched);
                Some(data[addr as usize])
            }
            _ => None,
        }
    }

    fn stopped(&self, data: &[u8]) -> bool {
        self.divider == 0 || data[PRR0 as usize] & PRTIM0 != 0
    }

    /// Advance the counter to `cycle`, setting flags in data space, then
    /// schedule the next flag edge.
    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        if self.stopped(data) {
            self.tick = cycle;
            return;
        }
        let elapsed = cycle.wrapping_sub(self.tick);
        self.tick = cycle;
        let total = elapsed + self.divider_cycle as u64;
        let mut ticks = total / self.divider as u64;
        self.divider_cycle = (total % self.divider as u64) as u32;

        let mut flags = 0u8;
        while ticks > 0 {
            let top = self.top();
            if self.tcnt > top {
                // top moved below the counter; wrap at MAX
                let dist = 0x100 - self.tcnt;
                let step = ticks.min(dist as u64) as u16;
                self.tcnt += step;
                ticks -= step as u64;
                if self.tcnt == 0x100 {
                    self.tcnt = 0;
                    flags |= FLAG_TOV;
                    self.dbg_ovf_count += 1;
                }
                continue;
            }
            if self.phase_correct() && self.count_down {
                if self.tcnt == 0 {
                    self.count_down = false;
                    continue;
                }
                let step = ticks.min(self.tcnt as u64) as u16;
                let newv = self.tcnt - step;
                if self.ocr_a as u16 >= newv && (self.ocr_a as u16) < self.tcnt {
                    flags |= FLAG_OCFA;
                }
                if self.ocr_b as u16 >= newv && (self.ocr_b as u16) < self.tcnt {
                    flags |= FLAG_OCFB;
                }
                self.tcnt = newv;
                ticks -= step as u64;
                if self.tcnt == 0 {
                    flags |= FLAG_TOV;
                    self.dbg_ovf_count += 1;
                    self.count_down = false;
                    if ticks == 0 {
                        break;
                    }
                }
            } else {
                let dist = if self.phase_correct() {
                    top - self.tcnt
                } else {
                    top + 1 - self.tcnt
                };
                if dist == 0 {
                    self.count_down = true;
                    continue;
                }
                let step = ticks.min(dist as u64) as u16;
                let newv = self.tcnt + step;
                // matches occur on counter values tcnt+1 ..= newv
                if self.ocr_a as u16 > self.tcnt && self.ocr_a as u16 <= newv {
                    flags |= FLAG_OCFA;
                }
                if self.ocr_b as u16 > self.tcnt && self.ocr_b as u16 <= newv {
                    flags |= FLAG_OCFB;
                }
                self.tcnt = newv;
                ticks -= step as u64;
                if self.tcnt == top + 1 {
                    self.tcnt = 0;
                    if self.pwm() {
                        self.ocr_a = self.next_ocr_a;
                        self.ocr_b = self.next_ocr_b;
                    }
                    match self.mode {
                        2 => {
                            if top == 0xff {
                                flags |= FLAG_TOV;
                            }
                        }
                        _ => {
                            flags |= FLAG_TOV;
                            self.dbg_ovf_count += 1;
                        }
                    }
                } else if self.phase_correct() && self.tcnt == top {
                    self.count_down = true;
                    if self.pwm() {
                        self.ocr_a = self.next_ocr_a;
                        self.ocr_b = self.next_ocr_b;
                    }
                }
            }
        }

        data[TCNT0 as usize] = self.tcnt as u8;
        if flags != 0 {
            data[TIFR0 as usize] |= flags;
            if data[TIMSK0 as usize] & data[TIFR0 as usize] & 7 != 0 {
                sched.schedule(cycle, EventTag::Interrupt);
            }
        }
        self.reschedule(cycle, data, sched);
    }

    /// Prescaled ticks from the current count to the next flag edge.
    fn ticks_to_next_edge(&self) -> u64 {
        let top = self.top();
        let period = top as u64 + 1;
        if self.tcnt > top {
            return (0x100 - self.tcnt) as u64;
        }
        if self.phase_correct() && self.count_down {
            // bottom is the nearest guaranteed edge when counting down
            return (self.tcnt as u64).max(1);
        }
        let mut best = period - self.tcnt as u64;
        for v in [self.ocr_a as u16, self.ocr_b as u16] {
            if v <= top {
                let d = if v > self.tcnt {
                    (v - self.tcnt) as u64
                } else {
                    period - self.tcnt as u64 + v as u64
                };
                if d > 0 && d < best {
                    best = d;
                }
            }
        }
        best
    }

    fn reschedule(&self, cycle: u64, data: &[u8], sched: &mut Scheduler) {
        if self.stopped(data) {
            return;
        }
        let ticks = self.ticks_to_next_edge();
        let cycles = ticks * self.divider as u64 - self.divider_cycle as u64;
        sched.schedule(cycle + cycles.max(1), EventTag::Timer0);
    }

    /// Highest-priority pending enabled interrupt, clearing its flag.
    /// Priority follows the vector table: COMPA > COMPB > OVF.
    pub fn check_interrupt(&mut self, data: &mut [u8]) -> Option<u16> {
        let pending = data[TIFR0 as usize] & data[TIMSK0 as usize];
        let (bit, vec) = if pending & FLAG_OCFA != 0 {
            (FLAG_OCFA, INT_TIMER0_COMPA)
        } else if pending & FLAG_OCFB != 0 {
            (FLAG_OCFB, INT_TIMER0_COMPB)
        } else if pending & FLAG_TOV != 0 {
            (FLAG_TOV, INT_TIMER0_OVF)
        } else {
            return None;
        };
        data[TIFR0 as usize] &= !bit;
        self.dbg_int_fire_count += 1;
        Some(vec)
    }
}

impl Default for Timer8 {
    fn default() -> Self {
        Self::new()
    }
}
