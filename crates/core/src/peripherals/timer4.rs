//! 10-bit high-speed Timer/Counter4.
//!
//! Timer4 counts to OCR4C and has the extended prescaler table
//! (/1../16384, divider = 1 << (CS-1)). It can run from the PLL
//! postscaler instead of the system clock; the PLL model pushes its rate
//! here as a numerator over 12, so a 96 MHz/2 tap makes the timer count
//! 48/16 = 3 ticks per CPU cycle without any floating point. The rate
//! accumulator keeps sub-tick remainders exact across batches.
//!
//! All four OCR registers share the TC4H high-byte latch, and writes land
//! in shadow registers first; the active compare values latch at top.
//! OC4A is the second speaker pin (PC7), so toggle mode flips the port
//! bit on every compare A match.

use serde::{Deserialize, Serialize};

use crate::peripherals::{
    EventTag, INT_TIMER4_COMPA, INT_TIMER4_COMPB, INT_TIMER4_COMPD, INT_TIMER4_OVF,
};
use crate::sched::Scheduler;

pub const TCNT4: u16 = 0xbe;
pub const TC4H: u16 = 0xbf;
pub const TCCR4A: u16 = 0xc0;
pub const TCCR4B: u16 = 0xc1;
pub const TCCR4C: u16 = 0xc2;
pub const TCCR4D: u16 = 0xc3;
pub const TCCR4E: u16 = 0xc4;
pub const OCR4A: u16 = 0xcf;
pub const OCR4B: u16 = 0xd0;
pub const OCR4C: u16 = 0xd1;
pub const OCR4D: u16 = 0xd2;
pub const TIFR4: u16 = 0x39;
pub const TIMSK4: u16 = 0x72;

const PRR1: u16 = 0x65;
const PRTIM4: u8 = 1 << 4;
const PORTC: u16 = 0x28;

const FLAG_TOV: u8 = 1 << 2;
const FLAG_OCFB: u8 = 1 << 5;
const FLAG_OCFA: u8 = 1 << 6;
const FLAG_OCFD: u8 = 1 << 7;

#[derive(Clone, Serialize, Deserialize)]
pub struct Timer4 {
    tick: u64,
    divider: u32,
    /// Tick-rate numerator over 12: 12 = system clock, >12 = PLL tap
    num12: u32,
    /// Accumulated cycle fraction in units of 1/(12*divider) tick
    acc: u64,
    tcnt: u16,
    tc4h: u8,
    wgm: u8,
    com_a: u8,
    /// Active compare values A/B/D and the top register C
    ocr: [u16; 4],
    /// Shadow registers, latched into `ocr` at top
    next_ocr: [u16; 4],
    count_down: bool,
    pub dbg_ovf_count: u32,
    pub dbg_int_fire_count: u32,
}

const A: usize = 0;
const B: usize = 1;
const D: usize = 2;
const C: usize = 3;

impl Timer4 {
    pub fn new() -> Self {
        Timer4 {
            tick: 0,
            divider: 0,
            num12: 12,
            acc: 0,
            tcnt: 0,
            tc4h: 0,
            wgm: 0,
            com_a: 0,
            ocr: [0, 0, 0, 0xff],
            next_ocr: [0, 0, 0, 0xff],
            count_down: false,
            dbg_ovf_count: 0,
            dbg_int_fire_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Timer4::new();
    }

    /// Called by the PLL model when its output changes.
    pub fn set_rate(&mut self, num12: u32, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        self.update(cycle, data, sched);
        self.num12 = num12.max(1);
        self.reschedule(cycle, data, sched);
    }

    fn top(&self) -> u32 {
        (self.ocr[C] as u32).max(3) & 0x3ff
    }

    fn phase_correct(&self) -> bool {
        self.wgm == 1
    }

    fn stopped(&self, data: &[u8]) -> bool {
        self.divider == 0 || data[PRR1 as usize] & PRTIM4 != 0
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
            TIFR4 => {
                self.update(cycle, data, sched);
                data[TIFR4 as usize] &= !value;
                true
            }
            TIMSK4 => {
                data[addr as usize] = value;
                if data[TIFR4 as usize] & value != 0 {
                    sched.schedule(cycle, EventTag::Interrupt);
                }
                true
            }
            TC4H => {
                self.tc4h = value & 3;
                data[addr as usize] = self.tc4h;
                true
            }
            TCNT4 => {
                self.update(cycle, data, sched);
                self.tcnt = value as u16 | ((self.tc4h as u16) << 8);
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TCCR4A => {
                self.update(cycle, data, sched);
                self.com_a = (value >> 6) & 3;
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TCCR4B => {
                self.update(cycle, data, sched);
                let cs = value & 0x0f;
                let div = if cs == 0 { 0 } else { 1u32 << (cs - 1) };
                if div != self.divider {
                    self.divider = div;
                    self.acc = 0;
                    self.tick = cycle;
                }
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            TCCR4C | TCCR4E => {
                data[addr as usize] = value;
                true
            }
            TCCR4D => {
                self.update(cycle, data, sched);
                self.wgm = value & 3;
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            OCR4A | OCR4B | OCR4C | OCR4D => {
                self.update(cycle, data, sched);
                let v = (value as u16 | ((self.tc4h as u16) << 8)) & 0x3ff;
                let n = match addr {
                    OCR4A => A,
                    OCR4B => B,
                    OCR4D => D,
                    _ => C,
                };
                self.next_ocr[n] = v;
                // outside PWM the shadow latches immediately
                if self.divider == 0 || self.wgm == 0 && self.com_a == 0 {
                    self.ocr[n] = v;
                }
                data[addr as usize] = value;
                self.reschedule(cycle, data, sched);
                true
            }
            _ => false,
        }
    }

    pub fn read(
        &mut self,
        addr: u16,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> Option<u8> {
        match addr {
            TCNT4 => {
                self.update(cycle, data, sched);
                self.tc4h = (self.tcnt >> 8) as u8;
                Some(self.tcnt as u8)
            }
            TC4H => Some(self.tc4h),
            TIFR4 => {
                self.update(cycle, data, sched);
                Some(data[addr as usize])
            }
            _ => None,
        }
    }

    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        if self.stopped(data) {
            self.tick = cycle;
            return;
        }
        let elapsed = cycle.wrapping_sub(self.tick);
        self.tick = cycle;
        let unit = 12 * self.divider as u64;
        self.acc += elapsed * self.num12 as u64;
        let mut ticks = self.acc / unit;
        self.acc %= unit;

        let mut flags = 0u8;
        while ticks > 0 {
            let top = self.top();
            if self.tcnt as u32 > top {
                let dist = 0x400 - self.tcnt as u32;
                let step = ticks.min(dist as u64) as u16;
                self.tcnt = (self.tcnt + step) & 0x3ff;
                ticks -= step as u64;
                if self.tcnt == 0 {
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
                flags |= self.matches_in(newv as u32, self.tcnt as u32 - 1);
                self.tcnt = newv;
                ticks -= step as u64;
                if self.tcnt == 0 {
                    flags |= FLAG_TOV;
                    self.dbg_ovf_count += 1;
                    self.count_down = false;
                }
            } else {
                let dist = if self.phase_correct() {
                    top - self.tcnt as u32
                } else {
                    top + 1 - self.tcnt as u32
                };
                if dist == 0 {
                    self.count_down = true;
                    continue;
                }
                let step = ticks.min(dist as u64) as u16;
                let newv = self.tcnt as u32 + step as u32;
                flags |= self.matches_in(self.tcnt as u32 + 1, newv);
                self.tcnt = newv as u16;
                ticks -= step as u64;
                if newv == top + 1 {
                    self.tcnt = 0;
                    self.ocr = self.next_ocr;
                    flags |= FLAG_TOV;
                    self.dbg_ovf_count += 1;
                } else if self.phase_correct() && newv == top {
                    self.count_down = true;
                    self.ocr = self.next_ocr;
                }
            }
        }

        data[TCNT4 as usize] = self.tcnt as u8;
        if flags != 0 {
            if flags & FLAG_OCFA != 0 && self.com_a == 1 {
                data[PORTC as usize] ^= 0x80;
            }
            data[TIFR4 as usize] |= flags;
            if data[TIMSK4 as usize] & data[TIFR4 as usize] != 0 {
                sched.schedule(cycle, EventTag::Interrupt);
            }
        }
        self.reschedule(cycle, data, sched);
    }

    fn matches_in(&self, lo: u32, hi: u32) -> u8 {
        let mut f = 0;
        for (n, bit) in [(A, FLAG_OCFA), (B, FLAG_OCFB), (D, FLAG_OCFD)] {
            let v = self.ocr[n] as u32;
            if v >= lo && v <= hi {
                f |= bit;
            }
        }
        f
    }

    fn ticks_to_next_edge(&self) -> u64 {
        let top = self.top();
        if self.tcnt as u32 > top {
            return (0x400 - self.tcnt as u32) as u64;
        }
        if self.phase_correct() && self.count_down {
            return (self.tcnt as u64).max(1);
        }
        let period = top as u64 + 1;
        let mut best = period - self.tcnt as u64;
        for n in [A, B, D] {
            let v = self.ocr[n] as u32;
            if v <= top {
                let d = if v > self.tcnt as u32 {
                    (v - self.tcnt as u32) as u64
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
        let need = self.ticks_to_next_edge() * 12 * self.divider as u64 - self.acc;
        let cycles = (need + self.num12 as u64 - 1) / self.num12 as u64;
        sched.schedule(cycle + cycles.max(1), EventTag::Timer4);
    }

    pub fn check_interrupt(&mut self, data: &mut [u8]) -> Option<u16> {
        let pending = data[TIFR4 as usize] & data[TIMSK4 as usize];
        let (bit, vec) = if pending & FLAG_OCFA != 0 {
            (FLAG_OCFA, INT_TIMER4_COMPA)
        } else if pending & FLAG_OCFB != 0 {
            (FLAG_OCFB, INT_TIMER4_COMPB)
        } else if pending & FLAG_OCFD != 0 {
            (FLAG_OCFD, INT_TIMER4_COMPD)
        } else if pending & FLAG_TOV != 0 {
            (FLAG_TOV, INT_TIMER4_OVF)
        } else {
            return None;
        };
        data[TIFR4 as usize] &= !bit;
        self.dbg_int_fire_count += 1;
        Some(vec)
    }
}

impl Default for Timer4 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Timer4, Vec<u8>, Scheduler) {
        (Timer4::new(), vec![0u8; crate::DATA_SIZE], Scheduler::new())
    }

    #[test]
    fn test_counts_to_ocr4c_top() {
        let (mut t, mut data, mut sched) = setup();
        // top = 199, prescaler /1
        t.write(TC4H, 0, 0, &mut data, &mut sched);
        t.write(OCR4C, 199, 0, &mut data, &mut sched);
        t.write(TCCR4B, 1, 0, &mut data, &mut sched);
        t.update(200, &mut data, &mut sched);
        assert_eq!(data[TIFR4 as usize] & FLAG_TOV, FLAG_TOV);
        assert_eq!(data[TCNT4 as usize], 0);
    }

    #[test]
    fn test_ten_bit_write_through_tc4h() {
        let (mut t, mut data, mut sched) = setup();
        t.write(TC4H, 0x02, 0, &mut data, &mut sched);
        t.write(OCR4C, 0x34, 0, &mut data, &mut sched);
        assert_eq!(t.ocr[C], 0x234);
    }

    #[test]
    fn test_pll_rate_scales_counting() {
        let (mut t, mut data, mut sched) = setup();
        t.write(TC4H, 0x03, 0, &mut data, &mut sched);
        t.write(OCR4C, 0xff, 0, &mut data, &mut sched); // top = 0x3ff
        t.write(TC4H, 0, 0, &mut data, &mut sched);
        t.write(TCCR4B, 1, 0, &mut data, &mut sched);
        // 3 timer ticks per cpu cycle (96 MHz / 2 tap)
        t.set_rate(36, 0, &mut data, &mut sched);
        let v = t.read(TCNT4, 100, &mut data, &mut sched).unwrap();
        assert_eq!(v as u16 | ((t.tc4h as u16) << 8), 300);
    }

    #[test]
    fn test_compare_a_toggles_speaker_pin() {
        let (mut t, mut data, mut sched) = setup();
        t.write(TCCR4A, 0x40, 0, &mut data, &mut sched); // COM4A = toggle
        t.write(TC4H, 0, 0, &mut data, &mut sched);
        t.write(OCR4A, 50, 0, &mut data, &mut sched);
        t.write(OCR4C, 99, 0, &mut data, &mut sched);
        t.write(TCCR4B, 1, 0, &mut data, &mut sched);
        t.update(50, &mut data, &mut sched);
        assert_eq!(data[PORTC as usize] & 0x80, 0x80);
        t.update(150, &mut data, &mut sched);
        assert_eq!(data[PORTC as usize] & 0x80, 0);
    }

    #[test]
    fn test_interrupt_priority() {
        let (mut t, mut data, mut sched) = setup();
        data[TIFR4 as usize] = FLAG_TOV | FLAG_OCFD;
        data[TIMSK4 as usize] = 0xff;
        assert_eq!(t.check_interrupt(&mut data), Some(INT_TIMER4_COMPD));
        assert_eq!(t.check_interrupt(&mut data), Some(INT_TIMER4_OVF));
        assert_eq!(t.check_interrupt(&mut data), None);
        let _ = sched;
    }
}
