//! 16-bit Timer/Counter1 and Timer/Counter3.
//!
//! One model serves both instances; [`Timer16Addrs`] carries the register
//! block base, interrupt vectors, power-reduction gate, and the output
//! compare pin (Timer3's OC3A drives a speaker pin, so toggle mode must
//! really toggle the port bit for the sound sampler to see it).
//!
//! Like Timer0 the counter is advanced in whole elapsed spans, walking
//! edge to edge, and the next flag edge is placed on the scheduler.
//! TCNT reads and writes go through the shared TEMP byte so 16-bit
//! accesses are atomic the way the hardware does them.

use serde::{Deserialize, Serialize};

use crate::peripherals::EventTag;
use crate::sched::Scheduler;

const FLAG_TOV: u8 = 1;
const FLAG_OCFA: u8 = 2;
const FLAG_OCFB: u8 = 4;
const FLAG_OCFC: u8 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer16Addrs {
    /// Register block base (0x80 for Timer1, 0x90 for Timer3)
    pub base: u16,
    pub tifr: u16,
    pub timsk: u16,
    pub int_ovf: u16,
    pub int_compa: u16,
    pub int_compb: u16,
    pub int_compc: u16,
    /// PRR register and bit gating this timer
    pub prr: u16,
    pub prr_mask: u8,
    /// Port register and bit of the OCnA pin; 0 mask = not routed
    pub oc_a_port: u16,
    pub oc_a_mask: u8,
    pub tag: EventTag,
}

impl Timer16Addrs {
    pub fn timer1() -> Self {
        Timer16Addrs {
            base: 0x80,
            tifr: 0x36,
            timsk: 0x6f,
            int_ovf: super::INT_TIMER1_OVF,
            int_compa: super::INT_TIMER1_COMPA,
            int_compb: super::INT_TIMER1_COMPB,
            int_compc: super::INT_TIMER1_COMPC,
            prr: 0x64,
            prr_mask: 1 << 3,
            oc_a_port: 0,
            oc_a_mask: 0,
            tag: EventTag::Timer1,
        }
    }

    pub fn timer3() -> Self {
        Timer16Addrs {
            base: 0x90,
            tifr: 0x38,
            timsk: 0x71,
            int_ovf: super::INT_TIMER3_OVF,
            int_compa: super::INT_TIMER3_COMPA,
            int_compb: super::INT_TIMER3_COMPB,
            int_compc: super::INT_TIMER3_COMPC,
            prr: 0x65,
            prr_mask: 1 << 3,
            // OC3A is the first speaker pin (PC6)
            oc_a_port: 0x28,
            oc_a_mask: 0x40,
            tag: EventTag::Timer3,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Timer16 {
    addrs: Timer16Addrs,
    tick: u64,
    divider: u32,
    divider_cycle: u32,
    wgm: u8,
    com_a: u8,
    com_b: u8,
    com_c: u8,
    ocr: [u16; 3],
    next_ocr: [u16; 3],
    icr: u16,
    tcnt: u32,
    count_down: bool,
    /// Shared high-byte latch for 16-bit register access
    temp: u8,
    pub dbg_ovf_count: u32,
    pub dbg_int_fire_count: u32,
}

impl Timer16 {
    pub fn new(addrs: Timer16Addrs) -> Self {
        Timer16 {
            addrs,
            tick: 0,
            divider: 0,
            divider_cycle: 0,
            wgm: 0,
            com_a: 0,
            com_b: 0,
            com_c: 0,
            ocr: [0; 3],
            next_ocr: [0; 3],
            icr: 0,
            tcnt: 0,
            count_down: false,
            temp: 0,
            dbg_ovf_count: 0,
            dbg_int_fire_count: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Timer16::new(self.addrs.clone());
    }

    fn pwm(&self) -> bool {
        !matches!(self.wgm, 0 | 4 | 12 | 13)
    }

    fn phase_correct(&self) -> bool {
        matches!(self.wgm, 1 | 2 | 3 | 8 | 9 | 10 | 11)
    }

    fn top(&self) -> u32 {
        let t = match self.wgm {
            1 | 5 => 0xff,
            2 | 6 => 0x1ff,
            3 | 7 => 0x3ff,
            4 => self.ocr[0] as u32,
            8 | 10 | 12 | 14 => self.icr as u32,
            9 | 11 | 15 => self.ocr[0] as u32,
            _ => 0xffff,
        };
        if self.pwm() {
            t.max(3)
        } else {
            t
        }
    }

    fn stopped(&self, data: &[u8]) -> bool {
        self.divider == 0 || data[self.addrs.prr as usize] & self.addrs.prr_mask != 0
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        let a = self.addrs.clone();
        if addr == a.tifr {
            self.update(cycle, data, sched);
            data[a.tifr as usize] &= !value;
            return true;
        }
        if addr == a.timsk {
            data[addr as usize] = value;
            if data[a.tifr as usize] & value & 0x0f != 0 {
                sched.schedule(cycle, EventTag::Interrupt);
            }
            return true;
        }
        let off = addr.wrapping_sub(a.base);
        if off > 0x0d {
            return false;
        }
        self.update(cycle, data, sched);
        match off {
            0x0 => {
                // TCCRnA
                self.com_a = (value >> 6) & 3;
                self.com_b = (value >> 4) & 3;
                self.com_c = (value >> 2) & 3;
                self.wgm = (self.wgm & 0x0c) | (value & 3);
            }
            0x1 => {
                // TCCRnB
                self.wgm = (self.wgm & 3) | ((value >> 1) & 0x0c);
                let div = match value & 7 {
                    1 => 1,
                    2 => 8,
                    3 => 64,
                    4 => 256,
                    5 => 1024,
                    _ => 0,
                };
                if div != self.divider {
                    self.divider = div;
                    self.divider_cycle = 0;
                    self.tick = cycle;
                }
            }
            0x2 => {} // TCCRnC force-output-compare, not modeled
            0x4 => self.tcnt = ((self.temp as u32) << 8) | value as u32,
            0x5 => {
                self.temp = value;
                data[addr as usize] = value;
                return true;
            }
            0x6 => self.icr = (self.icr & 0xff00) | value as u16,
            0x7 => self.icr = (self.icr & 0x00ff) | ((value as u16) << 8),
            0x8 | 0xa | 0xc => {
                let n = ((off - 8) / 2) as usize;
                let v = (self.next_ocr[n] & 0xff00) | value as u16;
                self.next_ocr[n] = v;
                if !self.pwm() {
                    self.ocr[n] = v;
                }
            }
            0x9 | 0xb | 0xd => {
                let n = ((off - 9) / 2) as usize;
                let v = (self.next_ocr[n] & 0x00ff) | ((value as u16) << 8);
                self.next_ocr[n] = v;
                if !self.pwm() {
                    self.ocr[n] = v;
                }
            }
            _ => return false,
        }
        data[addr as usize] = value;
        self.reschedule(cycle, data, sched);
        true
    }

    pub fn read(
        &mut self,
        addr: u16,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> Option<u8> {
        let a = self.addrs.clone();
        if addr == a.tifr {
            self.update(cycle, data, sched);
            return Some(data[addr as usize]);
        }
        let off = addr.wrapping_sub(a.base);
        match off {
            0x4 => {
                // TCNTnL read latches the high byte
                self.update(cycle, data, sched);
                self.temp = (self.tcnt >> 8) as u8;
                Some(self.tcnt as u8)
            }
            0x5 => Some(self.temp),
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
        let total = elapsed + self.divider_cycle as u64;
        let mut ticks = total / self.divider as u64;
        self.divider_cycle = (total % self.divider as u64) as u32;

        let mut flags = 0u8;
        while ticks > 0 {
            let top = self.top();
            if self.tcnt > top {
                let dist = 0x1_0000 - self.tcnt;
                let step = ticks.min(dist as u64) as u32;
                self.tcnt += step;
                ticks -= step as u64;
                if self.tcnt == 0x1_0000 {
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
                let step = ticks.min(self.tcnt as u64) as u32;
                let newv = self.tcnt - step;
                flags |= self.matches_in(newv, self.tcnt.wrapping_sub(1), true);
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
                let step = ticks.min(dist as u64) as u32;
                let newv = self.tcnt + step;
                flags |= self.matches_in(self.tcnt + 1, newv, false);
                self.tcnt = newv;
                ticks -= step as u64;
                if self.tcnt == top + 1 {
                    self.tcnt = 0;
                    if self.pwm() {
                        self.ocr = self.next_ocr;
                    }
                    if self.wgm != 4 && self.wgm != 12 {
                        flags |= FLAG_TOV;
                        self.dbg_ovf_count += 1;
                    } else if top == 0xffff {
                        flags |= FLAG_TOV;
                    }
                } else if self.phase_correct() && self.tcnt == top {
                    self.count_down = true;
                    if self.pwm() {
                        self.ocr = self.next_ocr;
                    }
                }
            }
        }

        data[(self.addrs.base + 4) as usize] = self.tcnt as u8;
        data[(self.addrs.base + 5) as usize] = (self.tcnt >> 8) as u8;

        if flags != 0 {
            if flags & FLAG_OCFA != 0 && self.com_a == 1 && self.addrs.oc_a_mask != 0 {
                // toggle OCnA output pin on compare match
                data[self.addrs.oc_a_port as usize] ^= self.addrs.oc_a_mask;
            }
            data[self.addrs.tifr as usize] |= flags;
            if data[self.addrs.timsk as usize] & data[self.addrs.tifr as usize] & 0x0f != 0 {
                sched.schedule(cycle, EventTag::Interrupt);
            }
        }
        self.reschedule(cycle, data, sched);
    }

    /// Flag bits for compare values hit in the inclusive counter range.
    fn matches_in(&self, lo: u32, hi: u32, _down: bool) -> u8 {
        let mut f = 0;
        for (n, bit) in [(0, FLAG_OCFA), (1, FLAG_OCFB), (2, FLAG_OCFC)] {
            let v = self.ocr[n] as u32;
            if v >= lo && v <= hi {
                f |= bit;
            }
        }
        f
    }

    fn ticks_to_next_edge(&self) -> u64 {
        let top = self.top();
        if self.tcnt > top {
            return (0x1_0000 - self.tcnt) as u64;
        }
        if self.phase_correct() && self.count_down {
            return (self.tcnt as u64).max(1);
        }
        let period = top as u64 + 1;
        let mut best = period - self.tcnt as u64;
        for n in 0..3 {
            let v = self.ocr[n] as u32;
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
        let cycles = self.ticks_to_next_edge() * self.divider as u64 - self.divider_cycle as u64;
        sched.schedule(cycle + cycles.max(1), self.addrs.tag);
    }

    pub fn check_interrupt(&mut self, data: &mut [u8]) -> Option<u16> {
        let a = &self.addrs;
        let pending = data[a.tifr as usize] & data[a.timsk as usize];
        let (bit, vec) = if pending & FLAG_OCFA != 0 {
            (FLAG_OCFA, a.int_compa)
        } else if pending & FLAG_OCFB != 0 {
            (FLAG_OCFB, a.int_compb)
        } else if pending & FLAG_OCFC != 0 {
            (FLAG_OCFC, a.int_compc)
        } else if pending & FLAG_TOV != 0 {
            (FLAG_TOV, a.int_ovf)
        } else {
            return None;
        };
        data[a.tifr as usize] &= !bit;
        self.dbg_int_fire_count += 1;
        Some(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Timer16, Vec<u8>, Scheduler) {
        (
            Timer16::new(Timer16Addrs::timer3()),
            vec![0u8; crate::DATA_SIZE],
            Scheduler::new(),
        )
    }

    #[test]
    fn test_ctc_tone_toggles_speaker_pin() {
        let (mut t, mut data, mut sched) = setup();
        // CTC on OCR3A, toggle OC3A, prescaler /1, top 999
        t.write(0x90, 0x40, 0, &mut data, &mut sched); // TCCR3A: COM3A=toggle
        t.write(0x99, 0x03, 0, &mut data, &mut sched); // OCR3AH
        t.write(0x98, 0xe7, 0, &mut data, &mut sched); // OCR3AL -> 999
        t.write(0x91, 0x09, 0, &mut data, &mut sched); // TCCR3B: WGM=4, cs=1
        assert_eq!(data[0x28], 0);
        t.update(999, &mut data, &mut sched);
        assert_eq!(data[0x28] & 0x40, 0x40);
        t.update(1999, &mut data, &mut sched);
        assert_eq!(data[0x28] & 0x40, 0);
    }

    #[test]
    fn test_tcnt_word_read_through_temp() {
        let (mut t, mut data, mut sched) = setup();
        t.write(0x91, 0x01, 0, &mut data, &mut sched); // cs=1, normal
        let lo = t.read(0x94, 0x1234, &mut data, &mut sched).unwrap();
        let hi = t.read(0x95, 0x1234, &mut data, &mut sched).unwrap();
        assert_eq!(((hi as u16) << 8) | lo as u16, 0x1234);
    }

    #[test]
    fn test_tcnt_word_write_through_temp() {
        let (mut t, mut data, mut sched) = setup();
        t.write(0x95, 0x12, 0, &mut data, &mut sched); // TCNT3H -> temp
        t.write(0x94, 0x34, 0, &mut data, &mut sched); // TCNT3L commits
        assert_eq!(t.tcnt, 0x1234);
    }

    #[test]
    fn test_normal_mode_overflow_flag() {
        let (mut t, mut data, mut sched) = setup();
        t.write(0x91, 0x01, 0, &mut data, &mut sched);
        t.update(0x10000, &mut data, &mut sched);
        assert_eq!(data[0x38] & FLAG_TOV, FLAG_TOV);
        assert_eq!(data[0x94], 0);
        assert_eq!(data[0x95], 0);
    }

    #[test]
    fn test_scheduled_edge_is_exact() {
        let (mut t, mut data, mut sched) = setup();
        t.write(0x99, 0x00, 0, &mut data, &mut sched);
        t.write(0x98, 100, 0, &mut data, &mut sched);
        t.write(0x91, 0x0a, 0, &mut data, &mut sched); // CTC, /8
        let (due, tag) = sched.next().unwrap();
        assert_eq!(tag, EventTag::Timer3);
        assert_eq!(due, 800);
        t.update(due, &mut data, &mut sched);
        assert_eq!(data[0x38] & FLAG_OCFA, FLAG_OCFA);
    }

    #[test]
    fn test_check_interrupt_priority() {
        let (mut t, mut data, mut sched) = setup();
        data[0x38] = FLAG_TOV | FLAG_OCFB;
        data[0x71] = 0x0f;
        assert_eq!(t.check_interrupt(&mut data), Some(super::super::INT_TIMER3_COMPB));
        assert_eq!(t.check_interrupt(&mut data), Some(super::super::INT_TIMER3_OVF));
        assert_eq!(t.check_interrupt(&mut data), None);
        let _ = sched;
    }
}
