//! Analog-to-digital converter.
//!
//! A conversion takes 13 ADC clocks at the prescaler from ADPS (minimum
//! divider 2), so `analogRead()` costs the same ~100 us it costs on
//! hardware. Results are pseudo-random 10-bit values from an xorshift
//! generator; floating-pin noise is what games actually harvest from the
//! ADC for random seeding.

use serde::{Deserialize, Serialize};

use crate::peripherals::{EventTag, INT_ADC};
use crate::sched::Scheduler;

pub const ADCL: u16 = 0x78;
pub const ADCH: u16 = 0x79;
pub const ADCSRA: u16 = 0x7a;
pub const ADCSRB: u16 = 0x7b;
pub const ADMUX: u16 = 0x7c;

const PRR0: u16 = 0x64;
const PRADC: u8 = 1;

const ADEN: u8 = 0x80;
const ADSC: u8 = 0x40;
const ADIF: u8 = 0x10;
const ADIE: u8 = 0x08;

#[derive(Clone, Serialize, Deserialize)]
pub struct Adc {
    rng: u32,
    converting: bool,
    done_at: u64,
    pub dbg_conversion_count: u32,
}

impl Adc {
    pub fn new() -> Self {
        Adc {
            rng: 0xcafebabe,
            converting: false,
            done_at: 0,
            dbg_conversion_count: 0,
        }
    }

    pub fn reset(&mut self) {
        let rng = self.rng;
        *self = Adc::new();
        // keep the noise stream running across resets
        self.rng = rng;
    }

    fn sample(&mut self) -> u16 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        (self.rng & 0x3ff) as u16
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
            ADMUX | ADCSRB => {
                data[addr as usize] = value;
                true
            }
            ADCSRA => {
                let mut v = value;
                // ADIF is write-1-to-clear
                if value & ADIF != 0 {
                    v &= !ADIF;
                } else {
                    v |= data[ADCSRA as usize] & ADIF;
                }
                if value & ADEN != 0
                    && value & ADSC != 0
                    && !self.converting
                    && data[PRR0 as usize] & PRADC == 0
                {
                    let div = 1u64 << (value & 7).max(1);
                    self.converting = true;
                    self.done_at = cycle + 13 * div;
                    sched.schedule(self.done_at, EventTag::Adc);
                } else if value & ADEN == 0 {
                    self.converting = false;
                }
                data[ADCSRA as usize] = v;
                true
            }
            _ => false,
        }
    }

    pub fn read(&mut self, addr: u16, data: &[u8]) -> Option<u8> {
        match addr {
            ADCSRA => {
                let mut v = data[ADCSRA as usize];
                if self.converting {
                    v |= ADSC;
                } else {
                    v &= !ADSC;
                }
                Some(v)
            }
            ADCL | ADCH => Some(data[addr as usize]),
            _ => None,
        }
    }

    /// Scheduled-event entry point: complete a due conversion.
    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        if !self.converting {
            return;
        }
        if cycle < self.done_at {
            sched.schedule(self.done_at, EventTag::Adc);
            return;
        }
        self.converting = false;
        self.dbg_conversion_count += 1;
        let result = self.sample();
        if data[ADMUX as usize] & 0x20 != 0 {
            // ADLAR: left-adjusted
            let v = result << 6;
            data[ADCL as usize] = v as u8;
            data[ADCH as usize] = (v >> 8) as u8;
        } else {
            data[ADCL as usize] = result as u8;
            data[ADCH as usize] = (result >> 8) as u8;
        }
        data[ADCSRA as usize] |= ADIF;
        if data[ADCSRA as usize] & ADIE != 0 {
            sched.schedule(cycle, EventTag::Interrupt);
        }
    }

    pub fn check_interrupt(&mut self, data: &mut [u8]) -> Option<u16> {
        let v = data[ADCSRA as usize];
        if v & ADIF != 0 && v & ADIE != 0 {
            data[ADCSRA as usize] &= !ADIF;
            Some(INT_ADC)
        } else {
            None
        }
    }
}

impl Default for Adc {
    fn default() -> Self {
        Self::new()
    }
}
