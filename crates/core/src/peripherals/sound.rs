//! Speaker sampler.
//!
//! The speaker sits across PC6 (OC3A) and PC7 (OC4A); the timers toggle
//! those port bits on compare match and this sampler turns the pin pair
//! into a mono sample stream. One sample is taken per fixed cycle
//! window (about 44.1 kHz of simulated time). Pins only contribute while
//! DDRC has them set as outputs, and the two pins drive opposite speaker
//! terminals, so driving both gives silence and alternating them doubles
//! the swing.

use serde::{Deserialize, Serialize};

const PORTC: u16 = 0x28;
const DDRC: u16 = 0x27;

/// Cycles per audio sample (16 MHz / 363 = 44.08 kHz).
pub const SOUND_CYCLES: u64 = 363;

const SOUND_GAIN: i16 = 1000;

/// Cap on buffered samples when no host is draining them (about 2 s).
const MAX_BUFFERED: usize = 88200;

#[derive(Clone, Serialize, Deserialize)]
pub struct Sound {
    /// Cycle at which the current sample window started
    window_start: u64,
    #[serde(skip)]
    samples: Vec<i16>,
}

impl Sound {
    pub fn new() -> Self {
        Sound {
            window_start: 0,
            samples: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Sound::new();
    }

    fn level(data: &[u8]) -> i16 {
        let driven = data[DDRC as usize];
        let pins = data[PORTC as usize] & driven;
        let mut lvl = 0;
        if driven & 0x40 != 0 {
            lvl += if pins & 0x40 != 0 { SOUND_GAIN } else { -SOUND_GAIN };
        }
        if driven & 0x80 != 0 {
            // opposite terminal
            lvl += if pins & 0x80 != 0 { -SOUND_GAIN } else { SOUND_GAIN };
        }
        lvl
    }

    /// Advance to `cycle`, emitting one sample per completed window.
    pub fn update(&mut self, cycle: u64, data: &[u8]) {
        while cycle.wrapping_sub(self.window_start) >= SOUND_CYCLES {
            self.window_start += SOUND_CYCLES;
            if self.samples.len() < MAX_BUFFERED {
                self.samples.push(Self::level(data));
            }
        }
    }

    /// Take everything sampled so far.
    pub fn drain_samples(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.samples)
    }

    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }
}

impl Default for Sound {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate() {
        let mut s = Sound::new();
        let data = vec![0u8; crate::DATA_SIZE];
        s.update(SOUND_CYCLES * 10, &data);
        assert_eq!(s.pending_samples(), 10);
    }

    #[test]
    fn test_undriven_pins_are_silent() {
        let mut s = Sound::new();
        let mut data = vec![0u8; crate::DATA_SIZE];
        data[PORTC as usize] = 0xc0; // pins high but DDRC inputs
        s.update(SOUND_CYCLES, &data);
        assert_eq!(s.drain_samples(), vec![0]);
    }

    #[test]
    fn test_differential_drive() {
        let mut s = Sound::new();
        let mut data = vec![0u8; crate::DATA_SIZE];
        data[DDRC as usize] = 0xc0;
        data[PORTC as usize] = 0x40; // pin6 high, pin7 low
        s.update(SOUND_CYCLES, &data);
        assert_eq!(s.drain_samples(), vec![2 * SOUND_GAIN]);
        // both high cancels out
        data[PORTC as usize] = 0xc0;
        s.update(SOUND_CYCLES * 2, &data);
        assert_eq!(s.drain_samples(), vec![0]);
    }
}
