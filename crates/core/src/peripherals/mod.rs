//! ATmega32u4 peripheral models.
//!
//! - [`Timer8`] — 8-bit Timer/Counter0 (frame timing, millis())
//! - [`Timer16`] — 16-bit Timer/Counter1 and Timer/Counter3 (tones)
//! - [`Timer4`] — 10-bit high-speed Timer/Counter4 (PWM audio, LEDs)
//! - [`Spi`] — SPI master (display and external flash traffic)
//! - [`Adc`] — analog-to-digital converter (random seed, battery sense)
//! - [`Pll`] — PLL frequency synthesizer (USB clock, Timer4 fast clock)
//! - [`EepromCtrl`] — EEPROM programming controller (save data)
//! - [`Watchdog`] — watchdog timer (interrupt and reset modes)
//! - [`Usb`] — USB device controller, scripted enumeration only
//! - [`Sound`] — speaker-pin sampler producing a mono sample stream
//! - [`FxFlash`] — W25Q128 16 MB external SPI flash
//!
//! Every model is passive between register accesses: a write recomputes
//! the model's next due cycle and schedules it under the model's
//! [`EventTag`]; the engine calls back into the model when that cycle
//! arrives. None of them tick per instruction.

use serde::{Deserialize, Serialize};

mod adc;
mod eeprom;
pub mod fx_flash;
mod pll;
mod sound;
mod spi;
mod timer16;
mod timer4;
mod timer8;
mod usb;
mod watchdog;

pub use adc::Adc;
pub use eeprom::EepromCtrl;
pub use fx_flash::FxFlash;
pub use pll::Pll;
pub use sound::Sound;
pub use spi::Spi;
pub use timer16::{Timer16, Timer16Addrs};
pub use timer4::Timer4;
pub use timer8::Timer8;
pub use usb::Usb;
pub use watchdog::Watchdog;

/// Identity of a scheduled peripheral event. The scheduler holds at most
/// one live entry per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(usize)]
pub enum EventTag {
    Timer0,
    Timer1,
    Timer3,
    Timer4,
    Spi,
    Eeprom,
    Adc,
    Pll,
    Watchdog,
    Usb,
    /// Interrupt-check request armed by flag-raising events and by I-bit
    /// 0-to-1 edges. Checking only on this event keeps the dispatcher off
    /// the per-instruction path.
    Interrupt,
}

impl EventTag {
    pub const COUNT: usize = 11;

    pub fn from_index(i: usize) -> EventTag {
        match i {
            0 => EventTag::Timer0,
            1 => EventTag::Timer1,
            2 => EventTag::Timer3,
            3 => EventTag::Timer4,
            4 => EventTag::Spi,
            5 => EventTag::Eeprom,
            6 => EventTag::Adc,
            7 => EventTag::Pll,
            8 => EventTag::Watchdog,
            9 => EventTag::Usb,
            _ => EventTag::Interrupt,
        }
    }
}

// ATmega32u4 interrupt vector addresses (word addresses from the
// datasheet; do NOT divide by 2).
pub const INT_USB_GEN: u16 = 0x0014;
pub const INT_USB_EP: u16 = 0x0016;
pub const INT_WDT: u16 = 0x0018;
pub const INT_TIMER1_COMPA: u16 = 0x0022;
pub const INT_TIMER1_COMPB: u16 = 0x0024;
pub const INT_TIMER1_COMPC: u16 = 0x0026;
pub const INT_TIMER1_OVF: u16 = 0x0028;
pub const INT_TIMER0_COMPA: u16 = 0x002A;
pub const INT_TIMER0_COMPB: u16 = 0x002C;
pub const INT_TIMER0_OVF: u16 = 0x002E;
pub const INT_SPI: u16 = 0x0030;
pub const INT_ADC: u16 = 0x003A;
pub const INT_TIMER3_COMPA: u16 = 0x0040;
pub const INT_TIMER3_COMPB: u16 = 0x0042;
pub const INT_TIMER3_COMPC: u16 = 0x0044;
pub const INT_TIMER3_OVF: u16 = 0x0046;
pub const INT_TIMER4_COMPA: u16 = 0x004C;
pub const INT_TIMER4_COMPB: u16 = 0x004E;
pub const INT_TIMER4_COMPD: u16 = 0x0050;
pub const INT_TIMER4_OVF: u16 = 0x0052;
