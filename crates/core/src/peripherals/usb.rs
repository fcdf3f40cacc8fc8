//! USB device controller.
//!
//! There is no host stack here: the controller plays a fixed enumeration
//! script convincing enough for the stock Arduino core. Enabling the
//! controller raises VBUS detection immediately, an end-of-reset
//! interrupt 3 ms later, and a SET_CONFIGURATION setup packet on
//! endpoint 0; a CDC SET_LINE_CODING class request follows 1 ms after
//! that. While attached, a start-of-frame interrupt ticks every 1 ms.
//! Bytes the firmware pushes into an IN endpoint via UEDATX are captured
//! as the serial output stream.
//!
//! The endpoint registers are banked: UENUM selects which endpoint's
//! register file is visible at 0xE8..0xF3, and writing UENUM swaps the
//! whole window the way the hardware does.

use serde::{Deserialize, Serialize};

use crate::peripherals::{EventTag, INT_USB_EP, INT_USB_GEN};
use crate::sched::Scheduler;

pub const USBCON: u16 = 0xd8;
pub const USBINT: u16 = 0xda;
pub const UDCON: u16 = 0xe0;
pub const UDINT: u16 = 0xe1;
pub const UDIEN: u16 = 0xe2;
pub const UEINTX: u16 = 0xe8;
pub const UENUM: u16 = 0xe9;
pub const UERST: u16 = 0xea;
pub const UECONX: u16 = 0xeb;
pub const UECFG0X: u16 = 0xec;
pub const UECFG1X: u16 = 0xed;
pub const UESTA0X: u16 = 0xee;
pub const UESTA1X: u16 = 0xef;
pub const UEIENX: u16 = 0xf0;
pub const UEDATX: u16 = 0xf1;
pub const UEBCLX: u16 = 0xf2;
pub const UEBCHX: u16 = 0xf3;
pub const UEINT: u16 = 0xf4;

const RXSTPI: u8 = 1 << 3;
const RWAL: u8 = 1 << 5;
const SOFI: u8 = 1 << 2;
const EORSTI: u8 = 1 << 3;

// one USB frame at 16 MHz
const FRAME_CYCLES: u64 = 16000;
const RESET_CYCLES: u64 = 48000;

#[derive(Clone, Default, Serialize, Deserialize)]
struct Endpoint {
    ueintx: u8,
    uerst: u8,
    ueconx: u8,
    uecfg0x: u8,
    uecfg1x: u8,
    uesta0x: u8,
    uesta1x: u8,
    ueienx: u8,
    uebclx: u8,
    uebchx: u8,
    start: usize,
    length: usize,
    buffer: Vec<u8>,
}

impl Endpoint {
    fn configure(&mut self) {
        let size = 8usize << ((self.uecfg1x >> 4) & 7);
        if self.uecfg1x & 0x02 != 0 {
            self.start = 0;
            self.length = 0;
            self.buffer = vec![0; size];
        }
    }

    fn read_byte(&mut self) -> u8 {
        if self.buffer.is_empty() || self.length == 0 {
            self.uesta0x = 1 << 5; // underflow
            return 0;
        }
        let r = self.buffer[self.start];
        self.start = (self.start + 1) % self.buffer.len();
        self.length -= 1;
        self.uebclx = self.length as u8;
        self.uebchx = (self.length >> 8) as u8;
        r
    }

    fn write_byte(&mut self, x: u8) {
        if self.length >= self.buffer.len() {
            self.uesta0x = 1 << 6; // overflow
            return;
        }
        let i = (self.start + self.length) % self.buffer.len();
        self.buffer[i] = x;
        self.length += 1;
        self.uebclx = self.length as u8;
        self.uebchx = (self.length >> 8) as u8;
    }

    /// Mirror this endpoint's register file into the banked window.
    fn expose(&self, data: &mut [u8]) {
        let rwal = self.length < self.buffer.len();
        let mut ueintx = self.ueintx;
        if rwal {
            ueintx |= RWAL;
        } else {
            ueintx &= !RWAL;
        }
        data[UEINTX as usize] = ueintx;
        data[UERST as usize] = self.uerst;
        data[UECONX as usize] = self.ueconx;
        data[UECFG0X as usize] = self.uecfg0x;
        data[UECFG1X as usize] = self.uecfg1x;
        data[UESTA0X as usize] = self.uesta0x;
        data[UESTA1X as usize] = self.uesta1x;
        data[UEIENX as usize] = self.ueienx;
        data[UEBCLX as usize] = self.uebclx;
        data[UEBCHX as usize] = self.uebchx;
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Usb {
    ep: Vec<Endpoint>,
    attached: bool,
    next_eorsti: u64,
    next_sofi: u64,
    next_setconf: u64,
    next_setlength: u64,
    /// Bytes the firmware wrote to UEDATX (CDC serial output)
    pub serial_bytes: Vec<u8>,
}

impl Usb {
    pub fn new() -> Self {
        Usb {
            ep: vec![Endpoint::default(); 7],
            attached: false,
            next_eorsti: u64::MAX,
            next_sofi: u64::MAX,
            next_setconf: u64::MAX,
            next_setlength: u64::MAX,
            serial_bytes: Vec::new(),
        }
    }

    pub fn reset(&mut self, data: &mut [u8]) {
        let serial = std::mem::take(&mut self.serial_bytes);
        *self = Usb::new();
        self.serial_bytes = serial;
        // detached, clock frozen
        data[UDCON as usize] = 0x01;
        data[USBCON as usize] = 1 << 5;
    }

    fn reschedule(&self, sched: &mut Scheduler) {
        let c = self
            .next_eorsti
            .min(self.next_sofi)
            .min(self.next_setconf)
            .min(self.next_setlength);
        if c != u64::MAX {
            sched.schedule(c, EventTag::Usb);
        }
    }

    fn selected(&self, data: &[u8]) -> usize {
        (data[UENUM as usize] & 7) as usize
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u64,
        data: &mut [u8],
        sched: &mut Scheduler,
    ) -> bool {
        if !(0xd7..=0xf4).contains(&addr) {
            return false;
        }
        let n = self.selected(data);
        match addr {
            UENUM => {
                // bank out the old endpoint, bank in the new one
                let ep = &mut self.ep[n];
                ep.ueintx = data[UEINTX as usize];
                ep.uerst = data[UERST as usize];
                ep.ueconx = data[UECONX as usize];
                ep.uecfg0x = data[UECFG0X as usize];
                ep.uecfg1x = data[UECFG1X as usize];
                ep.uesta0x = data[UESTA0X as usize];
                ep.uesta1x = data[UESTA1X as usize];
                ep.ueienx = data[UEIENX as usize];
                ep.uebclx = data[UEBCLX as usize];
                ep.uebchx = data[UEBCHX as usize];
                let v = value & 7;
                data[UENUM as usize] = v;
                self.ep[v as usize].expose(data);
            }
            UEDATX => {
                self.serial_bytes.push(value);
                data[UEDATX as usize] = value;
            }
            UEBCLX | UEBCHX => {} // read only
            UEIENX => {
                self.ep[n].ueienx = value;
                data[addr as usize] = value;
            }
            UESTA0X => {
                self.ep[n].uesta0x = value;
                data[addr as usize] = value;
            }
            UESTA1X => {
                self.ep[n].uesta1x = value;
                data[addr as usize] = value;
            }
            UECONX => {
                self.ep[n].ueconx = value;
                data[addr as usize] = value;
            }
            UERST => {
                self.ep[n].uerst = value;
                data[addr as usize] = value;
            }
            UECFG0X => {
                self.ep[n].uecfg0x = value;
                data[addr as usize] = value;
            }
            UECFG1X => {
                self.ep[n].uecfg1x = value;
                self.ep[n].configure();
                data[addr as usize] = value;
                self.ep[n].expose(data);
            }
            UEINTX => {
                // writing zeros clears; ones leave bits alone
                self.ep[n].ueintx &= value;
                data[UEINTX as usize] = self.ep[n].ueintx;
            }
            USBCON => {
                if value & 0x80 != 0 && data[USBCON as usize] & 0x80 == 0 {
                    self.next_eorsti = cycle + RESET_CYCLES;
                    data[USBINT as usize] = 0x01;
                }
                if value & 0x80 != 0 {
                    self.next_setconf = cycle + FRAME_CYCLES;
                    data[addr as usize] = value;
                } else {
                    self.reset(data);
                }
                self.reschedule(sched);
            }
            UDCON => {
                if data[UDCON as usize] & 1 != 0 && value & 1 == 0 {
                    self.next_sofi = cycle + FRAME_CYCLES;
                }
                if value & 1 != 0 {
                    self.next_sofi = u64::MAX;
                }
                self.attached = value & 1 == 0;
                data[addr as usize] = value;
                self.reschedule(sched);
            }
            UDIEN => {
                data[addr as usize] = value;
                if data[UDINT as usize] & value != 0 {
                    sched.schedule(cycle, EventTag::Interrupt);
                }
            }
            _ => data[addr as usize] = value,
        }
        true
    }

    pub fn read(&mut self, addr: u16, data: &mut [u8]) -> Option<u8> {
        if addr == UEDATX {
            let n = self.selected(data);
            let v = self.ep[n].read_byte();
            data[UEDATX as usize] = v;
            self.ep[n].expose(data);
            return Some(v);
        }
        None
    }

    fn deliver_setup(&mut self, packet: &[u8], data: &mut [u8]) {
        for &x in packet {
            self.ep[0].write_byte(x);
        }
        self.ep[0].ueintx |= RXSTPI;
        if self.selected(data) == 0 {
            self.ep[0].expose(data);
        }
    }

    /// Scheduled-event entry point: run every script step that is due.
    pub fn update(&mut self, cycle: u64, data: &mut [u8], sched: &mut Scheduler) {
        while cycle >= self.next_sofi {
            data[UDINT as usize] |= SOFI;
            self.next_sofi += FRAME_CYCLES;
        }
        if cycle >= self.next_eorsti {
            data[UDINT as usize] |= EORSTI;
            self.next_eorsti = u64::MAX;
        }
        if cycle >= self.next_setconf {
            self.deliver_setup(&[0, 9, 1, 0, 0, 0, 0, 0], data); // SET_CONFIGURATION
            self.next_setconf = u64::MAX;
            self.next_setlength = cycle + FRAME_CYCLES;
        }
        if cycle >= self.next_setlength {
            self.deliver_setup(&[0x21, 0x22, 3, 0, 0, 0, 0, 64], data); // CDC SET_CONTROL_LINE_STATE
            self.next_setlength = u64::MAX;
        }
        // aggregate per-endpoint interrupt bits
        let mut i = 0u8;
        for n in 0..7 {
            let ep = if n == self.selected(data) {
                // the banked window is the live copy for the selected one
                data[UEINTX as usize] & data[UEIENX as usize]
            } else {
                self.ep[n].ueintx & self.ep[n].ueienx
            };
            if ep != 0 {
                i |= 1 << n;
            }
        }
        data[UEINT as usize] = i;
        if data[UDINT as usize] & data[UDIEN as usize] != 0 || i != 0 {
            sched.schedule(cycle, EventTag::Interrupt);
        }
        self.reschedule(sched);
    }

    /// Device-level interrupt (SOF, end of reset): clears the taken bit.
    pub fn check_interrupt_general(&mut self, data: &mut [u8]) -> Option<u16> {
        let pending = data[UDINT as usize] & data[UDIEN as usize];
        if pending == 0 {
            return None;
        }
        let bit = pending & pending.wrapping_neg();
        data[UDINT as usize] &= !bit;
        Some(INT_USB_GEN)
    }

    /// Endpoint interrupt: level-triggered, firmware clears via UEINTX.
    pub fn check_interrupt_endpoint(&self, data: &[u8]) -> Option<u16> {
        if data[UEINT as usize] != 0 {
            Some(INT_USB_EP)
        } else {
            None
        }
    }
}

impl Default for Usb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Usb, Vec<u8>, Scheduler) {
        (Usb::new(), vec![0u8; crate::DATA_SIZE], Scheduler::new())
    }

    fn configure_ep0(u: &mut Usb, data: &mut Vec<u8>, sched: &mut Scheduler) {
        u.write(UENUM, 0, 0, data, sched);
        u.write(UECFG1X, 0x32, 0, data, sched); // 64 bytes, allocated
    }

    #[test]
    fn test_enable_schedules_reset_and_setup() {
        let (mut u, mut data, mut sched) = setup();
        configure_ep0(&mut u, &mut data, &mut sched);
        u.write(USBCON, 0x80, 1000, &mut data, &mut sched);
        assert_eq!(data[USBINT as usize], 1);
        // setup packet lands one frame after enable
        u.update(1000 + 16000, &mut data, &mut sched);
        assert_eq!(data[UEINTX as usize] & RXSTPI, RXSTPI);
        // end of reset 3 ms after enable
        assert_eq!(data[UDINT as usize] & EORSTI, 0);
        u.update(1000 + 48000, &mut data, &mut sched);
        assert_eq!(data[UDINT as usize] & EORSTI, EORSTI);
    }

    #[test]
    fn test_setup_packet_contents() {
        let (mut u, mut data, mut sched) = setup();
        configure_ep0(&mut u, &mut data, &mut sched);
        u.write(USBCON, 0x80, 0, &mut data, &mut sched);
        u.update(16000, &mut data, &mut sched);
        let mut pkt = Vec::new();
        for _ in 0..8 {
            pkt.push(u.read(UEDATX, &mut data).unwrap());
        }
        assert_eq!(pkt, [0, 9, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_sof_ticks_once_attached() {
        let (mut u, mut data, mut sched) = setup();
        data[UDCON as usize] = 1; // detached
        u.write(UDCON, 0, 0, &mut data, &mut sched); // attach
        u.update(16000 * 3, &mut data, &mut sched);
        assert_eq!(data[UDINT as usize] & SOFI, SOFI);
    }

    #[test]
    fn test_uedatx_write_captures_serial() {
        let (mut u, mut data, mut sched) = setup();
        for b in b"hi" {
            u.write(UEDATX, *b, 0, &mut data, &mut sched);
        }
        assert_eq!(u.serial_bytes, b"hi");
    }

    #[test]
    fn test_ueintx_write_is_and_clear() {
        let (mut u, mut data, mut sched) = setup();
        configure_ep0(&mut u, &mut data, &mut sched);
        u.ep[0].ueintx = 0x0f;
        u.ep[0].expose(&mut data);
        u.write(UEINTX, !RXSTPI, 0, &mut data, &mut sched);
        assert_eq!(u.ep[0].ueintx & RXSTPI, 0);
        assert_eq!(u.ep[0].ueintx & 0x07, 0x07);
    }

    #[test]
    fn test_endpoint_banking() {
        let (mut u, mut data, mut sched) = setup();
        u.write(UENUM, 0, 0, &mut data, &mut sched);
        u.write(UECFG0X, 0xaa, 0, &mut data, &mut sched);
        u.write(UENUM, 1, 0, &mut data, &mut sched);
        u.write(UECFG0X, 0x55, 0, &mut data, &mut sched);
        u.write(UENUM, 0, 0, &mut data, &mut sched);
        assert_eq!(data[UECFG0X as usize], 0xaa);
        u.write(UENUM, 1, 0, &mut data, &mut sched);
        assert_eq!(data[UECFG0X as usize], 0x55);
    }

    #[test]
    fn test_general_interrupt_clears_taken_bit() {
        let (mut u, mut data, mut sched) = setup();
        data[UDINT as usize] = SOFI | EORSTI;
        data[UDIEN as usize] = 0xff;
        assert_eq!(u.check_interrupt_general(&mut data), Some(INT_USB_GEN));
        assert_eq!(u.check_interrupt_general(&mut data), Some(INT_USB_GEN));
        assert_eq!(u.check_interrupt_general(&mut data), None);
        let _ = sched;
    }
}
