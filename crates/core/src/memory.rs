//! ATmega32u4 memory subsystem.
//!
//! The memory model follows the AVR unified data-space layout:
//!
//! | Address Range | Content             |
//! |---------------|---------------------|
//! | 0x0000–0x001F | General registers R0–R31 |
//! | 0x0020–0x00FF | I/O + extended I/O registers |
//! | 0x0100–0x0AFF | SRAM (2560 bytes)   |
//!
//! Flash (32 KB) and EEPROM (1 KB) are separate address spaces. The stack
//! pointer and flag register live in data space (SPL/SPH at 0x5D/0x5E,
//! SREG at 0x5F), so guest code and peripherals see one source of truth.

use crate::{DATA_SIZE, EEPROM_SIZE, FLASH_SIZE};

pub const SPL: u16 = 0x5d;
pub const SPH: u16 = 0x5e;
pub const SREG: u16 = 0x5f;

/// ATmega32u4 memory model containing data space, flash, and EEPROM.
pub struct Memory {
    /// Unified data space: registers (0x00-0x1F) + I/O (0x20-0xFF) + SRAM
    pub data: Vec<u8>,
    /// Program memory (flash)
    pub flash: Vec<u8>,
    /// EEPROM
    pub eeprom: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: vec![0u8; DATA_SIZE],
            flash: vec![0u8; FLASH_SIZE],
            eeprom: vec![0xffu8; EEPROM_SIZE],
        }
    }

    // --- Register access ---

    #[inline(always)]
    pub fn reg(&self, r: u8) -> u8 {
        self.data[r as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, r: u8, v: u8) {
        self.data[r as usize] = v;
    }

    /// Read a 16-bit register pair starting at `lo` (little-endian).
    #[inline(always)]
    pub fn reg_word(&self, lo: u8) -> u16 {
        self.data[lo as usize] as u16 | ((self.data[lo as usize + 1] as u16) << 8)
    }

    /// Write a 16-bit register pair starting at `lo`.
    #[inline(always)]
    pub fn set_reg_word(&mut self, lo: u8, v: u16) {
        self.data[lo as usize] = v as u8;
        self.data[lo as usize + 1] = (v >> 8) as u8;
    }

    #[inline(always)]
    pub fn x(&self) -> u16 {
        self.reg_word(26)
    }

    #[inline(always)]
    pub fn y(&self) -> u16 {
        self.reg_word(28)
    }

    #[inline(always)]
    pub fn z(&self) -> u16 {
        self.reg_word(30)
    }

    #[inline(always)]
    pub fn set_x(&mut self, v: u16) {
        self.set_reg_word(26, v);
    }

    #[inline(always)]
    pub fn set_y(&mut self, v: u16) {
        self.set_reg_word(28, v);
    }

    #[inline(always)]
    pub fn set_z(&mut self, v: u16) {
        self.set_reg_word(30, v);
    }

    // --- Stack pointer / flag register ---

    #[inline(always)]
    pub fn sp(&self) -> u16 {
        self.data[SPL as usize] as u16 | ((self.data[SPH as usize] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_sp(&mut self, v: u16) {
        self.data[SPL as usize] = v as u8;
        self.data[SPH as usize] = (v >> 8) as u8;
    }

    #[inline(always)]
    pub fn sreg(&self) -> u8 {
        self.data[SREG as usize]
    }

    #[inline(always)]
    pub fn set_sreg(&mut self, v: u8) {
        self.data[SREG as usize] = v;
    }

    // --- Program memory ---

    /// Read 16-bit word from flash at word address.
    #[inline(always)]
    pub fn read_program_word(&self, word_addr: usize) -> u16 {
        let byte_addr = word_addr * 2;
        if byte_addr + 1 < self.flash.len() {
            self.flash[byte_addr] as u16 | ((self.flash[byte_addr + 1] as u16) << 8)
        } else {
            0xffff
        }
    }

    /// Read single byte from flash at byte address (LPM semantics).
    #[inline(always)]
    pub fn read_flash_byte(&self, byte_addr: usize) -> u8 {
        if byte_addr < self.flash.len() {
            self.flash[byte_addr]
        } else {
            0xff
        }
    }

    // --- Data space (no side effects; I/O hooks live on Machine) ---

    #[inline(always)]
    pub fn read_raw(&self, addr: u16) -> u8 {
        let a = addr as usize;
        if a < self.data.len() { self.data[a] } else { 0 }
    }

    #[inline(always)]
    pub fn write_raw(&mut self, addr: u16, v: u8) {
        let a = addr as usize;
        if a < self.data.len() {
            self.data[a] = v;
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_pair() {
        let mut mem = Memory::new();
        mem.set_z(0x1234);
        assert_eq!(mem.z(), 0x1234);
        assert_eq!(mem.data[30], 0x34);
        assert_eq!(mem.data[31], 0x12);
    }

    #[test]
    fn test_stack_pointer() {
        let mut mem = Memory::new();
        mem.set_sp(0x0aff);
        assert_eq!(mem.sp(), 0x0aff);
        assert_eq!(mem.data[SPL as usize], 0xff);
        assert_eq!(mem.data[SPH as usize], 0x0a);
    }

    #[test]
    fn test_program_word() {
        let mut mem = Memory::new();
        mem.flash[0] = 0x0c;
        mem.flash[1] = 0x94;
        assert_eq!(mem.read_program_word(0), 0x940c);
    }
}
