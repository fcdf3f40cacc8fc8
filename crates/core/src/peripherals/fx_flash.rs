//! W25Q128 SPI flash (16 MB, chip select on PD1).
//!
//! Byte-level state machine driven by completed SPI transfers. The part
//! powers up in deep power-down and ignores everything until a Release
//! Power Down (0xAB), which is exactly what stock bootloaders rely on to
//! leave the chip quiet. Page program and sector erase open real busy
//! windows, timed in picoseconds of simulated time and started when chip
//! select rises; while busy only the status register responds, with the
//! BUSY bit set.
//!
//! Supported commands:
//! - 0x03 Read Data, 0x0B Fast Read (one dummy byte)
//! - 0x9F JEDEC ID, 0xAB Release Power Down, 0xB9 Power Down
//! - 0x05 Read Status Register 1
//! - 0x06 / 0x04 Write Enable / Disable
//! - 0x02 Page Program (wraps within its 256-byte page, AND-programs)
//! - 0x20 Sector Erase (4 KB)

use serde::{Deserialize, Serialize};

const FLASH_SIZE: usize = 16 * 1024 * 1024;

// W25Q128JV identification
const JEDEC_MFR: u8 = 0xef;
const JEDEC_TYPE: u8 = 0x40;
const JEDEC_CAP: u8 = 0x18;
const DEVICE_ID: u8 = 0x17;

// typical datasheet times
const PAGE_PROGRAM_PS: u64 = 700_000_000; // 0.7 ms
const SECTOR_ERASE_PS: u64 = 100_000_000_000; // 100 ms

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FxState {
    Idle,
    ReadAddr { cmd: u8, addr_bytes: u8, addr: u32 },
    ReadDummy { addr: u32 },
    Reading { addr: u32 },
    JedecId { byte_idx: u8 },
    ReleasePd { byte_idx: u8 },
    ReadStatus,
    ProgAddr { addr_bytes: u8, addr: u32 },
    Programming { addr: u32 },
    EraseAddr { addr_bytes: u8, addr: u32 },
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FxFlash {
    pub data: Vec<u8>,
    pub state: FxState,
    pub loaded: bool,
    write_enabled: bool,
    powered_down: bool,
    /// Remaining busy time; decremented by [`FxFlash::advance`]
    busy_ps: u64,
    /// Busy window armed by the current command, started at deselect
    pending_busy_ps: u64,
    pub dbg_program_count: u32,
    pub dbg_erase_count: u32,
}

impl FxFlash {
    pub fn new() -> Self {
        FxFlash {
            data: Vec::new(), // allocated only when an image is loaded
            state: FxState::Idle,
            loaded: false,
            write_enabled: false,
            powered_down: true,
            busy_ps: 0,
            pending_busy_ps: 0,
            dbg_program_count: 0,
            dbg_erase_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = FxState::Idle;
        self.write_enabled = false;
        self.powered_down = true;
        self.busy_ps = 0;
        self.pending_busy_ps = 0;
    }

    fn ensure_data(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0xff; FLASH_SIZE];
        }
    }

    /// Load an image at the start of the flash.
    pub fn load_data(&mut self, bin: &[u8]) {
        self.load_data_at(bin, 0);
    }

    /// Load an image at a byte offset.
    pub fn load_data_at(&mut self, bin: &[u8], offset: usize) {
        self.ensure_data();
        if offset >= FLASH_SIZE {
            return;
        }
        let end = (offset + bin.len()).min(FLASH_SIZE);
        self.data[offset..end].copy_from_slice(&bin[..end - offset]);
        self.loaded = true;
    }

    pub fn is_busy(&self) -> bool {
        self.busy_ps > 0
    }

    /// Pass simulated time; programming and erase complete here.
    pub fn advance(&mut self, ps: u64) {
        self.busy_ps = self.busy_ps.saturating_sub(ps);
    }

    /// Chip select rising edge: reset the command state and start any
    /// armed busy window.
    pub fn deselect(&mut self) {
        if self.pending_busy_ps > 0 {
            self.busy_ps = self.pending_busy_ps;
            self.pending_busy_ps = 0;
            self.write_enabled = false;
        }
        self.state = FxState::Idle;
    }

    /// Exchange one SPI byte; returns the MISO response.
    pub fn transfer(&mut self, mosi: u8) -> u8 {
        if self.powered_down && !(self.state == FxState::Idle && mosi == 0xab) {
            return 0xff;
        }
        if self.busy_ps > 0 {
            // only the status register answers while busy
            if self.state == FxState::ReadStatus {
                return 0x01 | (self.write_enabled as u8) << 1;
            }
            if self.state == FxState::Idle && mosi == 0x05 {
                self.state = FxState::ReadStatus;
            }
            return 0xff;
        }
        match self.state {
            FxState::Idle => {
                match mosi {
                    0x03 | 0x0b => {
                        self.state = FxState::ReadAddr { cmd: mosi, addr_bytes: 0, addr: 0 };
                    }
                    0x9f => self.state = FxState::JedecId { byte_idx: 0 },
                    0xab => {
                        self.powered_down = false;
                        self.state = FxState::ReleasePd { byte_idx: 0 };
                    }
                    0xb9 => self.powered_down = true,
                    0x05 => self.state = FxState::ReadStatus,
                    0x06 => self.write_enabled = true,
                    0x04 => self.write_enabled = false,
                    0x02 => self.state = FxState::ProgAddr { addr_bytes: 0, addr: 0 },
                    0x20 => self.state = FxState::EraseAddr { addr_bytes: 0, addr: 0 },
                    _ => {}
                }
                0xff
            }

            FxState::ReadAddr { cmd, addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    let addr = addr & (FLASH_SIZE as u32 - 1);
                    self.state = if cmd == 0x0b {
                        FxState::ReadDummy { addr }
                    } else {
                        FxState::Reading { addr }
                    };
                } else {
                    self.state = FxState::ReadAddr { cmd, addr_bytes: addr_bytes + 1, addr };
                }
                0xff
            }

            FxState::ReadDummy { addr } => {
                self.state = FxState::Reading { addr };
                0xff
            }

            FxState::Reading { addr } => {
                let val = if self.data.is_empty() {
                    0xff
                } else {
                    self.data[addr as usize]
                };
                self.state = FxState::Reading {
                    addr: addr.wrapping_add(1) & (FLASH_SIZE as u32 - 1),
                };
                val
            }

            FxState::JedecId { byte_idx } => {
                let val = match byte_idx {
                    0 => JEDEC_MFR,
                    1 => JEDEC_TYPE,
                    2 => JEDEC_CAP,
                    _ => 0x00,
                };
                self.state = FxState::JedecId { byte_idx: byte_idx + 1 };
                val
            }

            FxState::ReleasePd { byte_idx } => {
                // three dummy bytes then the device ID
                let val = if byte_idx >= 3 { DEVICE_ID } else { 0xff };
                self.state = FxState::ReleasePd { byte_idx: byte_idx + 1 };
                val
            }

            FxState::ReadStatus => (self.write_enabled as u8) << 1,

            FxState::ProgAddr { addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    self.state = FxState::Programming {
                        addr: addr & (FLASH_SIZE as u32 - 1),
                    };
                } else {
                    self.state = FxState::ProgAddr { addr_bytes: addr_bytes + 1, addr };
                }
                0xff
            }

            FxState::Programming { addr } => {
                if self.write_enabled {
                    self.ensure_data();
                    // programming can only clear bits
                    self.data[addr as usize] &= mosi;
                    if self.pending_busy_ps == 0 {
                        self.pending_busy_ps = PAGE_PROGRAM_PS;
                        self.dbg_program_count += 1;
                    }
                    // address wraps within the 256-byte page
                    let next = (addr & !0xff) | ((addr + 1) & 0xff);
                    self.state = FxState::Programming { addr: next };
                }
                0xff
            }

            FxState::EraseAddr { addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    if self.write_enabled {
                        self.ensure_data();
                        let start = (addr as usize & (FLASH_SIZE - 1)) & !(4096 - 1);
                        for b in &mut self.data[start..start + 4096] {
                            *b = 0xff;
                        }
                        self.pending_busy_ps = SECTOR_ERASE_PS;
                        self.dbg_erase_count += 1;
                    }
                    self.state = FxState::Idle;
                } else {
                    self.state = FxState::EraseAddr { addr_bytes: addr_bytes + 1, addr };
                }
                0xff
            }
        }
    }
}

impl Default for FxFlash {
    fn default() -> Self {
        Self::new()
    }
}
