//! SSD1306 128x64 OLED display controller.
//!
//! Byte-level model of the controller itself rather than a framebuffer
//! shim: command bytes walk a parameterized command state machine, data
//! bytes land in 1 KB of GDDRAM at a cursor governed by the addressing
//! mode, and a row-scan renderer driven by the controller's own clock
//! (Fosc / divide ratio, phase 1 + phase 2 + 50 clocks per row) produces
//! grayscale output rows in real time. Games that race the beam or dim
//! the panel by strobing the display depend on this timing.
//!
//! Rendering keeps a four-frame history ring so a host can average
//! frames into gray levels, and models segment current limiting: a row
//! with many lit pixels draws more than the charge pump can supply, so
//! the whole row dims. Both are visible on real hardware.

use serde::{Deserialize, Serialize};

pub const DISPLAY_WIDTH: usize = 128;
pub const DISPLAY_HEIGHT: usize = 64;

const RAM_SIZE: usize = 1024;
const PIXEL_COUNT: usize = DISPLAY_WIDTH * DISPLAY_HEIGHT;

/// Frames kept for software grayscale averaging.
pub const HISTORY_FRAMES: usize = 4;

/// Most current the charge pump can source across a row, in arbitrary
/// units where one fully-driven segment at max contrast draws
/// `ref_segment_current`. A full row at max contrast demands
/// `0.195 * 128 = 24.96`, roughly double this budget, so heavy rows
/// visibly dim.
const MAX_DRIVER_CURRENT: f32 = 12.0;

// display clock frequencies (kHz) for the 16 command settings
const FOSC_KHZ: [f64; 16] = [
    200.0, 224.0, 248.0, 272.0, 296.0, 320.0, 344.0, 368.0,
    392.0, 416.0, 440.0, 464.0, 488.0, 512.0, 536.0, 570.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrMode {
    Horizontal,
    Vertical,
    Page,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Display {
    /// GDDRAM, page-major: `ram[page * 128 + col]`, one bit per pixel
    pub ram: Vec<u8>,
    /// Frame history ring, `HISTORY_FRAMES` frames of 128x64 intensities
    pub pixels: Vec<u8>,
    /// Kernel-weighted average over the history ring
    pub filtered_pixels: Vec<u8>,
    pixel_history_index: usize,

    pub contrast: u8,
    pub entire_display_on: bool,
    pub inverse_display: bool,
    pub display_on: bool,
    pub enable_charge_pump: bool,

    pub addressing_mode: AddrMode,

    col_start: u8,
    col_end: u8,
    page_start: u8,
    page_end: u8,

    mux_ratio: u8,
    display_offset: u8,
    display_start: u8,

    /// true: scan COM[mux] down to COM0
    com_scan_direction: bool,
    alternative_com: bool,
    com_remap: bool,
    segment_remap: bool,

    fosc_index: u8,
    divide_ratio: u8,
    phase_1: u8,
    phase_2: u8,
    vcomh_deselect: u8,

    // refresh state
    row: u8,
    row_cycle: u32,
    cycles_per_row: u32,
    ps_per_clk: u64,
    ps_rem: u64,
    vsync: bool,

    processing_command: bool,
    current_command: u8,
    command_byte_index: u8,

    // data cursor
    data_page: u8,
    data_col: u8,

    /// Frame averaging on/off; a host that wants raw frames turns it off
    pub enable_filter: bool,
    pub enable_current_limiting: bool,
    pub ref_segment_current: f32,
    pub current_limit_slope: f32,
    prev_row_drive: f32,
}

impl Display {
    pub fn new() -> Self {
        let mut d = Display {
            ram: vec![0; RAM_SIZE],
            pixels: vec![0; HISTORY_FRAMES * PIXEL_COUNT],
            filtered_pixels: vec![0; PIXEL_COUNT],
            pixel_history_index: 0,
            contrast: 0x7f,
            entire_display_on: false,
            inverse_display: false,
            display_on: false,
            enable_charge_pump: false,
            addressing_mode: AddrMode::Page,
            col_start: 0,
            col_end: 127,
            page_start: 0,
            page_end: 7,
            mux_ratio: 63,
            display_offset: 0,
            display_start: 0,
            com_scan_direction: false,
            alternative_com: true,
            com_remap: false,
            segment_remap: false,
            fosc_index: 8,
            divide_ratio: 0,
            phase_1: 2,
            phase_2: 2,
            vcomh_deselect: 2,
            row: 0,
            row_cycle: 0,
            cycles_per_row: 0,
            ps_per_clk: 0,
            ps_rem: 0,
            vsync: false,
            processing_command: false,
            current_command: 0,
            command_byte_index: 0,
            data_page: 0,
            data_col: 0,
            enable_filter: true,
            enable_current_limiting: true,
            ref_segment_current: 0.195,
            current_limit_slope: 0.75,
            prev_row_drive: 0.0,
        };
        d.update_clocking();
        d
    }

    pub fn reset(&mut self) {
        let enable_filter = self.enable_filter;
        *self = Display::new();
        self.enable_filter = enable_filter;
    }

    /// Display clock frequency in Hz for the current 0xD5 setting.
    pub fn fosc(&self) -> f64 {
        FOSC_KHZ[(self.fosc_index as usize) % 16] * 1000.0
    }

    /// Frame rate implied by the current clocking registers.
    pub fn refresh_rate(&self) -> f64 {
        let d = (self.divide_ratio + 1) as f64;
        let k = (self.phase_1 + self.phase_2 + 50) as f64;
        let mux = (self.mux_ratio as f64) + 1.0;
        self.fosc() / (d * k * mux)
    }

    fn update_clocking(&mut self) {
        self.cycles_per_row = (self.phase_1 + self.phase_2) as u32 + 50;
        self.ps_per_clk =
            (1e12 * (self.divide_ratio + 1) as f64 / self.fosc()).round() as u64;
    }

    pub fn send_command(&mut self, byte: u8) {
        if !self.processing_command {
            self.command_byte_index = 0;
            self.current_command = byte;
            self.processing_command = true;
        }
        match self.current_command {
            // column address low nibble
            0x00..=0x0f => {
                self.data_col = (self.data_col & 0xf0) | self.current_command;
                self.processing_command = false;
            }
            // column address high nibble
            0x10..=0x1f => {
                self.data_col =
                    ((self.data_col & 0x0f) | (self.current_command << 4)) & 0x7f;
                self.processing_command = false;
            }
            0x20 => {
                if self.command_byte_index == 1 {
                    match byte & 0x3 {
                        0 => self.addressing_mode = AddrMode::Horizontal,
                        1 => self.addressing_mode = AddrMode::Vertical,
                        2 => self.addressing_mode = AddrMode::Page,
                        _ => {}
                    }
                    self.processing_command = false;
                }
            }
            0x21 => {
                if self.command_byte_index == 1 {
                    self.col_start = byte & 0x7f;
                    self.data_col = self.col_start;
                }
                if self.command_byte_index == 2 {
                    self.col_end = byte & 0x7f;
                    self.processing_command = false;
                }
            }
            0x22 => {
                if self.command_byte_index == 1 {
                    self.page_start = byte & 0x7;
                    self.data_page = self.page_start;
                }
                if self.command_byte_index == 2 {
                    self.page_end = byte & 0x7;
                    self.processing_command = false;
                }
            }
            // scroll setup commands are accepted but not modeled
            0x26 | 0x27 => {
                if self.command_byte_index == 6 {
                    self.processing_command = false;
                }
            }
            0x29 | 0x2a => {
                if self.command_byte_index == 5 {
                    self.processing_command = false;
                }
            }
            0x2e | 0x2f => self.processing_command = false,
            0x81 => {
                if self.command_byte_index == 1 {
                    self.contrast = byte;
                    self.processing_command = false;
                }
            }
            0x8d => {
                if self.command_byte_index == 1 {
                    self.enable_charge_pump = byte == 0x14;
                    self.processing_command = false;
                }
            }
            0xb0..=0xb7 => {
                self.data_page = self.current_command & 0x7;
                self.processing_command = false;
            }
            0xa0 => {
                self.segment_remap = false;
                self.processing_command = false;
            }
            0xa1 => {
                self.segment_remap = true;
                self.processing_command = false;
            }
            0xa4 => {
                self.entire_display_on = true;
                self.processing_command = false;
            }
            0xa5 => {
                self.entire_display_on = false;
                self.processing_command = false;
            }
            0xa6 => {
                self.inverse_display = false;
                self.processing_command = false;
            }
            0xa7 => {
                self.inverse_display = true;
                self.processing_command = false;
            }
            0xa8 => {
                if self.command_byte_index == 1 {
                    self.mux_ratio = byte & 0x3f;
                    self.processing_command = false;
                }
            }
            0xae => {
                self.display_on = false;
                self.processing_command = false;
            }
            0xaf => {
                self.display_on = true;
                self.processing_command = false;
            }
            0xc0 => {
                self.com_scan_direction = false;
                self.processing_command = false;
            }
            0xc8 => {
                self.com_scan_direction = true;
                self.processing_command = false;
            }
            0xd3 => {
                if self.command_byte_index == 1 {
                    self.display_offset = byte & 0x3f;
                    self.processing_command = false;
                }
            }
            0xd5 => {
                if self.command_byte_index == 1 {
                    self.divide_ratio = byte & 0xf;
                    self.fosc_index = byte >> 4;
                    self.update_clocking();
                    self.processing_command = false;
                }
            }
            0xd9 => {
                if self.command_byte_index == 1 {
                    self.phase_1 = byte & 0xf;
                    self.phase_2 = byte >> 4;
                    self.update_clocking();
                    self.processing_command = false;
                }
            }
            0xda => {
                if self.command_byte_index == 1 {
                    self.alternative_com = byte & 0x10 != 0;
                    self.com_remap = byte & 0x20 != 0;
                    self.processing_command = false;
                }
            }
            0xdb => {
                if self.command_byte_index == 1 {
                    self.vcomh_deselect = (byte >> 4) & 0x7;
                    self.processing_command = false;
                }
            }
            0xe3 => self.processing_command = false,
            // display start line
            0x40..=0x7f => {
                self.display_start = self.current_command & 0x3f;
                self.processing_command = false;
            }
            _ => self.processing_command = false,
        }
        self.command_byte_index += 1;
    }

    pub fn send_data(&mut self, byte: u8) {
        let mapped_col = if self.segment_remap {
            127 - self.data_col
        } else {
            self.data_col
        };
        let i = self.data_page as usize * 128 + mapped_col as usize;
        self.ram[i & (RAM_SIZE - 1)] = byte;

        match self.addressing_mode {
            AddrMode::Horizontal => {
                if self.data_col >= self.col_end {
                    self.data_col = self.col_start;
                    if self.data_page >= self.page_end {
                        self.data_page = self.page_start;
                    } else {
                        self.data_page = (self.data_page + 1) & 0x7;
                    }
                } else {
                    self.data_col = (self.data_col + 1) & 0x7f;
                }
            }
            AddrMode::Vertical => {
                if self.data_page >= self.page_end {
                    self.data_page = self.page_start;
                    if self.data_col >= self.col_end {
                        self.data_col = self.col_start;
                    } else {
                        self.data_col = (self.data_col + 1) & 0x7f;
                    }
                } else {
                    self.data_page = (self.data_page + 1) & 0x7;
                }
            }
            AddrMode::Page => {
                if self.data_col >= self.col_end {
                    self.data_col = self.col_start;
                } else {
                    self.data_col = (self.data_col + 1) & 0x7f;
                }
            }
        }
    }

    /// Advance the controller by `ps` picoseconds of simulated time.
    /// Returns true if a frame completed during this slice.
    pub fn advance(&mut self, ps: u64) -> bool {
        self.vsync = false;
        let mut ps = ps + self.ps_rem;
        self.ps_rem = 0;

        while ps >= self.ps_per_clk {
            self.row_cycle += 1;
            if self.row_cycle >= self.cycles_per_row {
                self.render_row();
                self.row_cycle = 0;
                if self.row == self.mux_ratio {
                    self.row = 0;
                } else {
                    self.row = (self.row + 1) % 64;
                }
            }
            ps -= self.ps_per_clk;
        }

        self.ps_rem = ps;
        self.vsync
    }

    fn render_row(&mut self) {
        let ram_row = self.row.wrapping_add(self.display_start) & 63;
        let mask = 1u8 << (ram_row % 8);
        let rindex = (ram_row as usize / 8) * 128;

        let mut out_row = self.row.wrapping_sub(self.display_offset);
        if self.com_scan_direction {
            out_row = self.mux_ratio.wrapping_sub(out_row);
        }
        out_row &= 63;

        if !self.enable_filter {
            self.pixel_history_index = 0;
        }
        let frame = self.pixel_history_index;

        // frame wrap: low mux ratios scan fewer rows
        if (self.mux_ratio >= 16 && self.row == self.mux_ratio) || self.row >= 63 {
            if self.enable_filter {
                self.pixel_history_index = (self.pixel_history_index + 1) % HISTORY_FRAMES;
            }
            self.vsync = true;
        }

        let p0 = 0u8;
        let mut p1 = if self.enable_charge_pump {
            self.contrast
        } else {
            self.contrast >> 4
        };

        if self.enable_current_limiting {
            let mut num_on = 0u32;
            for i in 0..128 {
                let lit = self.ram[rindex + i] & mask != 0;
                if lit != self.inverse_display {
                    num_on += 1;
                }
            }
            let mut row_drive = self.ref_segment_current * (1.0 / 255.0)
                * num_on as f32
                * self.contrast as f32;

            // smooth sudden demand changes against the previous row
            let diff = MAX_DRIVER_CURRENT * 0.5;
            if self.row != 0 && (row_drive - self.prev_row_drive).abs() > diff {
                let f = 0.35;
                if row_drive > self.prev_row_drive {
                    row_drive = f * (self.prev_row_drive + diff) + (1.0 - f) * row_drive;
                } else {
                    row_drive = f * (self.prev_row_drive - diff) + (1.0 - f) * row_drive;
                }
            }

            if row_drive > MAX_DRIVER_CURRENT {
                let mut t = MAX_DRIVER_CURRENT / row_drive;
                t += self.current_limit_slope * (1.0 - t);
                row_drive *= t;
            }

            if num_on > 0 {
                let segment_drive = row_drive / num_on as f32;
                let mut t = segment_drive / self.ref_segment_current * 255.0;
                if t > self.contrast as f32 {
                    t = self.contrast as f32;
                }
                p1 = t as u8;
            }

            self.prev_row_drive = row_drive;
        }

        let (p0, p1) = if self.inverse_display { (p1, p0) } else { (p0, p1) };

        // the panel is mounted upside-down, so flip both axes
        let base = frame * PIXEL_COUNT + (63 - out_row as usize) * 128;
        for i in 0..128 {
            let p = if self.ram[rindex + i] & mask != 0 { p1 } else { p0 };
            self.pixels[base + 127 - i] = p;
        }

        if self.vsync && self.enable_filter {
            self.filter_pixels();
        }
    }

    fn filter_pixels(&mut self) {
        const KERNEL: [u16; 4] = [42, 84, 84, 42];
        let mut counts = vec![0u16; PIXEL_COUNT];
        for n in 0..HISTORY_FRAMES {
            let c = KERNEL[(7 - n + self.pixel_history_index) % 4];
            let frame = &self.pixels[n * PIXEL_COUNT..(n + 1) * PIXEL_COUNT];
            for (acc, &p) in counts.iter_mut().zip(frame) {
                *acc += p as u16 * c;
            }
        }
        for (out, acc) in self.filtered_pixels.iter_mut().zip(&counts) {
            *out = (acc / 256) as u8;
        }
    }

    /// Most recently completed frame from the history ring.
    pub fn current_frame(&self) -> &[u8] {
        let f = if self.enable_filter {
            (self.pixel_history_index + HISTORY_FRAMES - 1) % HISTORY_FRAMES
        } else {
            0
        };
        &self.pixels[f * PIXEL_COUNT..(f + 1) * PIXEL_COUNT]
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_ps(d: &Display) -> u64 {
        d.ps_per_clk * d.cycles_per_row as u64 * 64
    }

    #[test]
    fn test_column_nibble_commands() {
        let mut d = Display::new();
        d.send_command(0x04); // low nibble
        d.send_command(0x13); // high nibble
        d.send_command(0xb2); // page 2
        d.send_data(0xff);
        assert_eq!(d.ram[2 * 128 + 0x34], 0xff);
    }

    #[test]
    fn test_page_mode_wraps_column_only() {
        let mut d = Display::new();
        d.send_command(0xb1);
        for _ in 0..129 {
            d.send_data(0xaa);
        }
        // wrapped back to column 0 of the same page
        assert_eq!(d.ram[128 + 0], 0xaa);
        assert_eq!(d.ram[128 + 127], 0xaa);
        assert_eq!(d.ram[2 * 128], 0);
    }

    #[test]
    fn test_horizontal_mode_window() {
        let mut d = Display::new();
        d.send_command(0x20);
        d.send_command(0x00); // horizontal
        d.send_command(0x21);
        d.send_command(10);
        d.send_command(11);
        d.send_command(0x22);
        d.send_command(0);
        d.send_command(1);
        for b in 1..=5u8 {
            d.send_data(b);
        }
        assert_eq!(d.ram[11], 2);
        assert_eq!(d.ram[128 + 10], 3);
        assert_eq!(d.ram[128 + 11], 4);
        // wrapped back to the window origin over the first byte
        assert_eq!(d.ram[10], 5);
    }

    #[test]
    fn test_vertical_mode_advances_page_first() {
        let mut d = Display::new();
        d.send_command(0x20);
        d.send_command(0x01); // vertical
        d.send_command(0x22);
        d.send_command(0);
        d.send_command(1);
        d.send_data(1);
        d.send_data(2);
        d.send_data(3);
        assert_eq!(d.ram[0], 1);
        assert_eq!(d.ram[128], 2);
        assert_eq!(d.ram[1], 3);
    }

    #[test]
    fn test_segment_remap_mirrors_columns() {
        let mut d = Display::new();
        d.send_command(0xa1);
        d.send_data(0x55); // cursor at column 0 writes column 127
        assert_eq!(d.ram[127], 0x55);
    }

    #[test]
    fn test_multibyte_command_not_confused_by_data_like_params() {
        let mut d = Display::new();
        // contrast parameter 0xb3 must not be taken as a page-select
        d.send_command(0x81);
        d.send_command(0xb3);
        assert_eq!(d.contrast, 0xb3);
        d.send_data(0xff);
        assert_eq!(d.ram[0], 0xff);
    }

    #[test]
    fn test_frame_timing_and_vsync() {
        let mut d = Display::new();
        // defaults: fosc 392 kHz, divide 1, 54 clocks per row
        assert_eq!(d.cycles_per_row, 54);
        assert_eq!(d.ps_per_clk, 2_551_020);
        let f = frame_ps(&d);
        assert!(d.advance(f));
        // partial frame: no vsync
        assert!(!d.advance(f / 4));
    }

    #[test]
    fn test_rendered_intensity_follows_contrast() {
        let mut d = Display::new();
        d.enable_current_limiting = false;
        d.enable_filter = false;
        d.send_command(0x8d);
        d.send_command(0x14); // charge pump on
        d.send_command(0x81);
        d.send_command(0xc0);
        for i in 0..RAM_SIZE {
            d.ram[i] = 0xff;
        }
        d.advance(frame_ps(&d));
        assert!(d.current_frame().iter().all(|&p| p == 0xc0));
        // without the charge pump the panel runs dim
        d.send_command(0x8d);
        d.send_command(0x10);
        d.advance(frame_ps(&d));
        assert!(d.current_frame().iter().all(|&p| p == 0x0c));
    }

    #[test]
    fn test_current_limiting_dims_heavy_rows() {
        let mut d = Display::new();
        d.enable_filter = false;
        d.send_command(0x8d);
        d.send_command(0x14);
        d.send_command(0x81);
        d.send_command(0xff); // max contrast
        for i in 0..RAM_SIZE {
            d.ram[i] = 0xff; // every pixel lit
        }
        d.advance(frame_ps(&d));
        // full rows at max contrast exceed the driver budget
        let p = d.current_frame()[PIXEL_COUNT / 2];
        assert!(p < 0xff);
        assert!(p > 0);
        // halving the contrast brings the demand back inside the
        // budget; no dimming beyond float rounding
        d.send_command(0x81);
        d.send_command(0x40);
        d.advance(frame_ps(&d));
        let p = d.current_frame()[PIXEL_COUNT / 2];
        assert!(p >= 0x3f && p <= 0x40, "unlimited level {p:#x}");
    }

    #[test]
    fn test_history_ring_and_filter() {
        let mut d = Display::new();
        d.enable_current_limiting = false;
        d.send_command(0x8d);
        d.send_command(0x14);
        d.send_command(0x81);
        d.send_command(0xff);
        for i in 0..RAM_SIZE {
            d.ram[i] = 0xff;
        }
        let f = frame_ps(&d);
        // two lit frames, two dark
        d.advance(f);
        d.advance(f);
        for i in 0..RAM_SIZE {
            d.ram[i] = 0;
        }
        d.advance(f);
        d.advance(f);
        // kernel weights sum to 252/256, half lit: mid gray
        let p = d.filtered_pixels[0];
        assert!(p > 0x50 && p < 0x80, "filtered level {p:#x}");
    }

    #[test]
    fn test_start_line_scrolls_output() {
        let mut d = Display::new();
        d.enable_current_limiting = false;
        d.enable_filter = false;
        d.send_command(0x8d);
        d.send_command(0x14);
        // light only RAM row 8 (page 1, bit 0)
        for c in 0..128 {
            d.ram[128 + c] = 0x01;
        }
        d.advance(frame_ps(&d));
        // panel is upside-down: RAM row 8 lands on output row 55
        let lit_row = 55;
        assert!(d.current_frame()[lit_row * 128] > 0);
        // start line 8 shifts the lit row to the top of RAM scan order
        d.send_command(0x40 | 8);
        d.advance(frame_ps(&d));
        assert!(d.current_frame()[63 * 128] > 0);
        assert_eq!(d.current_frame()[lit_row * 128], 0);
    }
}
