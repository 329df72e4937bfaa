//! LCD controller: register file, scanline/blanking state machine and the
//! video memories it owns (palette RAM, VRAM, OAM).
//!
//! One scanline is 1232 cycles: 960 visible draw cycles then 272 of
//! horizontal blank. 160 visible lines are followed by 68 blanking lines
//! (VCOUNT 160..=227), after which VCOUNT wraps to 0.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

mod object_attributes;
mod render;

pub use render::{decode_fixed16, decode_fixed32, encode_fixed32, rgb555_to_argb};

/// GBA display width
pub const LCD_WIDTH: usize = 240;

/// GBA display height
pub const LCD_HEIGHT: usize = 160;

/// Cycles of the visible part of a scanline.
pub const SCANLINE_CYCLES: i32 = 960;

/// Cycles of the horizontal blank.
pub const HBLANK_CYCLES: i32 = 272;

/// Cycles of one whole line.
pub const LINE_CYCLES: i32 = SCANLINE_CYCLES + HBLANK_CYCLES;

/// First blanking line.
const VBLANK_LINE: u16 = 160;

/// Lines per frame, counting the blanking ones.
const FRAME_LINES: u16 = 228;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Scanline,
    HBlank,
    VBlank,
}

/// Events produced by one LCD phase transition; the scheduler forwards
/// them to the interrupt controller and the DMA engine.
#[derive(Default)]
pub struct LcdStepOutput {
    pub request_vblank_irq: bool,
    pub request_hblank_irq: bool,
    pub request_vcount_irq: bool,
    pub arm_hblank_dma: bool,
    pub arm_vblank_dma: bool,
    /// The frame completed; the host may present the framebuffer.
    pub frame_ready: bool,
}

#[derive(Serialize, Deserialize)]
pub struct Lcd {
    /// LCD Control
    pub dispcnt: u16,
    /// Undocumented - Green Swap
    pub green_swap: u16,
    /// General LCD Status (STAT, LYC)
    pub dispstat: u16,
    /// Vertical Counter (LY)
    pub vcount: u16,
    /// BG0-BG3 Control
    pub bgcnt: [u16; 4],
    /// BG0-BG3 coarse scroll, 9 significant bits each.
    pub bghofs: [u16; 4],
    pub bgvofs: [u16; 4],
    /// BG2/BG3 affine parameters (PA, PB, PC, PD), 8.8 fixed point.
    /// Index 0 is BG2.
    pub bgpa: [u16; 2],
    pub bgpb: [u16; 2],
    pub bgpc: [u16; 2],
    pub bgpd: [u16; 2],
    /// BG2/BG3 reference points, 20.8 fixed point in 28 bits.
    pub bgx: [u32; 2],
    pub bgy: [u32; 2],
    /// Window 0/1 horizontal extents: left in the high byte, right
    /// (exclusive) in the low byte.
    pub winh: [u16; 2],
    /// Window 0/1 vertical extents: top in the high byte, bottom
    /// (exclusive) in the low byte.
    pub winv: [u16; 2],
    /// Inside of Window 0 and 1
    pub winin: u16,
    /// Inside of OBJ Window & Outside of Windows
    pub winout: u16,
    /// Mosaic Size
    pub mosaic: u16,
    /// Color Special Effects Selection
    pub bldcnt: u16,
    /// Alpha Blending Coefficients
    pub bldalpha: u16,
    /// Brightness (Fade-In/Out) Coefficient
    pub bldy: u16,

    /// From 0x05000000 to 0x050003FF (512 bytes BG + 512 bytes OBJ).
    pub palette_ram: Vec<u8>,
    /// From 0x06000000 to 0x06017FFF (96 KiB).
    pub video_ram: Vec<u8>,
    /// From 0x07000000 to 0x070003FF (1 KiB).
    pub obj_attributes: Vec<u8>,

    /// ARGB8888 output, row-major 240x160.
    pub framebuffer: Vec<u32>,

    pub phase: Phase,

    /// Working copies of the affine reference points, in 20.8 fixed
    /// point. Reloaded from MMIO on write and at VBlank start, stepped by
    /// PB/PD after every rendered line.
    internal_ref_x: [i32; 2],
    internal_ref_y: [i32; 2],

    /// Scanline scratch: per-priority OBJ pixels, per-BG pixels, OBJ
    /// window coverage. Alpha 0 means "nothing here".
    #[serde(skip, default = "line_scratch")]
    bg_buffer: [[u32; LCD_WIDTH]; 4],
    #[serde(skip, default = "line_scratch")]
    obj_buffer: [[u32; LCD_WIDTH]; 4],
    #[serde(skip, default = "window_scratch")]
    obj_window: [bool; LCD_WIDTH],
}

fn line_scratch() -> [[u32; LCD_WIDTH]; 4] {
    [[0; LCD_WIDTH]; 4]
}

fn window_scratch() -> [bool; LCD_WIDTH] {
    [false; LCD_WIDTH]
}

impl Default for Lcd {
    fn default() -> Self {
        Self {
            dispcnt: 0,
            green_swap: 0,
            dispstat: 0,
            vcount: 0,
            bgcnt: [0; 4],
            bghofs: [0; 4],
            bgvofs: [0; 4],
            bgpa: [0; 2],
            bgpb: [0; 2],
            bgpc: [0; 2],
            bgpd: [0; 2],
            bgx: [0; 2],
            bgy: [0; 2],
            winh: [0; 2],
            winv: [0; 2],
            winin: 0,
            winout: 0,
            mosaic: 0,
            bldcnt: 0,
            bldalpha: 0,
            bldy: 0,
            palette_ram: vec![0; 0x400],
            video_ram: vec![0; 0x18000],
            obj_attributes: vec![0; 0x400],
            framebuffer: vec![0xFF00_0000; LCD_WIDTH * LCD_HEIGHT],
            phase: Phase::Scanline,
            internal_ref_x: [0; 2],
            internal_ref_y: [0; 2],
            bg_buffer: [[0; LCD_WIDTH]; 4],
            obj_buffer: [[0; LCD_WIDTH]; 4],
            obj_window: [false; LCD_WIDTH],
        }
    }
}

impl Lcd {
    /// Cycles until the next phase transition, as seen from the phase just
    /// entered.
    pub fn cycles_until_next_event(&self) -> i32 {
        match self.phase {
            Phase::Scanline => SCANLINE_CYCLES,
            Phase::HBlank => HBLANK_CYCLES,
            Phase::VBlank => LINE_CYCLES,
        }
    }

    /// Advances to the next phase boundary and reports what happened
    /// there. The caller is responsible for waiting
    /// [`cycles_until_next_event`](Self::cycles_until_next_event) between
    /// calls.
    pub fn tick(&mut self) -> LcdStepOutput {
        let mut output = LcdStepOutput::default();

        match self.phase {
            Phase::Scanline => {
                // Visible part done: render the line, enter HBlank.
                self.render_scanline();
                self.step_affine_references();

                self.set_hblank_flag(true);
                if self.hblank_irq_enabled() {
                    output.request_hblank_irq = true;
                }
                output.arm_hblank_dma = true;
                self.phase = Phase::HBlank;
            }
            Phase::HBlank => {
                self.set_hblank_flag(false);
                self.advance_line(&mut output);
            }
            Phase::VBlank => {
                self.advance_line(&mut output);
            }
        }

        output
    }

    fn advance_line(&mut self, output: &mut LcdStepOutput) {
        self.vcount += 1;

        if self.vcount == FRAME_LINES {
            self.vcount = 0;
            self.set_vblank_flag(false);
            self.phase = Phase::Scanline;
        } else if self.vcount == VBLANK_LINE {
            self.set_vblank_flag(true);
            if self.vblank_irq_enabled() {
                output.request_vblank_irq = true;
            }
            output.arm_vblank_dma = true;
            output.frame_ready = true;
            self.latch_affine_references();
            self.phase = Phase::VBlank;
        } else if self.vcount < VBLANK_LINE {
            self.phase = Phase::Scanline;
        } else {
            self.phase = Phase::VBlank;
        }

        let vcount_match = self.vcount.get_byte(0) == self.vcount_setting();
        self.set_vcount_flag(vcount_match);
        if vcount_match && self.vcount_irq_enabled() {
            output.request_vcount_irq = true;
        }
    }

    /// Reloads both working reference points from MMIO. Runs at VBlank
    /// start and whenever a reference register is written.
    pub fn latch_affine_references(&mut self) {
        for bg in 0..2 {
            self.internal_ref_x[bg] = decode_fixed32(self.bgx[bg]);
            self.internal_ref_y[bg] = decode_fixed32(self.bgy[bg]);
        }
    }

    /// A write to BG2X/BG2Y/BG3X/BG3Y re-latches that register
    /// immediately (`affine_bg` is 0 for BG2, 1 for BG3).
    pub fn latch_affine_reference(&mut self, affine_bg: usize) {
        self.internal_ref_x[affine_bg] = decode_fixed32(self.bgx[affine_bg]);
        self.internal_ref_y[affine_bg] = decode_fixed32(self.bgy[affine_bg]);
    }

    /// The reference points walk one PB/PD step per rendered line.
    fn step_affine_references(&mut self) {
        for bg in 0..2 {
            self.internal_ref_x[bg] += decode_fixed16(self.bgpb[bg]);
            self.internal_ref_y[bg] += decode_fixed16(self.bgpd[bg]);
        }
    }

    pub(crate) fn internal_reference(&self, affine_bg: usize) -> (i32, i32) {
        (self.internal_ref_x[affine_bg], self.internal_ref_y[affine_bg])
    }

    /// DISPSTAT bits 0-2 are hardware status and ignore writes; IRQ
    /// enables and the VCount compare value are writable.
    pub fn write_dispstat_byte(&mut self, byte_nth: u8, value: u8) {
        match byte_nth {
            0 => {
                let status = self.dispstat & 0b111;
                self.dispstat = (self.dispstat & 0xFF00) | (u16::from(value) & !0b111) | status;
            }
            _ => self.dispstat.set_byte(1, value),
        }
    }

    pub fn bg_mode(&self) -> u8 {
        self.dispcnt.get_bits(0..=2) as u8
    }

    /// Mode 4/5 page flip: bit 4 selects the 0xA000 frame.
    pub(crate) fn frame_select(&self) -> bool {
        self.dispcnt.get_bit(4)
    }

    /// OBJ tile mapping: one-dimensional when set.
    pub(crate) fn obj_one_dimensional(&self) -> bool {
        self.dispcnt.get_bit(6)
    }

    pub(crate) fn forced_blank(&self) -> bool {
        self.dispcnt.get_bit(7)
    }

    pub fn bg_enabled(&self, bg: usize) -> bool {
        self.dispcnt.get_bit(8 + bg as u8)
    }

    pub(crate) fn obj_enabled(&self) -> bool {
        self.dispcnt.get_bit(12)
    }

    pub(crate) fn window_enabled(&self, window: usize) -> bool {
        self.dispcnt.get_bit(13 + window as u8)
    }

    pub(crate) fn obj_window_enabled(&self) -> bool {
        self.dispcnt.get_bit(15)
    }

    fn vcount_setting(&self) -> u8 {
        self.dispstat.get_byte(1)
    }

    fn vblank_irq_enabled(&self) -> bool {
        self.dispstat.get_bit(3)
    }

    fn hblank_irq_enabled(&self) -> bool {
        self.dispstat.get_bit(4)
    }

    fn vcount_irq_enabled(&self) -> bool {
        self.dispstat.get_bit(5)
    }

    fn set_vblank_flag(&mut self, value: bool) {
        self.dispstat.set_bit(0, value);
    }

    fn set_hblank_flag(&mut self, value: bool) {
        self.dispstat.set_bit(1, value);
    }

    fn set_vcount_flag(&mut self, value: bool) {
        self.dispstat.set_bit(2, value);
    }

    // BGxCNT accessors.

    pub(crate) fn bg_priority(&self, bg: usize) -> u8 {
        self.bgcnt[bg].get_bits(0..=1) as u8
    }

    pub(crate) fn bg_tile_base(&self, bg: usize) -> usize {
        self.bgcnt[bg].get_bits(2..=3) as usize * 0x4000
    }

    pub(crate) fn bg_map_base(&self, bg: usize) -> usize {
        self.bgcnt[bg].get_bits(8..=12) as usize * 0x800
    }

    /// 16-color x 16 palettes when clear, 256-color when set.
    pub(crate) fn bg_8bpp(&self, bg: usize) -> bool {
        self.bgcnt[bg].get_bit(7)
    }

    pub(crate) fn bg_wraparound(&self, bg: usize) -> bool {
        self.bgcnt[bg].get_bit(13)
    }

    pub(crate) fn bg_size(&self, bg: usize) -> u8 {
        self.bgcnt[bg].get_bits(14..=15) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitwise::Bits;

    /// Runs the LCD through `n` phase transitions, merging the outputs.
    fn run_transitions(lcd: &mut Lcd, n: usize) -> (bool, bool) {
        let mut saw_vblank = false;
        let mut saw_frame = false;
        for _ in 0..n {
            let out = lcd.tick();
            saw_vblank |= out.request_vblank_irq;
            saw_frame |= out.frame_ready;
        }
        (saw_vblank, saw_frame)
    }

    #[test]
    fn hblank_flag_tracks_phase() {
        let mut lcd = Lcd::default();
        assert_eq!(lcd.phase, Phase::Scanline);

        let out = lcd.tick();
        assert_eq!(lcd.phase, Phase::HBlank);
        assert!(lcd.dispstat.get_bit(1));
        assert!(out.arm_hblank_dma);
        assert!(!out.request_hblank_irq);

        lcd.tick();
        assert_eq!(lcd.phase, Phase::Scanline);
        assert!(!lcd.dispstat.get_bit(1));
        assert_eq!(lcd.vcount, 1);
    }

    #[test]
    fn hblank_irq_when_enabled() {
        let mut lcd = Lcd::default();
        lcd.dispstat.set_bit_on(4);
        let out = lcd.tick();
        assert!(out.request_hblank_irq);
    }

    #[test]
    fn vblank_begins_at_line_160() {
        let mut lcd = Lcd::default();
        lcd.dispstat.set_bit_on(3);

        // 160 visible lines of two transitions each.
        let (saw_vblank, saw_frame) = run_transitions(&mut lcd, 320);
        assert!(saw_vblank);
        assert!(saw_frame);
        assert_eq!(lcd.vcount, 160);
        assert_eq!(lcd.phase, Phase::VBlank);
        assert!(lcd.dispstat.get_bit(0));
    }

    #[test]
    fn vcount_wraps_to_zero_once_per_frame() {
        let mut lcd = Lcd::default();

        // A full frame: 160 lines x 2 transitions + 68 blank lines.
        let mut wraps = 0;
        for _ in 0..(320 + 68) {
            lcd.tick();
            if lcd.vcount == 0 && lcd.phase == Phase::Scanline {
                wraps += 1;
            }
        }
        assert_eq!(wraps, 1);
        assert_eq!(lcd.vcount, 0);
        assert!(!lcd.dispstat.get_bit(0));
    }

    #[test]
    fn vcount_match_raises_flag_and_irq() {
        let mut lcd = Lcd::default();
        // VCount setting 2, IRQ enabled.
        lcd.dispstat = (2 << 8) | (1 << 5);

        let mut fired = false;
        for _ in 0..8 {
            fired |= lcd.tick().request_vcount_irq;
        }
        assert!(fired);
        assert!(lcd.vcount >= 2);
    }

    #[test]
    fn dispstat_status_bits_are_read_only() {
        let mut lcd = Lcd::default();
        lcd.tick(); // enter HBlank, bit 1 set

        lcd.write_dispstat_byte(0, 0xFF);
        // IRQ enables stick, status bits keep their hardware value.
        assert!(lcd.dispstat.get_bit(3));
        assert!(lcd.dispstat.get_bit(1));
        assert!(!lcd.dispstat.get_bit(0));

        lcd.write_dispstat_byte(1, 42);
        assert_eq!(lcd.dispstat.get_byte(1), 42);
    }

    #[test]
    fn affine_reference_latches_on_write_and_vblank() {
        let mut lcd = Lcd::default();
        lcd.bgx[0] = 0x100; // 1.0 in 20.8
        lcd.latch_affine_reference(0);
        assert_eq!(lcd.internal_reference(0).0, 0x100);

        // The working copy drifts by PB per line...
        lcd.bgpb[0] = 0x100;
        lcd.tick();
        assert_eq!(lcd.internal_reference(0).0, 0x200);

        // ...and VBlank reloads it.
        lcd.vcount = 159;
        lcd.phase = Phase::HBlank;
        lcd.tick();
        assert_eq!(lcd.internal_reference(0).0, 0x100);
    }
}
