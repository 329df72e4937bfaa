//! System bus: address decode, memory-mapped I/O dispatch, waitstate
//! accounting and the DMA engine's bus master loop.
//!
//! Every access is charged through the `cycles16`/`cycles32` lookup
//! tables, indexed by access kind and the high 4 bits of the address. The
//! ROM and SRAM columns are derived from WAITCNT and rebuilt on every
//! write to it.

use std::collections::HashMap;

use logger::log;

use crate::bitwise::Bits;
use crate::cartridge::Cartridge;
use crate::cpu::hardware::dma::{Dma, DmaTrigger};
use crate::cpu::hardware::interrupt_control::{HaltState, Interrupt, InterruptControl};
use crate::cpu::hardware::keypad::Keypad;
use crate::cpu::hardware::lcd::Lcd;
use crate::cpu::hardware::sound::Sound;
use crate::cpu::hardware::timers::Timers;

/// Non-sequential first-access waitstates selected by WAITCNT (SRAM and
/// WS0/WS1/WS2 all index this table).
const WS_NONSEQ: [u32; 4] = [4, 3, 2, 8];
/// Sequential waitstates per ROM window.
const WS_SEQ0: [u32; 2] = [2, 1];
const WS_SEQ1: [u32; 2] = [4, 1];
const WS_SEQ2: [u32; 2] = [8, 1];

/// Resident HLE BIOS: a reset stub that jumps to the cartridge and an IRQ
/// vector that pushes r0-r3, r12, lr, calls the user handler pointer at
/// 0x03007FFC and returns. Installed when no BIOS image is provided.
const HLE_BIOS: [u8; 0x40] = [
    0x06, 0x00, 0x00, 0xEA, 0x00, 0x00, 0xA0, 0xE1, //
    0x00, 0x00, 0xA0, 0xE1, 0x00, 0x00, 0xA0, 0xE1, //
    0x00, 0x00, 0xA0, 0xE1, 0x00, 0x00, 0xA0, 0xE1, //
    0x01, 0x00, 0x00, 0xEA, 0x00, 0x00, 0xA0, 0xE1, //
    0x02, 0xF3, 0xA0, 0xE3, 0x0F, 0x50, 0x2D, 0xE9, //
    0x01, 0x03, 0xA0, 0xE3, 0x00, 0xE0, 0x8F, 0xE2, //
    0x04, 0xF0, 0x10, 0xE5, 0x0F, 0x50, 0xBD, 0xE8, //
    0x04, 0xF0, 0x5E, 0xE2, 0x00, 0x00, 0xA0, 0xE1, //
];

/// Bus access kind; sequential accesses continue a burst at the previous
/// address + width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NonSequential = 0,
    Sequential = 1,
}

pub struct Bus {
    pub bios: Vec<u8>,
    /// On-board work RAM, 0x02000000, mirrored every 256 KiB.
    pub working_ram: Vec<u8>,
    /// On-chip work RAM, 0x03000000, mirrored every 32 KiB.
    pub working_iram: Vec<u8>,

    pub cartridge: Cartridge,
    pub lcd: Lcd,
    pub sound: Sound,
    pub dma: Dma,
    pub timers: Timers,
    pub keypad: Keypad,
    pub interrupt_control: InterruptControl,

    /// WAITCNT raw register.
    pub waitcnt: u16,
    /// Access cycle LUTs: `[access kind][address page]`.
    cycles16: [[u32; 16]; 2],
    cycles32: [[u32; 16]; 2],

    /// Cycles charged since the last `take_cycles`.
    cycles: u32,

    /// Open-bus state: the last opcode that crossed the bus, the last
    /// opcode fetched from BIOS, and where the last fetch came from.
    last_fetched_opcode: u32,
    bios_latch: u32,
    last_fetch_address: u32,

    unused_region: HashMap<u32, u8>,
}

impl Bus {
    pub fn new(bios: Option<Vec<u8>>, cartridge: Cartridge) -> Self {
        let bios = match bios {
            Some(image) => image,
            None => {
                let mut stub = vec![0; 0x4000];
                stub[..HLE_BIOS.len()].copy_from_slice(&HLE_BIOS);
                stub
            }
        };

        let mut bus = Self {
            bios,
            working_ram: vec![0; 0x0004_0000],
            working_iram: vec![0; 0x0000_8000],
            cartridge,
            lcd: Lcd::default(),
            sound: Sound::default(),
            dma: Dma::default(),
            timers: Timers::default(),
            keypad: Keypad::default(),
            interrupt_control: InterruptControl::default(),
            waitcnt: 0,
            cycles16: [[1; 16]; 2],
            cycles32: [[1; 16]; 2],
            cycles: 0,
            last_fetched_opcode: 0,
            bios_latch: 0,
            last_fetch_address: 0,
            unused_region: HashMap::new(),
        };

        // Fixed columns of the LUT; the configurable ones come from
        // update_cycle_lut.
        for access in 0..2 {
            bus.cycles16[access][0x2] = 3;
            bus.cycles32[access][0x2] = 6;
            bus.cycles32[access][0x5] = 2;
            bus.cycles32[access][0x6] = 2;
        }
        bus.update_cycle_lut();

        bus
    }

    /// Cycles accumulated by bus traffic since the last call.
    pub fn take_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.cycles)
    }

    /// Charges `count` internal cycles (no bus traffic).
    pub fn idle(&mut self, count: u32) {
        self.cycles += count;
    }

    /// The CPU fetched an opcode: refresh the open-bus latches. BIOS
    /// fetches additionally refresh the value BIOS reads return to code
    /// running outside of it.
    pub fn notify_fetch(&mut self, address: u32, opcode: u32) {
        self.last_fetched_opcode = opcode;
        self.last_fetch_address = address;
        if address < 0x4000 {
            self.bios_latch = opcode;
        }
    }

    fn page(address: u32) -> usize {
        (address >> 24) as usize
    }

    fn lut16(&self, access: Access, address: u32) -> u32 {
        match Self::page(address) {
            page @ 0..=0xF => self.cycles16[access as usize][page],
            _ => 1,
        }
    }

    fn lut32(&self, access: Access, address: u32) -> u32 {
        match Self::page(address) {
            page @ 0..=0xF => self.cycles32[access as usize][page],
            _ => 1,
        }
    }

    fn open_bus_byte(&self, address: u32) -> u8 {
        self.last_fetched_opcode.get_byte((address & 3) as u8)
    }

    pub fn read_byte(&mut self, address: u32, access: Access) -> u8 {
        self.cycles += self.lut16(access, address);
        self.read_raw(address)
    }

    pub fn read_half_word(&mut self, address: u32, access: Access) -> u16 {
        self.cycles += self.lut16(access, address);
        let address = address & !1;

        if Self::page(address) == 0xE {
            // 8-bit bus: the byte is mirrored across the halfword.
            let byte = self.read_raw(address) as u16;
            return byte | (byte << 8);
        }

        (self.read_raw(address + 1) as u16) << 8 | self.read_raw(address) as u16
    }

    pub fn read_word(&mut self, address: u32, access: Access) -> u32 {
        self.cycles += self.lut32(access, address);
        let address = address & !3;

        if Self::page(address) == 0xE {
            let byte = self.read_raw(address) as u32;
            return byte * 0x0101_0101;
        }

        (self.read_raw(address + 3) as u32) << 24
            | (self.read_raw(address + 2) as u32) << 16
            | (self.read_raw(address + 1) as u32) << 8
            | self.read_raw(address) as u32
    }

    pub fn write_byte(&mut self, address: u32, value: u8, access: Access) {
        self.cycles += self.lut16(access, address);

        match Self::page(address) {
            // Palette and VRAM ignore the byte width: the value is
            // mirrored into an aligned halfword write.
            0x5 | 0x6 => {
                let address = address & !1;
                self.write_raw(address, value);
                self.write_raw(address + 1, value);
            }
            // OAM drops byte writes entirely.
            0x7 => {}
            _ => self.write_raw(address, value),
        }
    }

    pub fn write_half_word(&mut self, address: u32, value: u16, access: Access) {
        self.cycles += self.lut16(access, address);
        let address = address & !1;

        if Self::page(address) == 0xE {
            self.write_raw(address, value.get_byte(0));
            return;
        }

        self.write_raw(address, value.get_byte(0));
        self.write_raw(address + 1, value.get_byte(1));
    }

    pub fn write_word(&mut self, address: u32, value: u32, access: Access) {
        self.cycles += self.lut32(access, address);
        let address = address & !3;

        if Self::page(address) == 0xE {
            self.write_raw(address, value.get_byte(0));
            return;
        }

        for i in 0..4 {
            self.write_raw(address + i, value.get_byte(i as u8));
        }
    }

    fn read_raw(&self, address: u32) -> u8 {
        match Self::page(address) {
            0x0 | 0x1 => {
                let offset = address & 0x00FF_FFFF;
                if offset >= 0x4000 {
                    return 0;
                }
                // The BIOS bus only answers while the CPU executes inside
                // it; otherwise the last fetched BIOS opcode is seen.
                if self.last_fetch_address < 0x4000 {
                    self.bios[offset as usize]
                } else {
                    self.bios_latch.get_byte((address & 3) as u8)
                }
            }
            0x2 => self.working_ram[(address as usize) % 0x0004_0000],
            0x3 => self.working_iram[(address as usize) % 0x0000_8000],
            0x4 => self.read_mmio(address),
            0x5 => self.lcd.palette_ram[(address as usize) % 0x400],
            0x6 => self.lcd.video_ram[Self::vram_offset(address)],
            0x7 => self.lcd.obj_attributes[(address as usize) % 0x400],
            0x8..=0xD => self.cartridge.read_rom(address & 0x01FF_FFFF),
            0xE | 0xF => self.cartridge.backup.read_byte(address),
            _ => match self.unused_region.get(&address) {
                Some(value) => *value,
                None => self.open_bus_byte(address),
            },
        }
    }

    fn write_raw(&mut self, address: u32, value: u8) {
        match Self::page(address) {
            // BIOS and ROM are read-only; hardware drops the write.
            0x0 | 0x1 => {}
            0x2 => {
                let offset = (address as usize) % 0x0004_0000;
                self.working_ram[offset] = value;
            }
            0x3 => {
                let offset = (address as usize) % 0x0000_8000;
                self.working_iram[offset] = value;
            }
            0x4 => self.write_mmio(address, value),
            0x5 => self.lcd.palette_ram[(address as usize) % 0x400] = value,
            0x6 => {
                let offset = Self::vram_offset(address);
                self.lcd.video_ram[offset] = value;
            }
            0x7 => self.lcd.obj_attributes[(address as usize) % 0x400] = value,
            0x8..=0xD => {
                tracing::debug!("dropped write to ROM at {address:#010X}");
            }
            0xE | 0xF => self.cartridge.backup.write_byte(address, value),
            _ => {
                tracing::debug!("write on unused memory {address:#010X}");
                self.unused_region.insert(address, value);
            }
        }
    }

    /// VRAM is 96 KiB mirrored with a 128 KiB stride; the 32 KiB OBJ tail
    /// maps over the 0x10000..0x17FFF window again.
    fn vram_offset(address: u32) -> usize {
        let mut offset = (address as usize) % 0x20000;
        if offset >= 0x18000 {
            offset -= 0x8000;
        }
        offset
    }

    fn read_mmio(&self, address: u32) -> u8 {
        let mut offset = (address & 0x00FF_FFFF) as usize;

        // MMIO mirror: 0x04xx0800 maps onto 0x04000800.
        if (offset & 0xFFFC) == 0x0800 {
            offset &= 0xFFFF;
        }

        match offset {
            0x000..=0x05F => self.read_lcd_raw(offset),
            0x060..=0x0AF => self.sound.read_register(offset - 0x060),
            0x0B0..=0x0FF => self.read_dma_raw(offset),
            0x100..=0x11F => self.read_timers_raw(offset),
            0x130 => self.keypad.key_input.get_byte(0),
            0x131 => self.keypad.key_input.get_byte(1),
            0x132 => self.keypad.key_interrupt_control.get_byte(0),
            0x133 => self.keypad.key_interrupt_control.get_byte(1),
            0x200 => self.interrupt_control.interrupt_enable.get_byte(0),
            0x201 => self.interrupt_control.interrupt_enable.get_byte(1),
            0x202 => self.interrupt_control.interrupt_request.get_byte(0),
            0x203 => self.interrupt_control.interrupt_request.get_byte(1),
            0x204 => self.waitcnt.get_byte(0),
            0x205 => self.waitcnt.get_byte(1),
            0x208 => self.interrupt_control.interrupt_master_enable.get_byte(0),
            0x209 => self.interrupt_control.interrupt_master_enable.get_byte(1),
            0x300 => self.interrupt_control.post_boot_flag,
            _ => match self.unused_region.get(&(0x0400_0000 + offset as u32)) {
                Some(value) => *value,
                None => self.open_bus_byte(address),
            },
        }
    }

    fn write_mmio(&mut self, address: u32, value: u8) {
        let mut offset = (address & 0x00FF_FFFF) as usize;

        if (offset & 0xFFFC) == 0x0800 {
            offset &= 0xFFFF;
        }

        match offset {
            0x000..=0x05F => self.write_lcd_raw(offset, value),
            0x060..=0x0AF => self.sound.write_register(offset - 0x060, value),
            0x0B0..=0x0FF => self.write_dma_raw(offset, value),
            0x100..=0x11F => self.write_timers_raw(offset, value),
            // KEYINPUT is read-only.
            0x130 | 0x131 => {}
            0x132 => self.keypad.key_interrupt_control.set_byte(0, value),
            0x133 => self.keypad.key_interrupt_control.set_byte(1, value),
            0x200 => self.interrupt_control.interrupt_enable.set_byte(0, value),
            0x201 => self.interrupt_control.interrupt_enable.set_byte(1, value),
            0x202 => self.interrupt_control.acknowledge_byte(0, value),
            0x203 => self.interrupt_control.acknowledge_byte(1, value),
            0x204 => {
                self.waitcnt.set_byte(0, value);
                self.update_cycle_lut();
            }
            0x205 => {
                self.waitcnt.set_byte(1, value);
                self.update_cycle_lut();
            }
            0x208 => self
                .interrupt_control
                .interrupt_master_enable
                .set_byte(0, value),
            0x209 => self
                .interrupt_control
                .interrupt_master_enable
                .set_byte(1, value),
            0x300 => self.interrupt_control.post_boot_flag = value,
            0x301 => {
                self.interrupt_control.halt_state = if value.get_bit(7) {
                    HaltState::Stop
                } else {
                    HaltState::Halt
                };
            }
            _ => {
                log(format!("write on unused memory {address:#010X}"));
                self.unused_region.insert(0x0400_0000 + offset as u32, value);
            }
        }
    }

    fn read_lcd_raw(&self, offset: usize) -> u8 {
        match offset {
            0x00 => self.lcd.dispcnt.get_byte(0),
            0x01 => self.lcd.dispcnt.get_byte(1),
            0x02 => self.lcd.green_swap.get_byte(0),
            0x03 => self.lcd.green_swap.get_byte(1),
            0x04 => self.lcd.dispstat.get_byte(0),
            0x05 => self.lcd.dispstat.get_byte(1),
            0x06 => self.lcd.vcount.get_byte(0),
            0x07 => self.lcd.vcount.get_byte(1),
            0x08..=0x0F => {
                let bg = (offset - 0x08) / 2;
                self.lcd.bgcnt[bg].get_byte(((offset - 0x08) % 2) as u8)
            }
            0x48 => self.lcd.winin.get_byte(0),
            0x49 => self.lcd.winin.get_byte(1),
            0x4A => self.lcd.winout.get_byte(0),
            0x4B => self.lcd.winout.get_byte(1),
            0x50 => self.lcd.bldcnt.get_byte(0),
            0x51 => self.lcd.bldcnt.get_byte(1),
            0x52 => self.lcd.bldalpha.get_byte(0),
            0x53 => self.lcd.bldalpha.get_byte(1),
            // Scroll, affine, window extent, mosaic and BLDY registers
            // are write-only.
            _ => 0,
        }
    }

    fn write_lcd_raw(&mut self, offset: usize, value: u8) {
        match offset {
            0x00 => self.lcd.dispcnt.set_byte(0, value),
            0x01 => self.lcd.dispcnt.set_byte(1, value),
            0x02 => self.lcd.green_swap.set_byte(0, value),
            0x03 => self.lcd.green_swap.set_byte(1, value),
            0x04 | 0x05 => self.lcd.write_dispstat_byte((offset - 0x04) as u8, value),
            // VCOUNT is read-only.
            0x06 | 0x07 => {}
            0x08..=0x0F => {
                let bg = (offset - 0x08) / 2;
                self.lcd.bgcnt[bg].set_byte(((offset - 0x08) % 2) as u8, value);
            }
            0x10..=0x1F => {
                let reg = (offset - 0x10) / 2;
                let (bg, vertical) = (reg / 2, reg % 2 == 1);
                if vertical {
                    self.lcd.bgvofs[bg].set_byte(((offset - 0x10) % 2) as u8, value);
                } else {
                    self.lcd.bghofs[bg].set_byte(((offset - 0x10) % 2) as u8, value);
                }
            }
            0x20..=0x3F => self.write_lcd_affine_raw(offset, value),
            0x40 => self.lcd.winh[0].set_byte(0, value),
            0x41 => self.lcd.winh[0].set_byte(1, value),
            0x42 => self.lcd.winh[1].set_byte(0, value),
            0x43 => self.lcd.winh[1].set_byte(1, value),
            0x44 => self.lcd.winv[0].set_byte(0, value),
            0x45 => self.lcd.winv[0].set_byte(1, value),
            0x46 => self.lcd.winv[1].set_byte(0, value),
            0x47 => self.lcd.winv[1].set_byte(1, value),
            0x48 => self.lcd.winin.set_byte(0, value),
            0x49 => self.lcd.winin.set_byte(1, value),
            0x4A => self.lcd.winout.set_byte(0, value),
            0x4B => self.lcd.winout.set_byte(1, value),
            0x4C => self.lcd.mosaic.set_byte(0, value),
            0x4D => self.lcd.mosaic.set_byte(1, value),
            0x50 => self.lcd.bldcnt.set_byte(0, value),
            0x51 => self.lcd.bldcnt.set_byte(1, value),
            0x52 => self.lcd.bldalpha.set_byte(0, value),
            0x53 => self.lcd.bldalpha.set_byte(1, value),
            0x54 => self.lcd.bldy.set_byte(0, value),
            0x55 => self.lcd.bldy.set_byte(1, value),
            _ => {
                log(format!("write on unused LCD register {offset:#X}"));
            }
        }
    }

    /// BG2/BG3 affine block (0x20..=0x3F): PA..PD then the two reference
    /// points per background. Reference point writes re-latch the working
    /// registers immediately.
    fn write_lcd_affine_raw(&mut self, offset: usize, value: u8) {
        let bg = (offset - 0x20) / 0x10;
        match (offset - 0x20) % 0x10 {
            0x0 | 0x1 => self.lcd.bgpa[bg].set_byte((offset % 2) as u8, value),
            0x2 | 0x3 => self.lcd.bgpb[bg].set_byte((offset % 2) as u8, value),
            0x4 | 0x5 => self.lcd.bgpc[bg].set_byte((offset % 2) as u8, value),
            0x6 | 0x7 => self.lcd.bgpd[bg].set_byte((offset % 2) as u8, value),
            0x8..=0xB => {
                self.lcd.bgx[bg].set_byte(((offset - 0x28) % 4) as u8, value);
                self.lcd.latch_affine_reference(bg);
            }
            _ => {
                self.lcd.bgy[bg].set_byte(((offset - 0x2C) % 4) as u8, value);
                self.lcd.latch_affine_reference(bg);
            }
        }
    }

    fn read_dma_raw(&self, offset: usize) -> u8 {
        if offset >= 0xE0 {
            return *self
                .unused_region
                .get(&(0x0400_0000 + offset as u32))
                .unwrap_or(&0);
        }

        let channel = (offset - 0xB0) / 12;
        let reg = (offset - 0xB0) % 12;
        match reg {
            // Source, destination and count are write-only.
            0..=9 => 0,
            10 => self.dma.channels[channel].control.get_byte(0),
            _ => self.dma.channels[channel].control.get_byte(1),
        }
    }

    fn write_dma_raw(&mut self, offset: usize, value: u8) {
        if offset >= 0xE0 {
            log(format!("write on unused DMA register {offset:#X}"));
            self.unused_region.insert(0x0400_0000 + offset as u32, value);
            return;
        }

        let channel = (offset - 0xB0) / 12;
        let reg = (offset - 0xB0) % 12;
        let ch = &mut self.dma.channels[channel];
        match reg {
            0..=3 => ch.source_address.set_byte(reg as u8, value),
            4..=7 => ch.destination_address.set_byte((reg - 4) as u8, value),
            8 | 9 => ch.word_count.set_byte((reg - 8) as u8, value),
            10 | 11 => {
                let mut control = ch.control;
                control.set_byte((reg - 10) as u8, value);
                self.dma.write_control(channel, control);
            }
            _ => unreachable!(),
        }
    }

    fn read_timers_raw(&self, offset: usize) -> u8 {
        if offset >= 0x110 {
            return *self
                .unused_region
                .get(&(0x0400_0000 + offset as u32))
                .unwrap_or(&0);
        }

        let channel = (offset - 0x100) / 4;
        let timer = &self.timers.timers[channel];
        match (offset - 0x100) % 4 {
            // TMxCNT_L reads the live counter.
            0 => timer.counter.get_byte(0),
            1 => timer.counter.get_byte(1),
            2 => timer.control.get_byte(0),
            _ => timer.control.get_byte(1),
        }
    }

    fn write_timers_raw(&mut self, offset: usize, value: u8) {
        if offset >= 0x110 {
            log(format!("write on unused memory {offset:#X}"));
            self.unused_region.insert(0x0400_0000 + offset as u32, value);
            return;
        }

        let channel = (offset - 0x100) / 4;
        let timer = &mut self.timers.timers[channel];
        match (offset - 0x100) % 4 {
            // TMxCNT_L writes set the reload register.
            0 => timer.reload.set_byte(0, value),
            1 => timer.reload.set_byte(1, value),
            2 => {
                let mut control = timer.control;
                control.set_byte(0, value);
                timer.write_control(control);
            }
            _ => {
                let mut control = timer.control;
                control.set_byte(1, value);
                timer.write_control(control);
            }
        }
    }

    /// Rebuilds the configurable LUT columns from WAITCNT. Two identical
    /// writes produce identical tables.
    fn update_cycle_lut(&mut self) {
        const NSEQ: usize = Access::NonSequential as usize;
        const SEQ: usize = Access::Sequential as usize;

        let sram_cycles = 1 + WS_NONSEQ[self.waitcnt.get_bits(0..=1) as usize];
        for access in 0..2 {
            self.cycles16[access][0xE] = sram_cycles;
            // The backup bus is 8 bits wide; wider accesses degenerate to
            // a single byte on the bus, so they cost the same.
            self.cycles32[access][0xE] = sram_cycles;
        }

        let ws0_n = 1 + WS_NONSEQ[self.waitcnt.get_bits(2..=3) as usize];
        let ws0_s = 1 + WS_SEQ0[self.waitcnt.get_bit(4) as usize];
        let ws1_n = 1 + WS_NONSEQ[self.waitcnt.get_bits(5..=6) as usize];
        let ws1_s = 1 + WS_SEQ1[self.waitcnt.get_bit(7) as usize];
        let ws2_n = 1 + WS_NONSEQ[self.waitcnt.get_bits(8..=9) as usize];
        let ws2_s = 1 + WS_SEQ2[self.waitcnt.get_bit(10) as usize];

        for (window, (n, s)) in [(ws0_n, ws0_s), (ws1_n, ws1_s), (ws2_n, ws2_s)]
            .into_iter()
            .enumerate()
        {
            for page in [0x8 + window * 2, 0x9 + window * 2] {
                self.cycles16[NSEQ][page] = n;
                self.cycles16[SEQ][page] = s;
                // 32-bit ROM accesses split into one 16-bit access plus
                // one sequential follow-up.
                self.cycles32[NSEQ][page] = n + s;
                self.cycles32[SEQ][page] = 2 * s;
            }
        }
    }

    /// Runs the highest-priority triggered DMA channel to completion.
    /// Returns false when no channel is ready.
    pub fn run_dma(&mut self) -> bool {
        let Some(channel) = self.dma.running_channel() else {
            return false;
        };

        let ch = &self.dma.channels[channel];
        let source_control = ch.source_control();
        let dest_control = ch.destination_control();
        let unit = ch.transfer_unit();
        let repeat = ch.repeat();
        let trigger = ch.trigger();
        let irq = ch.irq_on_completion();
        let mut source = ch.internal_source;
        let mut dest = ch.internal_destination;

        // Engine startup.
        self.idle(2);

        let fifo_mode = trigger == DmaTrigger::Special && (channel == 1 || channel == 2);

        if fifo_mode {
            // Sound FIFO service: four words to a fixed destination, the
            // count is not consumed.
            for _ in 0..4 {
                let value = self.read_word(source & !3, Access::Sequential);
                self.write_word(dest & !3, value, Access::Sequential);
                source = apply_step(source, source_control.step(4));
            }
        } else {
            let count = self.dma.channels[channel].internal_count;
            for _ in 0..count {
                if unit == 4 {
                    let value = self.read_word(source & !3, Access::Sequential);
                    self.write_word(dest & !3, value, Access::Sequential);
                } else {
                    let value = self.read_half_word(source & !1, Access::Sequential);
                    self.write_half_word(dest & !1, value, Access::Sequential);
                }
                source = apply_step(source, source_control.step(unit));
                dest = apply_step(dest, dest_control.step(unit));
            }
        }

        let ch = &mut self.dma.channels[channel];
        ch.internal_source = source;
        ch.internal_destination = dest;
        ch.pending = false;

        let periodic = matches!(
            trigger,
            DmaTrigger::VBlank | DmaTrigger::HBlank | DmaTrigger::Special
        );
        if repeat && periodic {
            ch.internal_count = Dma::masked_count(channel, ch.word_count);
            if ch.destination_control() == crate::cpu::hardware::dma::AddressControl::IncrementReload
            {
                ch.internal_destination = ch.destination_address
                    & if channel == 3 { 0x0FFF_FFFF } else { 0x07FF_FFFF };
            }
        } else {
            ch.control.set_bit_off(15);
        }

        if irq {
            self.interrupt_control.request(Interrupt::dma(channel));
        }

        true
    }

    /// One LCD phase transition: forwards the IRQ and DMA events it
    /// produced. Returns true when a frame just completed.
    pub fn tick_ppu(&mut self) -> bool {
        let output = self.lcd.tick();

        if output.request_vblank_irq {
            self.interrupt_control.request(Interrupt::VBlank);
        }
        if output.request_hblank_irq {
            self.interrupt_control.request(Interrupt::HBlank);
        }
        if output.request_vcount_irq {
            self.interrupt_control.request(Interrupt::VCount);
        }
        if output.arm_hblank_dma && self.lcd.vcount < 160 {
            self.dma.notify_hblank();
        }
        if output.arm_vblank_dma {
            self.dma.notify_vblank();
        }

        output.frame_ready
    }

    /// Advances the timers by `cycles`, feeding overflow events to the
    /// interrupt controller and the sound FIFOs.
    pub fn run_timers(&mut self, cycles: u32) {
        let output = self.timers.run(cycles);

        for (i, requested) in output.request_irq.iter().enumerate() {
            if *requested {
                self.interrupt_control.request(Interrupt::timer(i));
            }
        }

        for timer_id in 0..2 {
            for _ in 0..output.fifo_ticks[timer_id] {
                let sound_output = self.sound.timer_overflow(timer_id);
                if sound_output.refill_fifo[0] {
                    self.dma.notify_fifo_refill(0x0400_00A0);
                }
                if sound_output.refill_fifo[1] {
                    self.dma.notify_fifo_refill(0x0400_00A4);
                }
            }
        }
    }
}

fn apply_step(address: u32, step: i64) -> u32 {
    (address as i64 + step) as u32
}
