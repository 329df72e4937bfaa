use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// The fourteen interrupt lines, by IE/IF bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    VBlank = 0,
    HBlank = 1,
    VCount = 2,
    Timer0 = 3,
    Timer1 = 4,
    Timer2 = 5,
    Timer3 = 6,
    Serial = 7,
    Dma0 = 8,
    Dma1 = 9,
    Dma2 = 10,
    Dma3 = 11,
    Keypad = 12,
    Gamepak = 13,
}

impl Interrupt {
    pub const fn timer(n: usize) -> Self {
        match n {
            0 => Self::Timer0,
            1 => Self::Timer1,
            2 => Self::Timer2,
            _ => Self::Timer3,
        }
    }

    pub const fn dma(n: usize) -> Self {
        match n {
            0 => Self::Dma0,
            1 => Self::Dma1,
            2 => Self::Dma2,
            _ => Self::Dma3,
        }
    }
}

/// CPU power state driven by HALTCNT writes.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltState {
    #[default]
    Run,
    /// Woken by any pending enabled interrupt.
    Halt,
    /// Woken by the keypad interrupt only.
    Stop,
}

#[derive(Default, Serialize, Deserialize)]
pub struct InterruptControl {
    /// IE - Interrupt Enable (0x04000200).
    pub interrupt_enable: u16,
    /// IF - Interrupt Request flags (0x04000202). Set by hardware,
    /// cleared by the CPU with a write-1-to-clear.
    pub interrupt_request: u16,
    /// IME - Interrupt Master Enable (0x04000208).
    pub interrupt_master_enable: u16,
    /// POSTFLG (0x04000300).
    pub post_boot_flag: u8,
    /// HALTCNT (0x04000301).
    pub halt_state: HaltState,
}

impl InterruptControl {
    /// A device raises its IF bit. Visible to the CPU at the next
    /// instruction boundary.
    pub fn request(&mut self, interrupt: Interrupt) {
        self.interrupt_request.set_bit_on(interrupt as u8);
    }

    /// Write-1-to-clear semantics of an IF byte.
    pub fn acknowledge_byte(&mut self, byte_nth: u8, value: u8) {
        let mask = !((value as u16) << (byte_nth * 8));
        self.interrupt_request &= mask;
    }

    /// Enabled and requested lines, regardless of IME. This is the wake
    /// condition for Halt.
    pub fn fire_mask(&self) -> u16 {
        self.interrupt_enable & self.interrupt_request
    }

    /// True when the CPU should take the IRQ exception.
    pub fn should_fire_irq(&self) -> bool {
        self.interrupt_master_enable.get_bit(0) && self.fire_mask() != 0
    }
}
