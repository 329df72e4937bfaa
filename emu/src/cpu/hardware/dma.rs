use serde::{Deserialize, Serialize};

use logger::log;

use crate::bitwise::Bits;

/// Effective address/count masks differ per channel: channel 0 cannot
/// reach the cartridge space and only channel 3 has a 16-bit count.
const COUNT_MASK: [u32; 4] = [0x3FFF, 0x3FFF, 0x3FFF, 0xFFFF];
const SOURCE_MASK: [u32; 4] = [0x07FF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF];
const DEST_MASK: [u32; 4] = [0x07FF_FFFF, 0x07FF_FFFF, 0x07FF_FFFF, 0x0FFF_FFFF];

/// Address stepping policy for source/destination.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AddressControl {
    Increment,
    Decrement,
    Fixed,
    /// Increment during the transfer; destination reloads on repeat.
    IncrementReload,
}

impl From<u32> for AddressControl {
    fn from(value: u32) -> Self {
        match value & 0b11 {
            0 => Self::Increment,
            1 => Self::Decrement,
            2 => Self::Fixed,
            _ => Self::IncrementReload,
        }
    }
}

impl AddressControl {
    /// Signed step applied after each transferred unit.
    pub fn step(self, unit: u32) -> i64 {
        match self {
            Self::Increment | Self::IncrementReload => unit as i64,
            Self::Decrement => -(unit as i64),
            Self::Fixed => 0,
        }
    }
}

/// The event that releases a pending channel.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DmaTrigger {
    Immediate,
    VBlank,
    HBlank,
    /// Sound FIFO refill on channels 1/2, video capture on channel 3.
    Special,
}

impl From<u32> for DmaTrigger {
    fn from(value: u32) -> Self {
        match value & 0b11 {
            0 => Self::Immediate,
            1 => Self::VBlank,
            2 => Self::HBlank,
            _ => Self::Special,
        }
    }
}

/// Register file of one channel plus the internal copies latched on the
/// enable edge.
#[derive(Default, Serialize, Deserialize)]
pub struct DmaRegisters {
    pub source_address: u32,
    pub destination_address: u32,
    pub word_count: u16,
    pub control: u16,

    /// Working registers, loaded from the visible ones when bit 15 rises.
    pub internal_source: u32,
    pub internal_destination: u32,
    pub internal_count: u32,

    /// Armed and waiting for the scheduler to run the engine.
    pub pending: bool,
}

impl DmaRegisters {
    pub fn destination_control(&self) -> AddressControl {
        AddressControl::from(self.control.get_bits(5..=6) as u32)
    }

    pub fn source_control(&self) -> AddressControl {
        AddressControl::from(self.control.get_bits(7..=8) as u32)
    }

    pub fn repeat(&self) -> bool {
        self.control.get_bit(9)
    }

    /// Transfer unit: 4 bytes when set, 2 otherwise.
    pub fn transfer_unit(&self) -> u32 {
        if self.control.get_bit(10) {
            4
        } else {
            2
        }
    }

    pub fn trigger(&self) -> DmaTrigger {
        DmaTrigger::from(self.control.get_bits(12..=13) as u32)
    }

    pub fn irq_on_completion(&self) -> bool {
        self.control.get_bit(14)
    }

    pub fn enabled(&self) -> bool {
        self.control.get_bit(15)
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Dma {
    pub channels: [DmaRegisters; 4],
}

impl Dma {
    /// Handles a DMAxCNT_H write. A rising enable edge latches the
    /// internal source/destination/count with the channel masks applied;
    /// an Immediate channel is armed on the spot.
    pub fn write_control(&mut self, channel: usize, value: u16) {
        let was_enabled = self.channels[channel].enabled();
        self.channels[channel].control = value;
        let ch = &mut self.channels[channel];

        if !was_enabled && ch.enabled() {
            ch.internal_source = ch.source_address & SOURCE_MASK[channel];
            ch.internal_destination = ch.destination_address & DEST_MASK[channel];
            ch.internal_count = Self::masked_count(channel, ch.word_count);

            match ch.trigger() {
                DmaTrigger::Immediate => ch.pending = true,
                DmaTrigger::Special if channel == 0 => {
                    // Channel 0 has no Special source; it never fires.
                    log("DMA0 configured with Special trigger, ignored");
                }
                _ => {}
            }
        }

        if !self.channels[channel].enabled() {
            self.channels[channel].pending = false;
        }
    }

    /// A zero count transfers the full range.
    pub fn masked_count(channel: usize, word_count: u16) -> u32 {
        let count = u32::from(word_count) & COUNT_MASK[channel];
        if count == 0 {
            COUNT_MASK[channel] + 1
        } else {
            count
        }
    }

    pub fn notify_vblank(&mut self) {
        self.mark_pending(DmaTrigger::VBlank);
    }

    pub fn notify_hblank(&mut self) {
        self.mark_pending(DmaTrigger::HBlank);
    }

    /// A sound FIFO dropped to its refill threshold; arm the Special
    /// channel (1 or 2) whose destination is that FIFO's port.
    pub fn notify_fifo_refill(&mut self, fifo_address: u32) {
        for channel in 1..=2 {
            let ch = &mut self.channels[channel];
            if ch.enabled()
                && ch.trigger() == DmaTrigger::Special
                && ch.internal_destination == fifo_address
            {
                ch.pending = true;
            }
        }
    }

    fn mark_pending(&mut self, trigger: DmaTrigger) {
        for ch in &mut self.channels {
            if ch.enabled() && ch.trigger() == trigger {
                ch.pending = true;
            }
        }
    }

    /// Highest-priority channel ready to hold the bus (0 beats 3).
    pub fn running_channel(&self) -> Option<usize> {
        self.channels.iter().position(|ch| ch.enabled() && ch.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_edge_latches_internals() {
        let mut dma = Dma::default();
        dma.channels[0].source_address = 0xFFFF_FFFF;
        dma.channels[0].destination_address = 0x0300_0000;
        dma.channels[0].word_count = 0x10;

        dma.write_control(0, 1 << 15);

        let ch = &dma.channels[0];
        // Channel 0 source is masked to 27 bits.
        assert_eq!(ch.internal_source, 0x07FF_FFFF);
        assert_eq!(ch.internal_destination, 0x0300_0000);
        assert_eq!(ch.internal_count, 0x10);
        // Immediate trigger arms right away.
        assert!(ch.pending);
    }

    #[test]
    fn zero_count_transfers_full_range() {
        assert_eq!(Dma::masked_count(0, 0), 0x4000);
        assert_eq!(Dma::masked_count(3, 0), 0x10000);
    }

    #[test]
    fn rewrite_without_edge_keeps_latches() {
        let mut dma = Dma::default();
        dma.channels[0].source_address = 0x0200_0000;
        dma.write_control(0, 1 << 15);
        dma.channels[0].pending = false;

        // Changing the visible source while enabled must not touch the
        // internal copy.
        dma.channels[0].source_address = 0x0300_0000;
        dma.write_control(0, 1 << 15 | 1 << 9);
        assert_eq!(dma.channels[0].internal_source, 0x0200_0000);
        assert!(!dma.channels[0].pending);
    }

    #[test]
    fn hblank_trigger_waits_for_notification() {
        let mut dma = Dma::default();
        dma.channels[1].word_count = 1;
        dma.write_control(1, 1 << 15 | 0b10 << 12);

        assert!(!dma.channels[1].pending);
        assert_eq!(dma.running_channel(), None);

        dma.notify_hblank();
        assert!(dma.channels[1].pending);
        assert_eq!(dma.running_channel(), Some(1));
    }

    #[test]
    fn priority_prefers_lowest_channel() {
        let mut dma = Dma::default();
        dma.write_control(3, 1 << 15);
        dma.write_control(1, 1 << 15);
        assert_eq!(dma.running_channel(), Some(1));
    }

    #[test]
    fn disable_clears_pending() {
        let mut dma = Dma::default();
        dma.write_control(0, 1 << 15);
        assert!(dma.channels[0].pending);

        dma.write_control(0, 0);
        assert!(!dma.channels[0].pending);
    }
}
