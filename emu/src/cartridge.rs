//! Cartridge side of the bus: the ROM image, header metadata, save-type
//! detection and the backup device behind 0x0E000000.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitwise::Bits;

/// Largest cartridge the bus can decode (0x08000000..0x0DFFFFFF).
pub const MAX_ROM_SIZE: usize = 0x0200_0000;

/// A BIOS image is exactly 16 KiB.
pub const BIOS_SIZE: usize = 0x4000;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("ROM image is {0} bytes, the cartridge bus addresses at most 32 MiB")]
    RomTooLarge(usize),
    #[error("BIOS image is {0} bytes, expected exactly 0x4000")]
    InvalidBiosSize(usize),
}

/// Backup media type, detected from ASCII signatures in the ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveType {
    Eeprom,
    Sram,
    Flash64,
    Flash128,
}

impl SaveType {
    const fn backup_len(self) -> usize {
        match self {
            // EEPROM carts are serviced as plain bytes here.
            Self::Eeprom | Self::Sram => 0x8000,
            Self::Flash64 => 0x1_0000,
            Self::Flash128 => 0x2_0000,
        }
    }
}

/// Flash command state machine. Commands are byte sequences written to
/// 0x5555/0x2AAA inside the backup window.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FlashState {
    #[default]
    Ready,
    /// Received 0xAA at 0x5555.
    Command1,
    /// Received 0x55 at 0x2AAA.
    Command2,
    /// Reads return manufacturer/device ID.
    IdMode,
    /// Received 0x80, waiting for the erase sequence.
    EraseCommand,
    EraseCommand1,
    EraseCommand2,
    /// Waiting for the bank number (128 KiB flash only).
    BankSelect,
    /// Ready to program a single byte.
    WriteCommand,
}

/// Parsed 192-byte cartridge header. Validation failures are warnings,
/// not errors: the console itself only refuses to boot, and we are past
/// booting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeHeader {
    pub game_title: String,
    pub game_code: String,
    pub maker_code: String,
    pub software_version: u8,
    pub checksum_valid: bool,
}

impl CartridgeHeader {
    pub fn parse(rom: &[u8]) -> Self {
        let ascii = |range: std::ops::Range<usize>| {
            rom.get(range)
                .map(|bytes| {
                    bytes
                        .iter()
                        .take_while(|&&b| b != 0)
                        .map(|&b| b as char)
                        .collect()
                })
                .unwrap_or_default()
        };

        let checksum_valid = if rom.len() >= 0xBE {
            let mut check = 0u8;
            for byte in &rom[0xA0..=0xBC] {
                check = check.wrapping_sub(*byte);
            }
            let check = check.wrapping_sub(0x19);
            if check != rom[0xBD] {
                tracing::warn!(
                    "header checksum mismatch: computed 0x{check:02X}, stored 0x{:02X}",
                    rom[0xBD]
                );
            }
            if rom.get(0xB2) != Some(&0x96) {
                tracing::warn!("fixed header byte at 0xB2 is not 0x96");
            }
            check == rom[0xBD]
        } else {
            tracing::warn!("ROM too small to carry a cartridge header");
            false
        };

        Self {
            game_title: ascii(0xA0..0xAC),
            game_code: ascii(0xAC..0xB0),
            maker_code: ascii(0xB0..0xB2),
            software_version: rom.get(0xBC).copied().unwrap_or(0),
            checksum_valid,
        }
    }
}

/// SRAM or Flash behind 0x0E000000, accessed over an 8-bit bus.
#[derive(Serialize, Deserialize)]
pub struct Backup {
    save_type: SaveType,
    memory: Vec<u8>,
    flash_state: FlashState,
    flash_bank: u8,
    /// Set on every committed write so the host knows when to persist.
    dirty: bool,
}

impl Backup {
    fn new(save_type: SaveType, image: Option<Vec<u8>>) -> Self {
        let len = save_type.backup_len();
        let memory = match image {
            Some(mut data) => {
                data.resize(len, 0xFF);
                data
            }
            // Erased flash (and unwritten SRAM) reads as 0xFF.
            None => vec![0xFF; len],
        };

        Self {
            save_type,
            memory,
            flash_state: FlashState::Ready,
            flash_bank: 0,
            dirty: false,
        }
    }

    fn is_flash(&self) -> bool {
        matches!(self.save_type, SaveType::Flash64 | SaveType::Flash128)
    }

    pub fn read_byte(&self, offset: u32) -> u8 {
        let offset = (offset as usize) & 0xFFFF;

        if self.is_flash() {
            if self.flash_state == FlashState::IdMode {
                return match (offset, self.save_type) {
                    // Sanyo LE26FV10N1TS for 128 KiB parts.
                    (0, SaveType::Flash128) => 0x62,
                    (1, SaveType::Flash128) => 0x13,
                    // Panasonic MN63F805MNP for 64 KiB parts.
                    (0, _) => 0x32,
                    (1, _) => 0x1B,
                    _ => 0xFF,
                };
            }
            let real_offset = (self.flash_bank as usize) * 0x1_0000 + offset;
            return self.memory.get(real_offset).copied().unwrap_or(0xFF);
        }

        self.memory[offset % self.memory.len()]
    }

    pub fn write_byte(&mut self, offset: u32, value: u8) {
        let offset = (offset as usize) & 0xFFFF;

        if !self.is_flash() {
            let len = self.memory.len();
            self.memory[offset % len] = value;
            self.dirty = true;
            return;
        }

        match self.flash_state {
            FlashState::Ready => {
                if offset == 0x5555 && value == 0xAA {
                    self.flash_state = FlashState::Command1;
                }
            }
            FlashState::Command1 => {
                self.flash_state = if offset == 0x2AAA && value == 0x55 {
                    FlashState::Command2
                } else {
                    FlashState::Ready
                };
            }
            FlashState::Command2 => {
                self.flash_state = FlashState::Ready;
                if offset == 0x5555 {
                    match value {
                        0x90 => self.flash_state = FlashState::IdMode,
                        0xF0 => {}
                        0x80 => self.flash_state = FlashState::EraseCommand,
                        0xA0 => self.flash_state = FlashState::WriteCommand,
                        0xB0 if self.save_type == SaveType::Flash128 => {
                            self.flash_state = FlashState::BankSelect;
                        }
                        _ => tracing::debug!("unknown flash command 0x{value:02X}"),
                    }
                }
            }
            FlashState::IdMode => {
                if value == 0xF0 {
                    self.flash_state = FlashState::Ready;
                } else if offset == 0x5555 && value == 0xAA {
                    self.flash_state = FlashState::Command1;
                }
            }
            FlashState::EraseCommand => {
                self.flash_state = if offset == 0x5555 && value == 0xAA {
                    FlashState::EraseCommand1
                } else {
                    FlashState::Ready
                };
            }
            FlashState::EraseCommand1 => {
                self.flash_state = if offset == 0x2AAA && value == 0x55 {
                    FlashState::EraseCommand2
                } else {
                    FlashState::Ready
                };
            }
            FlashState::EraseCommand2 => {
                if value == 0x10 && offset == 0x5555 {
                    self.memory.fill(0xFF);
                    self.dirty = true;
                } else if value == 0x30 {
                    // 4 KiB sector erase.
                    let base = (self.flash_bank as usize) * 0x1_0000 + (offset & 0xF000);
                    for i in 0..0x1000 {
                        if let Some(byte) = self.memory.get_mut(base + i) {
                            *byte = 0xFF;
                        }
                    }
                    self.dirty = true;
                }
                self.flash_state = FlashState::Ready;
            }
            FlashState::BankSelect => {
                if offset == 0 {
                    self.flash_bank = value & 0x01;
                }
                self.flash_state = FlashState::Ready;
            }
            FlashState::WriteCommand => {
                let real_offset = (self.flash_bank as usize) * 0x1_0000 + offset;
                if let Some(byte) = self.memory.get_mut(real_offset) {
                    // Flash programming can only clear bits.
                    *byte &= value;
                    self.dirty = true;
                }
                self.flash_state = FlashState::Ready;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Cartridge {
    pub header: CartridgeHeader,
    pub save_type: SaveType,
    rom: Vec<u8>,
    pub backup: Backup,
}

impl Cartridge {
    pub fn new(rom: Vec<u8>, backup_image: Option<Vec<u8>>) -> Result<Self, LoaderError> {
        if rom.len() > MAX_ROM_SIZE {
            return Err(LoaderError::RomTooLarge(rom.len()));
        }

        let header = CartridgeHeader::parse(&rom);
        let save_type = Self::detect_save_type(&rom);

        Ok(Self {
            header,
            save_type,
            backup: Backup::new(save_type, backup_image),
            rom,
        })
    }

    /// Scans the ROM at 4-byte alignment for backup library signatures.
    fn detect_save_type(rom: &[u8]) -> SaveType {
        let signatures: [(&[u8], SaveType); 5] = [
            (b"EEPROM_V", SaveType::Eeprom),
            (b"SRAM_V", SaveType::Sram),
            (b"FLASH1M_V", SaveType::Flash128),
            (b"FLASH512_V", SaveType::Flash64),
            (b"FLASH_V", SaveType::Flash64),
        ];

        for i in (0..rom.len()).step_by(4) {
            for (signature, save_type) in signatures {
                if rom[i..].starts_with(signature) {
                    tracing::info!("detected save type {save_type:?}");
                    return save_type;
                }
            }
        }

        tracing::info!("no save signature found, defaulting to SRAM");
        SaveType::Sram
    }

    /// Byte read inside the 32 MiB ROM window.
    ///
    /// The Game Pak bus is halfword addressed and the 16 data lines share
    /// the pins with the low 16 address bits, so reading past the end of
    /// the chip returns the halfword address itself rather than open data.
    pub fn read_rom(&self, offset: u32) -> u8 {
        let offset = offset as usize;
        if offset < self.rom.len() {
            self.rom[offset]
        } else {
            (((offset >> 1) & 0xFFFF) as u16).get_byte((offset & 0b1) as u8)
        }
    }

    pub fn rom_len(&self) -> usize {
        self.rom.len()
    }

    /// Backup bytes for host persistence.
    pub fn backup_bytes(&self) -> &[u8] {
        &self.backup.memory
    }

    /// True when the backup changed since the last `clear_backup_dirty`.
    pub fn backup_dirty(&self) -> bool {
        self.backup.dirty
    }

    pub fn clear_backup_dirty(&mut self) {
        self.backup.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rom_with_signature(signature: &[u8], offset: usize) -> Vec<u8> {
        let mut rom = vec![0; 0x1000];
        rom[offset..offset + signature.len()].copy_from_slice(signature);
        rom
    }

    #[test]
    fn detects_flash_128() {
        let cartridge = Cartridge::new(rom_with_signature(b"FLASH1M_V102", 0x400), None).unwrap();
        assert_eq!(cartridge.save_type, SaveType::Flash128);
    }

    #[test]
    fn detects_flash_512_before_generic() {
        let cartridge = Cartridge::new(rom_with_signature(b"FLASH512_V", 0x20), None).unwrap();
        assert_eq!(cartridge.save_type, SaveType::Flash64);
    }

    #[test]
    fn defaults_to_sram() {
        let cartridge = Cartridge::new(vec![0; 0x100], None).unwrap();
        assert_eq!(cartridge.save_type, SaveType::Sram);
    }

    #[test]
    fn rejects_oversized_rom() {
        assert!(matches!(
            Cartridge::new(vec![0; MAX_ROM_SIZE + 1], None),
            Err(LoaderError::RomTooLarge(_))
        ));
    }

    #[test]
    fn empty_rom_reads_address_bus() {
        let cartridge = Cartridge::new(vec![1, 2, 3, 4], None).unwrap();
        assert_eq!(cartridge.read_rom(0), 1);

        // Past the end: the low 16 bits of the halfword address.
        assert_eq!(cartridge.read_rom(0x01FF_FFFF), 0xFF);
        assert_eq!(cartridge.read_rom(0x01FF_FFEE), 0xF7);
    }

    #[test]
    fn sram_round_trip_marks_dirty() {
        let mut cartridge = Cartridge::new(vec![0; 0x100], None).unwrap();
        assert!(!cartridge.backup_dirty());

        cartridge.backup.write_byte(0x123, 0xAB);
        assert_eq!(cartridge.backup.read_byte(0x123), 0xAB);
        assert!(cartridge.backup_dirty());
    }

    #[test]
    fn flash_id_mode() {
        let rom = rom_with_signature(b"FLASH1M_V", 0);
        let mut cartridge = Cartridge::new(rom, None).unwrap();
        let backup = &mut cartridge.backup;

        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0x90);
        assert_eq!(backup.read_byte(0), 0x62);
        assert_eq!(backup.read_byte(1), 0x13);

        backup.write_byte(0x5555, 0xF0);
        assert_eq!(backup.read_byte(0), 0xFF);
    }

    #[test]
    fn flash_write_and_sector_erase() {
        let rom = rom_with_signature(b"FLASH_V", 0);
        let mut cartridge = Cartridge::new(rom, None).unwrap();
        let backup = &mut cartridge.backup;

        // Program one byte.
        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0xA0);
        backup.write_byte(0x1234, 0x42);
        assert_eq!(backup.read_byte(0x1234), 0x42);

        // Sector erase restores 0xFF.
        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0x80);
        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x1000, 0x30);
        assert_eq!(backup.read_byte(0x1234), 0xFF);
    }

    #[test]
    fn flash_bank_select() {
        let rom = rom_with_signature(b"FLASH1M_V", 0);
        let mut cartridge = Cartridge::new(rom, None).unwrap();
        let backup = &mut cartridge.backup;

        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0xA0);
        backup.write_byte(0, 0x11);

        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0xB0);
        backup.write_byte(0, 1);

        // Same offset, other bank.
        assert_eq!(backup.read_byte(0), 0xFF);

        backup.write_byte(0x5555, 0xAA);
        backup.write_byte(0x2AAA, 0x55);
        backup.write_byte(0x5555, 0xB0);
        backup.write_byte(0, 0);
        assert_eq!(backup.read_byte(0), 0x11);
    }

    #[test]
    fn header_parse() {
        let mut rom = vec![0; 0x200];
        rom[0xA0..0xA9].copy_from_slice(b"TESTTITLE");
        rom[0xAC..0xB0].copy_from_slice(b"ABCD");
        rom[0xB0..0xB2].copy_from_slice(b"01");
        rom[0xB2] = 0x96;
        let mut check = 0u8;
        for byte in &rom[0xA0..=0xBC] {
            check = check.wrapping_sub(*byte);
        }
        rom[0xBD] = check.wrapping_sub(0x19);

        let header = CartridgeHeader::parse(&rom);
        assert_eq!(header.game_title, "TESTTITLE");
        assert_eq!(header.game_code, "ABCD");
        assert_eq!(header.maker_code, "01");
        assert!(header.checksum_valid);
    }
}
