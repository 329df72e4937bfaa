//! Top-level system: couples the CPU/bus with the timed devices and
//! exposes the host-facing API (input, framebuffer, audio, backup).

use crate::bitwise::Bits;
use crate::bus::Bus;
use crate::cartridge::{Cartridge, LoaderError, BIOS_SIZE};
use crate::cpu::arm7tdmi::Arm7tdmi;
use crate::cpu::hardware::interrupt_control::{HaltState, Interrupt};
use crate::cpu::hardware::lcd::{LCD_HEIGHT, LCD_WIDTH};

/// Cycles of a whole frame (228 lines of 1232 cycles).
pub const FRAME_CYCLES: u32 = 280_896;

pub struct Gba {
    pub cpu: Arm7tdmi,

    /// Countdown to the next LCD phase transition.
    ppu_countdown: i32,
}

impl Gba {
    /// Builds a system from a ROM image, an optional 16 KiB BIOS image
    /// and an optional backup (save) image. Without a BIOS the resident
    /// HLE stub and SWI dispatcher are used.
    pub fn new(
        rom: Vec<u8>,
        bios: Option<Vec<u8>>,
        backup: Option<Vec<u8>>,
    ) -> Result<Self, LoaderError> {
        if let Some(image) = &bios {
            if image.len() != BIOS_SIZE {
                return Err(LoaderError::InvalidBiosSize(image.len()));
            }
        }

        let cartridge = Cartridge::new(rom, backup)?;
        let hle_bios = bios.is_none();
        let bus = Bus::new(bios, cartridge);
        let cpu = Arm7tdmi::new(bus, hle_bios);

        Ok(Self {
            ppu_countdown: cpu.bus.lcd.cycles_until_next_event(),
            cpu,
        })
    }

    /// Advances the system by at least `budget` cycles, interleaving the
    /// CPU (or an active DMA, or halt idling) with the timed devices.
    /// Returns true when a frame completed inside the budget.
    pub fn run_for(&mut self, budget: u32) -> bool {
        let mut budget = budget as i64;
        let mut frame_completed = false;

        while budget > 0 {
            let quantum = (self.ppu_countdown as i64).min(budget).max(1) as i32;
            let mut spent = 0i32;

            while spent < quantum {
                self.apply_wake_rules();

                let elapsed = if self.cpu.bus.dma.running_channel().is_some() {
                    // A triggered DMA holds the bus; the CPU stalls.
                    self.cpu.bus.run_dma();
                    self.cpu.bus.take_cycles()
                } else if self.cpu.bus.interrupt_control.halt_state == HaltState::Run {
                    self.cpu.step()
                } else {
                    // Halted: burn the remainder of the quantum so the
                    // devices that can wake us keep moving.
                    let rest = (quantum - spent) as u32;
                    self.cpu.bus.idle(rest);
                    self.cpu.bus.take_cycles()
                };

                let elapsed = elapsed.max(1);
                self.cpu.bus.run_timers(elapsed);
                spent += elapsed as i32;
            }

            self.ppu_countdown -= spent;
            budget -= i64::from(spent);

            if self.ppu_countdown <= 0 {
                frame_completed |= self.cpu.bus.tick_ppu();
                self.ppu_countdown += self.cpu.bus.lcd.cycles_until_next_event();
            }
        }

        frame_completed
    }

    /// Runs until the current frame completes.
    pub fn run_frame(&mut self) {
        // Bounded: a frame is 280896 cycles; twice that covers any
        // mid-frame starting point.
        for _ in 0..2 * FRAME_CYCLES / 64 {
            if self.run_for(64) {
                return;
            }
        }
    }

    fn apply_wake_rules(&mut self) {
        let ic = &mut self.cpu.bus.interrupt_control;
        match ic.halt_state {
            HaltState::Run => {}
            // Halt wakes on any enabled pending interrupt, even with IME
            // clear.
            HaltState::Halt => {
                if ic.fire_mask() != 0 {
                    ic.halt_state = HaltState::Run;
                }
            }
            // Stop only listens to the keypad.
            HaltState::Stop => {
                if ic.fire_mask().get_bit(Interrupt::Keypad as u8) {
                    ic.halt_state = HaltState::Run;
                }
            }
        }
    }

    /// Host keypad update, active-low bits 0..9 = A, B, SELECT, START,
    /// RIGHT, LEFT, UP, DOWN, R, L. Evaluates the keypad interrupt.
    pub fn set_keys(&mut self, key_input: u16) {
        self.cpu.bus.keypad.key_input = key_input & 0x03FF;
        if self.cpu.bus.keypad.interrupt_condition_met() {
            self.cpu.bus.interrupt_control.request(Interrupt::Keypad);
        }
    }

    /// The 240x160 ARGB8888 output, row-major.
    pub fn framebuffer(&self) -> &[u32] {
        &self.cpu.bus.lcd.framebuffer
    }

    /// Takes the PCM samples produced since the last call.
    pub fn drain_audio(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.cpu.bus.sound.sample_buffer)
    }

    pub fn backup_bytes(&self) -> &[u8] {
        self.cpu.bus.cartridge.backup_bytes()
    }

    /// True when the backup changed since `clear_backup_dirty`; the host
    /// persists the bytes at these boundaries.
    pub fn backup_dirty(&self) -> bool {
        self.cpu.bus.cartridge.backup_dirty()
    }

    pub fn clear_backup_dirty(&mut self) {
        self.cpu.bus.cartridge.clear_backup_dirty();
    }
}

const _: () = assert!(FRAME_CYCLES == (LCD_WIDTH as u32 * 4 + 272) * (LCD_HEIGHT as u32 + 68));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitwise::Bits;
    use crate::bus::Access;
    use crate::cpu::cpu_modes::Mode;
    use pretty_assertions::assert_eq;

    fn assemble(ops: &[u32]) -> Vec<u8> {
        ops.iter().flat_map(|op| op.to_le_bytes()).collect()
    }

    fn gba_with_rom(rom: Vec<u8>) -> Gba {
        Gba::new(rom, None, None).unwrap()
    }

    fn gba() -> Gba {
        gba_with_rom(assemble(&[0xE1A0_0000; 64])) // NOPs
    }

    #[test]
    fn bios_skip_boot_state() {
        let gba = gba();
        assert_eq!(gba.cpu.registers.program_counter(), 0x0800_0000);
        assert_eq!(gba.cpu.registers.register_at(13), 0x0300_7F00);
        assert_eq!(gba.cpu.register_bank.r13_svc, 0x0300_7FE0);
        assert_eq!(gba.cpu.register_bank.r13_irq, 0x0300_7FA0);
        assert_eq!(gba.cpu.cpsr.mode(), Mode::User);
    }

    #[test]
    fn rejects_bad_bios_size() {
        assert!(matches!(
            Gba::new(vec![0; 4], Some(vec![0; 100]), None),
            Err(LoaderError::InvalidBiosSize(100))
        ));
    }

    #[test]
    fn mode3_bitmap_scenario() {
        let mut gba = gba();
        // White pixel at VRAM offset 0, mode 3, BG2 enabled.
        gba.cpu
            .bus
            .write_half_word(0x0600_0000, 0x7FFF, Access::NonSequential);
        gba.cpu
            .bus
            .write_half_word(0x0400_0000, 3 | (1 << 10), Access::NonSequential);
        gba.cpu.bus.take_cycles();

        // One scanline: the first framebuffer row is rendered at the
        // HBlank boundary.
        gba.run_for(1232);
        assert_eq!(gba.framebuffer()[0], 0xFFF8_F8F8);
    }

    #[test]
    fn timer_overflow_scenario() {
        let mut gba = gba();
        // TM0: reload 0xFFFE, prescaler 1, enable + IRQ.
        gba.cpu
            .bus
            .write_half_word(0x0400_0100, 0xFFFE, Access::NonSequential);
        gba.cpu
            .bus
            .write_byte(0x0400_0102, 0xC0, Access::NonSequential);
        gba.cpu.bus.take_cycles();

        gba.cpu.bus.run_timers(4);
        assert!(gba
            .cpu
            .bus
            .interrupt_control
            .interrupt_request
            .get_bit(Interrupt::Timer0 as u8));
        assert_eq!(gba.cpu.bus.timers.timers[0].counter, 0xFFFE);
    }

    #[test]
    fn hblank_dma_scenario() {
        let mut gba = gba();

        // 32 bytes of payload in WRAM.
        for i in 0..32u32 {
            gba.cpu
                .bus
                .write_byte(0x0200_0000 + i, i as u8, Access::NonSequential);
        }

        // DMA0: HBlank trigger, 16 halfwords, repeat.
        gba.cpu
            .bus
            .write_word(0x0400_00B0, 0x0200_0000, Access::NonSequential);
        gba.cpu
            .bus
            .write_word(0x0400_00B4, 0x0200_1000, Access::NonSequential);
        gba.cpu
            .bus
            .write_half_word(0x0400_00B8, 16, Access::NonSequential);
        gba.cpu.bus.write_half_word(
            0x0400_00BA,
            (1 << 15) | (1 << 9) | (2 << 12),
            Access::NonSequential,
        );
        gba.cpu.bus.take_cycles();

        gba.run_for(1232);

        for i in 0..32u32 {
            assert_eq!(
                gba.cpu
                    .bus
                    .read_byte(0x0200_1000 + i, Access::NonSequential),
                i as u8
            );
        }
        // Repeat keeps the channel enabled for the next line.
        assert!(gba.cpu.bus.dma.channels[0].enabled());
    }

    #[test]
    fn halt_wakes_on_enabled_interrupt() {
        let mut gba = gba();
        // Enable the VBlank interrupt line and its DISPSTAT source.
        gba.cpu
            .bus
            .write_half_word(0x0400_0200, 1, Access::NonSequential);
        gba.cpu
            .bus
            .write_byte(0x0400_0004, 1 << 3, Access::NonSequential);
        gba.cpu.bus.interrupt_control.halt_state = HaltState::Halt;
        gba.cpu.bus.take_cycles();

        // Run one frame: the CPU idles until VBlank, then resumes.
        gba.run_for(FRAME_CYCLES);
        assert_eq!(gba.cpu.bus.interrupt_control.halt_state, HaltState::Run);
    }

    #[test]
    fn stop_ignores_non_keypad_interrupts() {
        let mut gba = gba();
        gba.cpu
            .bus
            .write_half_word(0x0400_0200, 0x3FFF, Access::NonSequential);
        gba.cpu
            .bus
            .write_byte(0x0400_0004, 1 << 3, Access::NonSequential);
        gba.cpu.bus.interrupt_control.halt_state = HaltState::Stop;
        gba.cpu.bus.take_cycles();

        gba.run_for(FRAME_CYCLES);
        assert_eq!(gba.cpu.bus.interrupt_control.halt_state, HaltState::Stop);

        // KEYCNT: interrupt on A, and A goes down.
        gba.cpu.bus.keypad.key_interrupt_control = (1 << 14) | 1;
        gba.set_keys(0x03FF & !1);
        gba.run_for(16);
        assert_eq!(gba.cpu.bus.interrupt_control.halt_state, HaltState::Run);
    }

    #[test]
    fn frame_completes_within_budget() {
        let mut gba = gba();
        assert!(gba.run_for(2 * FRAME_CYCLES));
        // VCOUNT wrapped exactly once.
        assert!(gba.cpu.bus.lcd.vcount < 228);
    }

    #[test]
    fn swi_div_scenario_via_execution() {
        // MOV R0, #100; MOV R1, #7; SWI 0x06
        let mut gba = gba_with_rom(assemble(&[
            0xE3A0_0064, // MOV R0, #100
            0xE3A0_1007, // MOV R1, #7
            0xEF06_0000, // SWI #0x060000
            0xE1A0_0000,
            0xE1A0_0000,
        ]));

        for _ in 0..5 {
            gba.cpu.step();
        }
        assert_eq!(gba.cpu.registers.register_at(0), 14);
        assert_eq!(gba.cpu.registers.register_at(1), 2);
    }

    #[test]
    fn audio_samples_are_drained() {
        let mut gba = gba();
        // Direct sound A on timer 0, one byte in the FIFO.
        gba.cpu
            .bus
            .write_half_word(0x0400_0082, 0b11 << 8, Access::NonSequential);
        gba.cpu
            .bus
            .write_byte(0x0400_00A0, 0x40, Access::NonSequential);
        // TM0 overflowing every other cycle.
        gba.cpu
            .bus
            .write_half_word(0x0400_0100, 0xFFFE, Access::NonSequential);
        gba.cpu
            .bus
            .write_byte(0x0400_0102, 0x80, Access::NonSequential);
        gba.cpu.bus.take_cycles();

        gba.run_for(8);
        let samples = gba.drain_audio();
        assert!(!samples.is_empty());
        assert_eq!(samples[0], 0x4000);
        assert!(gba.drain_audio().is_empty());
    }
}
