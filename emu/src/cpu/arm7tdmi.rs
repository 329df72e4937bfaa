use logger::log;

use crate::bus::{Access, Bus};
use crate::cpu::arm::instructions::ArmModeInstruction;
use crate::cpu::cpu_modes::Mode;
use crate::cpu::psr::{CpuState, Psr};
use crate::cpu::register_bank::RegisterBank;
use crate::cpu::registers::Registers;
use crate::cpu::thumb::instruction::ThumbModeInstruction;

/// Exception vector addresses.
pub const VECTOR_UNDEFINED: u32 = 0x04;
pub const VECTOR_SWI: u32 = 0x08;
pub const VECTOR_IRQ: u32 = 0x18;

pub struct Arm7tdmi {
    pub bus: Bus,

    pub cpsr: Psr,
    /// SPSR of the current mode; meaningless in User/System.
    pub spsr: Psr,
    pub registers: Registers,
    pub register_bank: RegisterBank,

    /// Three staged opcodes keyed by the fetch counter: slot
    /// `fetch_count % 3` is being fetched, slot `(fetch_count - 2) % 3`
    /// is being executed once the pipeline is full.
    pipeline: [u32; 3],
    fetch_count: u32,
    flush: bool,

    /// No BIOS image was provided: SWIs are serviced by the
    /// high-level dispatcher instead of the Supervisor vector.
    pub(crate) hle_bios: bool,

    /// When set, every executed instruction is pushed to the log sink.
    pub trace: bool,
}

impl Arm7tdmi {
    pub fn new(bus: Bus, hle_bios: bool) -> Self {
        let mut cpu = Self {
            bus,
            cpsr: Psr::from(Mode::Supervisor),
            spsr: Psr::default(),
            registers: Registers::default(),
            register_bank: RegisterBank::default(),
            pipeline: [0; 3],
            fetch_count: 0,
            flush: false,
            hle_bios,
            trace: false,
        };
        cpu.reset();
        cpu
    }

    /// Re-initializes the register state to the post-BIOS boot layout:
    /// execution starts at the cartridge entry with the stacks the BIOS
    /// would have left behind.
    pub fn reset(&mut self) {
        self.registers = Registers::default();
        self.register_bank = RegisterBank::default();

        self.register_bank.r13_svc = 0x0300_7FE0;
        self.register_bank.r13_irq = 0x0300_7FA0;
        self.registers.set_register_at(13, 0x0300_7F00);
        self.registers.set_program_counter(0x0800_0000);

        self.cpsr = Psr::from(Mode::User);
        self.cpsr.set_cpu_state(CpuState::Arm);

        self.pipeline = [0; 3];
        self.fetch_count = 0;
        self.flush = false;
    }

    /// Requests a pipeline refill. Runs after any write to R15; the two
    /// prefetch steps happen before the next execute.
    pub fn flush_pipeline(&mut self) {
        self.flush = true;
    }

    /// One pipeline step: fetch at R15, execute the oldest staged opcode
    /// when the pipeline is full, then advance or refill. Returns the
    /// cycles consumed, fetch and data accesses included.
    pub fn step(&mut self) -> u32 {
        // Interrupts are sampled at instruction boundaries only. Entry
        // happens before this step's fetch, so the refill starts at the
        // vector right away.
        if self.fetch_count >= 2
            && !self.cpsr.irq_disable()
            && self.bus.interrupt_control.should_fire_irq()
        {
            self.signal_irq();
            self.fetch_count = 0;
            self.flush = false;
        }

        let access = if self.fetch_count == 0 {
            Access::NonSequential
        } else {
            Access::Sequential
        };

        match self.cpsr.cpu_state() {
            CpuState::Arm => {
                let pc = self.registers.program_counter() & !3;
                self.registers.set_program_counter(pc);

                let op_code = self.bus.read_word(pc, access);
                self.bus.notify_fetch(pc, op_code);
                self.pipeline[(self.fetch_count % 3) as usize] = op_code;

                if self.fetch_count >= 2 {
                    let staged = self.pipeline[((self.fetch_count - 2) % 3) as usize];
                    let instruction = ArmModeInstruction::from(staged);
                    if self.trace {
                        log(format!(
                            "{:08X}: {}",
                            pc.wrapping_sub(8),
                            instruction.disassembler()
                        ));
                    }
                    self.execute_arm(instruction);
                }
            }
            CpuState::Thumb => {
                let pc = self.registers.program_counter() & !1;
                self.registers.set_program_counter(pc);

                let op_code = self.bus.read_half_word(pc, access);
                self.bus.notify_fetch(pc, op_code as u32);
                self.pipeline[(self.fetch_count % 3) as usize] = op_code as u32;

                if self.fetch_count >= 2 {
                    let staged = self.pipeline[((self.fetch_count - 2) % 3) as usize] as u16;
                    let instruction = ThumbModeInstruction::from(staged);
                    if self.trace {
                        log(format!(
                            "{:08X}: {}",
                            pc.wrapping_sub(4),
                            instruction.disassembler()
                        ));
                    }
                    self.execute_thumb(instruction);
                }
            }
        }

        if self.flush {
            self.fetch_count = 0;
            self.flush = false;
        } else {
            let size = match self.cpsr.cpu_state() {
                CpuState::Arm => 4,
                CpuState::Thumb => 2,
            };
            self.registers
                .set_program_counter(self.registers.program_counter().wrapping_add(size));

            // The counter only distinguishes refill progress and the
            // three ring slots; 5 is congruent to 2.
            self.fetch_count += 1;
            if self.fetch_count == 5 {
                self.fetch_count = 2;
            }
        }

        self.bus.take_cycles()
    }

    /// Takes the IRQ exception. The link value is the instruction after
    /// the one that would execute next, so the conventional
    /// `SUBS PC, LR, #4` return resumes correctly in both states.
    pub fn signal_irq(&mut self) {
        let link = match self.cpsr.cpu_state() {
            CpuState::Arm => self.registers.program_counter().wrapping_sub(4),
            CpuState::Thumb => self.registers.program_counter(),
        };
        self.enter_exception(VECTOR_IRQ, Mode::Irq, link, false);
    }

    /// Exception entry: bank switch, SPSR capture, IRQ mask (FIQ too for
    /// the FIQ/Reset class), forced ARM state, jump to the vector.
    pub(crate) fn enter_exception(
        &mut self,
        vector: u32,
        mode: Mode,
        link: u32,
        disable_fiq: bool,
    ) {
        let old_cpsr = self.cpsr;

        self.swap_mode(mode);
        self.spsr = old_cpsr;
        self.registers.set_register_at(14, link);

        self.cpsr.set_irq_disable(true);
        if disable_fiq {
            self.cpsr.set_fiq_disable(true);
        }
        self.cpsr.set_cpu_state(CpuState::Arm);

        self.registers.set_program_counter(vector);
        self.flush_pipeline();
    }

    /// Rebinds the visible register window for `new_mode`. The window is
    /// determined solely by the mode bits: the outgoing mode's R13/R14
    /// (and R8-R12 around FIQ) are parked in the bank and the incoming
    /// mode's copies become visible, together with its SPSR.
    pub fn swap_mode(&mut self, new_mode: Mode) {
        if self.cpsr.mode() == new_mode {
            return;
        }

        match self.cpsr.mode() {
            // Leaving FIQ: store its whole bank and restore R8-R12 that
            // every other mode shares.
            Mode::Fiq => {
                self.register_bank.r8_fiq = self.registers.register_at(8);
                self.register_bank.r9_fiq = self.registers.register_at(9);
                self.register_bank.r10_fiq = self.registers.register_at(10);
                self.register_bank.r11_fiq = self.registers.register_at(11);
                self.register_bank.r12_fiq = self.registers.register_at(12);
                self.register_bank.r13_fiq = self.registers.register_at(13);
                self.register_bank.r14_fiq = self.registers.register_at(14);
                self.register_bank.spsr_fiq = self.spsr;

                self.registers.set_register_at(8, self.register_bank.r8_old);
                self.registers.set_register_at(9, self.register_bank.r9_old);
                self.registers
                    .set_register_at(10, self.register_bank.r10_old);
                self.registers
                    .set_register_at(11, self.register_bank.r11_old);
                self.registers
                    .set_register_at(12, self.register_bank.r12_old);
            }
            Mode::System | Mode::User => {
                self.register_bank.r13_old = self.registers.register_at(13);
                self.register_bank.r14_old = self.registers.register_at(14);
            }
            Mode::Supervisor => {
                self.register_bank.r13_svc = self.registers.register_at(13);
                self.register_bank.r14_svc = self.registers.register_at(14);
                self.register_bank.spsr_svc = self.spsr;
            }
            Mode::Abort => {
                self.register_bank.r13_abt = self.registers.register_at(13);
                self.register_bank.r14_abt = self.registers.register_at(14);
                self.register_bank.spsr_abt = self.spsr;
            }
            Mode::Irq => {
                self.register_bank.r13_irq = self.registers.register_at(13);
                self.register_bank.r14_irq = self.registers.register_at(14);
                self.register_bank.spsr_irq = self.spsr;
            }
            Mode::Undefined => {
                self.register_bank.r13_und = self.registers.register_at(13);
                self.register_bank.r14_und = self.registers.register_at(14);
                self.register_bank.spsr_und = self.spsr;
            }
        }

        match new_mode {
            Mode::Fiq => {
                self.register_bank.r8_old = self.registers.register_at(8);
                self.register_bank.r9_old = self.registers.register_at(9);
                self.register_bank.r10_old = self.registers.register_at(10);
                self.register_bank.r11_old = self.registers.register_at(11);
                self.register_bank.r12_old = self.registers.register_at(12);

                self.registers.set_register_at(8, self.register_bank.r8_fiq);
                self.registers.set_register_at(9, self.register_bank.r9_fiq);
                self.registers
                    .set_register_at(10, self.register_bank.r10_fiq);
                self.registers
                    .set_register_at(11, self.register_bank.r11_fiq);
                self.registers
                    .set_register_at(12, self.register_bank.r12_fiq);
                self.registers
                    .set_register_at(13, self.register_bank.r13_fiq);
                self.registers
                    .set_register_at(14, self.register_bank.r14_fiq);
                self.spsr = self.register_bank.spsr_fiq;
            }
            Mode::System | Mode::User => {
                self.registers
                    .set_register_at(13, self.register_bank.r13_old);
                self.registers
                    .set_register_at(14, self.register_bank.r14_old);
            }
            Mode::Supervisor => {
                self.registers
                    .set_register_at(13, self.register_bank.r13_svc);
                self.registers
                    .set_register_at(14, self.register_bank.r14_svc);
                self.spsr = self.register_bank.spsr_svc;
            }
            Mode::Abort => {
                self.registers
                    .set_register_at(13, self.register_bank.r13_abt);
                self.registers
                    .set_register_at(14, self.register_bank.r14_abt);
                self.spsr = self.register_bank.spsr_abt;
            }
            Mode::Irq => {
                self.registers
                    .set_register_at(13, self.register_bank.r13_irq);
                self.registers
                    .set_register_at(14, self.register_bank.r14_irq);
                self.spsr = self.register_bank.spsr_irq;
            }
            Mode::Undefined => {
                self.registers
                    .set_register_at(13, self.register_bank.r13_und);
                self.registers
                    .set_register_at(14, self.register_bank.r14_und);
                self.spsr = self.register_bank.spsr_und;
            }
        }

        self.cpsr.set_mode(new_mode);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use pretty_assertions::assert_eq;

    pub(crate) fn cpu_with_rom(rom: Vec<u8>) -> Arm7tdmi {
        let cartridge = Cartridge::new(rom, None).unwrap();
        Arm7tdmi::new(Bus::new(None, cartridge), true)
    }

    pub(crate) fn cpu() -> Arm7tdmi {
        cpu_with_rom(vec![0; 0x100])
    }

    /// Assembles a little-endian stream of 32-bit opcodes into ROM bytes.
    pub(crate) fn assemble(ops: &[u32]) -> Vec<u8> {
        ops.iter().flat_map(|op| op.to_le_bytes()).collect()
    }

    #[test]
    fn boot_state_skips_bios() {
        let cpu = cpu();
        assert_eq!(cpu.registers.program_counter(), 0x0800_0000);
        assert_eq!(cpu.registers.register_at(13), 0x0300_7F00);
        assert_eq!(cpu.register_bank.r13_svc, 0x0300_7FE0);
        assert_eq!(cpu.register_bank.r13_irq, 0x0300_7FA0);
        assert_eq!(cpu.cpsr.mode(), Mode::User);
        assert_eq!(cpu.cpsr.cpu_state(), CpuState::Arm);
    }

    #[test]
    fn observed_r15_is_two_instructions_ahead() {
        // MOV R0, R15 at 0x08000000.
        let mut cpu = cpu_with_rom(assemble(&[0xE1A0_000F, 0, 0]));
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!(cpu.registers.register_at(0), 0x0800_0008);
    }

    #[test]
    fn branch_refills_pipeline() {
        // B +8 (to 0x08000010), then padding, then MOV R1, #1 at target.
        let mut cpu = cpu_with_rom(assemble(&[
            0xEA00_0002, // B 0x08000010
            0xE3A0_1063, // MOV R1, #0x63 (skipped)
            0xE3A0_1063,
            0xE3A0_1063,
            0xE3A0_1001, // MOV R1, #1
        ]));

        cpu.step();
        cpu.step();
        cpu.step(); // executes the branch
        assert_eq!(cpu.registers.program_counter(), 0x0800_0010);

        // Two refill steps, then the target executes.
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!(cpu.registers.register_at(1), 1);
    }

    #[test]
    fn condition_failure_consumes_fetch_only() {
        // MOVEQ R1, #1 with Z clear: no effect.
        let mut cpu = cpu_with_rom(assemble(&[0x03A0_1001, 0, 0]));
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(1), 0);
    }

    #[test]
    fn swap_mode_banks_stacks() {
        let mut cpu = cpu();

        cpu.registers.set_register_at(13, 0x1111);
        cpu.swap_mode(Mode::Irq);
        assert_eq!(cpu.registers.register_at(13), 0x0300_7FA0);
        assert_eq!(cpu.cpsr.mode(), Mode::Irq);

        cpu.registers.set_register_at(13, 0x2222);
        cpu.swap_mode(Mode::User);
        assert_eq!(cpu.registers.register_at(13), 0x1111);
        assert_eq!(cpu.register_bank.r13_irq, 0x2222);
    }

    #[test]
    fn swap_mode_banks_fiq_registers() {
        let mut cpu = cpu();

        cpu.registers.set_register_at(8, 0xAA);
        cpu.registers.set_register_at(12, 0xBB);
        cpu.swap_mode(Mode::Fiq);
        cpu.registers.set_register_at(8, 0xCC);

        cpu.swap_mode(Mode::System);
        assert_eq!(cpu.registers.register_at(8), 0xAA);
        assert_eq!(cpu.registers.register_at(12), 0xBB);

        cpu.swap_mode(Mode::Fiq);
        assert_eq!(cpu.registers.register_at(8), 0xCC);
    }

    #[test]
    fn irq_entry_banks_and_vectors() {
        let mut cpu = cpu_with_rom(assemble(&[0xE1A0_0000; 8]));
        // Fill the pipeline.
        cpu.step();
        cpu.step();
        cpu.step();

        // VBlank enabled and pending.
        cpu.bus.interrupt_control.interrupt_enable = 1;
        cpu.bus.interrupt_control.interrupt_master_enable = 1;
        cpu.bus
            .interrupt_control
            .request(crate::cpu::hardware::interrupt_control::Interrupt::VBlank);

        let pc_before = cpu.registers.program_counter();
        cpu.step();

        assert_eq!(cpu.cpsr.mode(), Mode::Irq);
        assert!(cpu.cpsr.irq_disable());
        // Link register lets SUBS PC, LR, #4 resume at the next
        // unexecuted instruction.
        assert_eq!(cpu.registers.register_at(14), pc_before - 4);
        // The vector itself was fetched this step and R15 moved past it.
        assert_eq!(cpu.registers.program_counter(), VECTOR_IRQ + 4);
        // SPSR holds the interrupted flags.
        assert_eq!(cpu.spsr.mode(), Mode::User);
    }

    #[test]
    fn irq_is_masked_by_i_flag() {
        let mut cpu = cpu_with_rom(assemble(&[0xE1A0_0000; 8]));
        cpu.cpsr.set_irq_disable(true);
        for _ in 0..3 {
            cpu.step();
        }

        cpu.bus.interrupt_control.interrupt_enable = 1;
        cpu.bus.interrupt_control.interrupt_master_enable = 1;
        cpu.bus
            .interrupt_control
            .request(crate::cpu::hardware::interrupt_control::Interrupt::VBlank);

        cpu.step();
        assert_eq!(cpu.cpsr.mode(), Mode::User);
    }

    #[test]
    fn step_charges_bus_cycles() {
        let mut cpu = cpu();
        // First opcode fetch from ROM: 1N 32-bit = 8 cycles at default
        // waitstates.
        assert_eq!(cpu.step(), 8);
        // Sequential fetch: 2S = 6.
        assert_eq!(cpu.step(), 6);
    }
}
