//! Program Status Registers (CPSR and SPSR).
//!
//! ```text
//! 31 30 29 28 27      8 7 6 5 4   0
//! ┌──┬──┬──┬──┬────────┬─┬─┬─┬─────┐
//! │N │Z │C │V │Reserved│I│F│T│Mode │
//! └──┴──┴──┴──┴────────┴─┴─┴─┴─────┘
//! ```
//!
//! Each exception mode has an SPSR which receives the CPSR on exception
//! entry; see `register_bank` for SPSR storage.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::cpu::{condition::Condition, cpu_modes::Mode};

/// ARM (32-bit opcodes) or Thumb (16-bit opcodes) state, bit 5 of the CPSR.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CpuState {
    Arm,
    Thumb,
}

/// Program Status Register (CPSR or SPSR).
///
/// Wraps the raw `u32` and provides type-safe accessors for the condition
/// flags (bits 28-31) and the control bits (mode, state, interrupt masks).
#[derive(Default, Clone, Copy, Serialize, Deserialize)]
pub struct Psr(u32);

impl Psr {
    pub(crate) fn can_execute(self, cond: Condition) -> bool {
        use Condition::{AL, CC, CS, EQ, GE, GT, HI, LE, LS, LT, MI, NE, NV, PL, VC, VS};
        match cond {
            EQ => self.zero_flag(),
            NE => !self.zero_flag(),
            CS => self.carry_flag(),
            CC => !self.carry_flag(),
            MI => self.sign_flag(),
            PL => !self.sign_flag(),
            VS => self.overflow_flag(),
            VC => !self.overflow_flag(),
            HI => self.carry_flag() && !self.zero_flag(),
            LS => !self.carry_flag() || self.zero_flag(),
            GE => self.sign_flag() == self.overflow_flag(),
            LT => self.sign_flag() != self.overflow_flag(),
            GT => !self.zero_flag() && (self.sign_flag() == self.overflow_flag()),
            LE => self.zero_flag() || (self.sign_flag() != self.overflow_flag()),
            AL => true,
            NV => false,
        }
    }

    /// N => Bit 31, (0=Not Signed, 1=Signed)
    #[must_use]
    pub fn sign_flag(self) -> bool {
        self.0.get_bit(31)
    }

    /// Z => Bit 30, (0=Not Zero, 1=Zero)
    #[must_use]
    pub fn zero_flag(self) -> bool {
        self.0.get_bit(30)
    }

    /// C => Bit 29, (0=Borrow/No Carry, 1=Carry/No Borrow)
    #[must_use]
    pub fn carry_flag(self) -> bool {
        self.0.get_bit(29)
    }

    /// V => Bit 28, (0=No Overflow, 1=Overflow)
    #[must_use]
    pub fn overflow_flag(self) -> bool {
        self.0.get_bit(28)
    }

    /// I => Bit 7, (0=Enable, 1=Disable)
    #[must_use]
    pub fn irq_disable(self) -> bool {
        self.0.get_bit(7)
    }

    /// F => Bit 6, (0=Enable, 1=Disable)
    #[must_use]
    pub fn fiq_disable(self) -> bool {
        self.0.get_bit(6)
    }

    /// T => Bit 5, (0=ARM, 1=THUMB)
    #[must_use]
    pub fn cpu_state(self) -> CpuState {
        if self.0.get_bit(5) {
            CpuState::Thumb
        } else {
            CpuState::Arm
        }
    }

    /// M4-M0 => Bits 4-0.
    ///
    /// The BIOS sometimes writes invalid mode values (like 0) to an SPSR;
    /// these normalize to Supervisor rather than aborting emulation.
    #[must_use]
    pub fn mode(self) -> Mode {
        let mode_bits = self.0 & 0b11111;
        Mode::try_from(mode_bits).unwrap_or_else(|_| {
            tracing::debug!(
                "invalid mode bits 0b{:05b} in PSR=0x{:08X}, defaulting to Supervisor",
                mode_bits,
                self.0
            );
            Mode::Supervisor
        })
    }

    pub fn set_sign_flag(&mut self, value: bool) {
        self.0.set_bit(31, value);
    }

    pub fn set_zero_flag(&mut self, value: bool) {
        self.0.set_bit(30, value);
    }

    pub fn set_carry_flag(&mut self, value: bool) {
        self.0.set_bit(29, value);
    }

    pub fn set_overflow_flag(&mut self, value: bool) {
        self.0.set_bit(28, value);
    }

    pub fn set_irq_disable(&mut self, value: bool) {
        self.0.set_bit(7, value);
    }

    pub fn set_fiq_disable(&mut self, value: bool) {
        self.0.set_bit(6, value);
    }

    pub fn set_cpu_state(&mut self, state: CpuState) {
        self.0.set_bit(5, matches!(state, CpuState::Thumb));
    }

    /// Rewrites the mode field only. The register window rebind is the
    /// caller's responsibility (`Arm7tdmi::swap_mode`).
    pub fn set_mode(&mut self, mode: Mode) {
        self.0 = (self.0 & !0b11111) | u32::from(mode);
    }
}

impl From<Mode> for Psr {
    fn from(mode: Mode) -> Self {
        Self(mode.into())
    }
}

impl From<u32> for Psr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Psr> for u32 {
    fn from(psr: Psr) -> Self {
        psr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_roundtrip() {
        let mut cpsr = Psr::default();

        cpsr.set_zero_flag(true);
        assert!(cpsr.zero_flag());

        cpsr.set_carry_flag(true);
        assert!(cpsr.carry_flag());

        cpsr.set_carry_flag(false);
        assert!(!cpsr.carry_flag());
    }

    #[test]
    fn condition_evaluation() {
        let mut cpsr = Psr::default();
        assert!(cpsr.can_execute(Condition::AL));
        assert!(!cpsr.can_execute(Condition::NV));
        assert!(!cpsr.can_execute(Condition::EQ));

        cpsr.set_zero_flag(true);
        assert!(cpsr.can_execute(Condition::EQ));
        assert!(cpsr.can_execute(Condition::LE));
        assert!(!cpsr.can_execute(Condition::GT));

        cpsr.set_sign_flag(true);
        cpsr.set_overflow_flag(false);
        assert!(cpsr.can_execute(Condition::LT));
        assert!(!cpsr.can_execute(Condition::GE));
    }

    #[test]
    fn mode_field() {
        let mut psr = Psr::from(Mode::Supervisor);
        assert_eq!(psr.mode(), Mode::Supervisor);

        psr.set_mode(Mode::Irq);
        assert_eq!(psr.mode(), Mode::Irq);
        assert_eq!(u32::from(psr) & 0b11111, 0b10010);
    }

    #[test]
    fn state_bit() {
        let mut psr = Psr::default();
        psr.set_cpu_state(CpuState::Thumb);
        assert_eq!(psr.cpu_state(), CpuState::Thumb);
        psr.set_cpu_state(CpuState::Arm);
        assert_eq!(psr.cpu_state(), CpuState::Arm);
    }
}
