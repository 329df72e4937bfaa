//! ARM7TDMI operating modes.
//!
//! Seven modes, stored in bits 0-4 of the CPSR. User is the only
//! unprivileged mode; the five exception modes each carry banked R13/R14
//! (FIQ additionally banks R8-R12) and an SPSR, see
//! [`register_bank`](super::register_bank).

use serde::{Deserialize, Serialize};

/// The CPU operating mode, stored in bits 0-4 of the CPSR/SPSR.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Mode {
    /// Normal program execution state (unprivileged).
    User = 0b10000,

    /// Fast Interrupt Request mode. Has the most banked registers
    /// (R8-R14). On GBA there is no external FIQ source.
    Fiq = 0b10001,

    /// Interrupt Request mode, entered on hardware IRQ
    /// (`VBlank`, `HBlank`, timers, DMA, keypad).
    Irq = 0b10010,

    /// Supervisor mode (privileged), entered via Reset or SWI.
    Supervisor = 0b10011,

    /// Abort mode, entered after a data or prefetch abort.
    Abort = 0b10111,

    /// Undefined instruction mode.
    Undefined = 0b11011,

    /// Privileged mode sharing the User register window.
    System = 0b11111,
}

impl From<Mode> for u32 {
    fn from(m: Mode) -> Self {
        m as Self
    }
}

impl TryFrom<u32> for Mode {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0b10000 => Ok(Self::User),
            0b10001 => Ok(Self::Fiq),
            0b10010 => Ok(Self::Irq),
            0b10011 => Ok(Self::Supervisor),
            0b10111 => Ok(Self::Abort),
            0b11011 => Ok(Self::Undefined),
            0b11111 => Ok(Self::System),
            _ => Err(String::from("Unexpected value for Mode")),
        }
    }
}

impl Mode {
    /// Exception modes own an SPSR; User/System do not.
    pub const fn has_spsr(self) -> bool {
        !matches!(self, Self::User | Self::System)
    }
}
