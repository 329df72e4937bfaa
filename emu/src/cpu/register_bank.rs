//! Banked register storage for the exception modes.
//!
//! The ARM7TDMI holds 37 physical registers: the 16 visible ones, the CPSR,
//! one SPSR per exception mode, R8-R14 duplicates for FIQ and R13/R14
//! duplicates for IRQ/SVC/ABT/UND. Only the slots shadowed by the current
//! mode live here; the active window stays in
//! [`Registers`](super::registers::Registers) and is rebound on mode change
//! by `Arm7tdmi::swap_mode`.
//!
//! ```text
//! Register │ User/Sys │  FIQ   │  IRQ   │  SVC   │ Abort  │ Undef  │
//! ─────────┼──────────┼────────┼────────┼────────┼────────┼────────┤
//!   R0-R7  │  R0-R7   │ R0-R7  │ R0-R7  │ R0-R7  │ R0-R7  │ R0-R7  │
//!   R8-R12 │  R8-R12  │ _fiq   │ R8-R12 │ R8-R12 │ R8-R12 │ R8-R12 │
//!   R13/R14│  shared  │ _fiq   │ _irq   │ _svc   │ _abt   │ _und   │
//!   SPSR   │   ---    │ _fiq   │ _irq   │ _svc   │ _abt   │ _und   │
//! ```

use serde::{Deserialize, Serialize};

use crate::cpu::psr::Psr;

/// Storage for banked registers across all CPU modes.
#[derive(Default, Serialize, Deserialize)]
pub struct RegisterBank {
    /// R8-R14 of User/System, parked here while FIQ's bank is visible.
    pub r8_old: u32,
    pub r9_old: u32,
    pub r10_old: u32,
    pub r11_old: u32,
    pub r12_old: u32,
    pub r13_old: u32,
    pub r14_old: u32,

    pub r8_fiq: u32,
    pub r9_fiq: u32,
    pub r10_fiq: u32,
    pub r11_fiq: u32,
    pub r12_fiq: u32,
    pub r13_fiq: u32,
    pub r14_fiq: u32,

    pub r13_svc: u32,
    pub r14_svc: u32,

    pub r13_abt: u32,
    pub r14_abt: u32,

    pub r13_irq: u32,
    pub r14_irq: u32,

    pub r13_und: u32,
    pub r14_und: u32,

    pub spsr_fiq: Psr,
    pub spsr_svc: Psr,
    pub spsr_abt: Psr,
    pub spsr_irq: Psr,
    pub spsr_und: Psr,
}
