//! The sixteen registers visible at any time. Which physical registers sit
//! behind R8-R14 depends on the CPU mode, see
//! [`RegisterBank`](super::register_bank::RegisterBank).
//!
//! Because of the 3-stage pipeline, R15 observed by an executing
//! instruction reads two fetches ahead of it: PC+8 in ARM state, PC+4 in
//! Thumb state. Writing R15 branches and flushes the pipeline.

use serde::{Deserialize, Serialize};

/// Stack Pointer register index.
pub const REG_SP: u32 = 0xD;

/// Link Register index (return address for subroutines).
pub const REG_LR: u32 = 0xE;

/// Program Counter register index.
pub const REG_PROGRAM_COUNTER: u32 = 0xF;

#[derive(Default, Serialize, Deserialize)]
pub struct Registers([u32; 16]);

impl Registers {
    pub fn program_counter(&self) -> u32 {
        self.0[15]
    }

    pub fn set_program_counter(&mut self, new_value: u32) {
        self.0[15] = new_value;
    }

    pub fn set_register_at(&mut self, reg: usize, new_value: u32) {
        debug_assert!(reg <= 15, "invalid register index: {reg}");
        self.0[reg] = new_value;
    }

    pub const fn register_at(&self, reg: usize) -> u32 {
        self.0[reg]
    }
}
