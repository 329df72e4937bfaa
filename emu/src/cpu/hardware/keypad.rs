use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Keypad input and keypad interrupt control.
///
/// KEYINPUT is active-low: bits 0..9 = A, B, SELECT, START, RIGHT, LEFT,
/// UP, DOWN, R, L; 0 means pressed. The host rewrites it once per frame.
#[derive(Serialize, Deserialize)]
pub struct Keypad {
    /// KEYINPUT (0x04000130, read-only).
    pub key_input: u16,
    /// KEYCNT (0x04000132).
    pub key_interrupt_control: u16,
}

impl Default for Keypad {
    fn default() -> Self {
        Self {
            // All ten buttons released.
            key_input: 0x03FF,
            key_interrupt_control: 0,
        }
    }
}

impl Keypad {
    /// Evaluates the KEYCNT condition against the current input state.
    /// Bit 14 enables the interrupt; bit 15 selects AND (all selected keys
    /// down) versus OR (any selected key down).
    pub fn interrupt_condition_met(&self) -> bool {
        if !self.key_interrupt_control.get_bit(14) {
            return false;
        }

        let selected = self.key_interrupt_control.get_bits(0..=9);
        // Invert the active-low input to reason about pressed keys.
        let pressed = !self.key_input & 0x03FF;

        if self.key_interrupt_control.get_bit(15) {
            selected != 0 && (pressed & selected) == selected
        } else {
            (pressed & selected) != 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or_condition() {
        let mut keypad = Keypad::default();
        keypad.key_interrupt_control = (1 << 14) | 0b11; // IRQ on A or B

        assert!(!keypad.interrupt_condition_met());

        keypad.key_input = 0x03FF & !0b10; // B pressed
        assert!(keypad.interrupt_condition_met());
    }

    #[test]
    fn and_condition() {
        let mut keypad = Keypad::default();
        keypad.key_interrupt_control = (1 << 15) | (1 << 14) | 0b11; // A and B

        keypad.key_input = 0x03FF & !0b10;
        assert!(!keypad.interrupt_condition_met());

        keypad.key_input = 0x03FF & !0b11;
        assert!(keypad.interrupt_condition_met());
    }

    #[test]
    fn disabled_never_fires() {
        let mut keypad = Keypad::default();
        keypad.key_interrupt_control = 0b11;
        keypad.key_input = 0;
        assert!(!keypad.interrupt_condition_met());
    }
}
