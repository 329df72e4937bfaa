//! ARM data-processing vocabulary: the 16 ALU opcodes and the barrel
//! shifter that feeds their second operand.
//!
//! The logical/arithmetic split matters for how the carry flag is set:
//! logical operations take C from the barrel shifter, arithmetic ones from
//! the ALU itself.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::cpu::flags::ShiftKind;

/// The 16 data processing operations encoded in bits 24-21
/// of ARM data processing instructions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArmModeAluInstruction {
    /// Logical AND: `Rd = Rn AND Op2`
    And = 0x0,
    /// Exclusive OR: `Rd = Rn XOR Op2`
    Eor = 0x1,
    /// Subtract: `Rd = Rn - Op2`
    Sub = 0x2,
    /// Reverse Subtract: `Rd = Op2 - Rn`
    Rsb = 0x3,
    /// Add: `Rd = Rn + Op2`
    Add = 0x4,
    /// Add with Carry: `Rd = Rn + Op2 + C`
    Adc = 0x5,
    /// Subtract with Carry: `Rd = Rn - Op2 - !C`
    Sbc = 0x6,
    /// Reverse Subtract with Carry: `Rd = Op2 - Rn - !C`
    Rsc = 0x7,
    /// Test bits (AND, flags only, no result written)
    Tst = 0x8,
    /// Test Equivalence (XOR, flags only, no result written)
    Teq = 0x9,
    /// Compare (SUB, flags only, no result written)
    Cmp = 0xA,
    /// Compare Negative (ADD, flags only, no result written)
    Cmn = 0xB,
    /// Logical OR: `Rd = Rn OR Op2`
    Orr = 0xC,
    /// Move: `Rd = Op2` (Rn is ignored)
    Mov = 0xD,
    /// Bit Clear: `Rd = Rn AND NOT Op2`
    Bic = 0xE,
    /// Move Not: `Rd = NOT Op2` (Rn is ignored)
    Mvn = 0xF,
}

impl std::fmt::Display for ArmModeAluInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And => f.write_str("AND"),
            Self::Eor => f.write_str("EOR"),
            Self::Sub => f.write_str("SUB"),
            Self::Rsb => f.write_str("RSB"),
            Self::Add => f.write_str("ADD"),
            Self::Adc => f.write_str("ADC"),
            Self::Sbc => f.write_str("SBC"),
            Self::Rsc => f.write_str("RSC"),
            Self::Tst => f.write_str("TST"),
            Self::Teq => f.write_str("TEQ"),
            Self::Cmp => f.write_str("CMP"),
            Self::Cmn => f.write_str("CMN"),
            Self::Orr => f.write_str("ORR"),
            Self::Mov => f.write_str("MOV"),
            Self::Bic => f.write_str("BIC"),
            Self::Mvn => f.write_str("MVN"),
        }
    }
}

/// Classification of ALU instructions for flag handling.
#[derive(Eq, PartialEq, Debug)]
pub enum AluInstructionKind {
    /// Carry flag is set by the barrel shifter, not the ALU.
    Logical,
    /// Carry flag is set by the arithmetic operation itself.
    Arithmetic,
}

pub trait Kind {
    fn kind(&self) -> AluInstructionKind;
}

impl Kind for ArmModeAluInstruction {
    fn kind(&self) -> AluInstructionKind {
        use ArmModeAluInstruction::*;
        match &self {
            And | Eor | Tst | Teq | Orr | Mov | Bic | Mvn => AluInstructionKind::Logical,
            Sub | Rsb | Add | Adc | Sbc | Rsc | Cmp | Cmn => AluInstructionKind::Arithmetic,
        }
    }
}

impl From<u32> for ArmModeAluInstruction {
    fn from(alu_op_code: u32) -> Self {
        match alu_op_code {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Sub,
            0x3 => Self::Rsb,
            0x4 => Self::Add,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Rsc,
            0x8 => Self::Tst,
            0x9 => Self::Teq,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mov,
            0xE => Self::Bic,
            0xF => Self::Mvn,
            _ => unreachable!(),
        }
    }
}

/// Result of an ALU or shift operation, including the flags it produces.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default)]
pub struct ArithmeticOpResult {
    pub result: u32,
    /// Carry flag (C): last bit shifted out, or unsigned overflow.
    pub carry: bool,
    /// Overflow flag (V): signed arithmetic overflow.
    pub overflow: bool,
    /// Sign flag (N): bit 31 of result.
    pub sign: bool,
    /// Zero flag (Z): result is zero.
    pub zero: bool,
}

impl ArithmeticOpResult {
    /// Flags of a logical operation: N/Z from the result, C from the
    /// barrel shifter, V untouched.
    pub fn logical(result: u32, shifter_carry: bool) -> Self {
        Self {
            result,
            carry: shifter_carry,
            overflow: false,
            sign: result.get_bit(31),
            zero: result == 0,
        }
    }
}

/// Perform a barrel shifter operation.
///
/// Returns the shifted value and the carry-out; `overflow`/`sign`/`zero`
/// are not touched here.
///
/// Special encodings:
/// - `LSL #0`: no shift, carry unchanged
/// - `LSR #0`: encodes `LSR #32`, result 0, carry = bit 31
/// - `ASR #0`: encodes `ASR #32`, result sign-extended, carry = bit 31
/// - `ROR #0`: encodes `RRX`, rotate right through carry by 1
pub fn shift(kind: ShiftKind, shift_amount: u32, rm: u32, carry: bool) -> ArithmeticOpResult {
    match kind {
        ShiftKind::Lsl => {
            match shift_amount {
                // LSL#0: no shift performed, the C flag is NOT affected.
                0 => ArithmeticOpResult {
                    result: rm,
                    carry,
                    ..Default::default()
                },
                // LSL#1..32: normal left logical shift, done in u64 so
                // that an amount of exactly 32 is not reduced modulo 32.
                1..=32 => {
                    let wide = rm as u64;
                    ArithmeticOpResult {
                        result: (wide << shift_amount) as u32,
                        carry: rm.get_bit((32 - shift_amount) as u8),
                        ..Default::default()
                    }
                }
                // LSL#33...: result is 0 and carry is 0.
                _ => ArithmeticOpResult {
                    carry: false,
                    ..Default::default()
                },
            }
        }
        ShiftKind::Lsr => {
            match shift_amount {
                // LSR#0 is used to encode LSR#32: 0 result, carry = bit 31 of Rm.
                0 | 32 => ArithmeticOpResult {
                    result: 0,
                    carry: rm.get_bit(31),
                    ..Default::default()
                },
                1..=31 => ArithmeticOpResult {
                    result: rm >> shift_amount,
                    carry: rm.get_bit((shift_amount - 1) as u8),
                    ..Default::default()
                },
                _ => ArithmeticOpResult {
                    result: 0,
                    carry: false,
                    ..Default::default()
                },
            }
        }
        ShiftKind::Asr => match shift_amount {
            1..=31 => ArithmeticOpResult {
                result: ((rm as i32) >> shift_amount) as u32,
                carry: rm.get_bit((shift_amount - 1) as u8),
                ..Default::default()
            },
            // ASR#0 encodes ASR#32, and any amount >= 32 saturates to the
            // sign bit.
            _ => ArithmeticOpResult {
                result: ((rm as i32) >> 31) as u32,
                carry: rm.get_bit(31),
                ..Default::default()
            },
        },
        ShiftKind::Ror => {
            // ROR by n > 32 gives the same result and carry as ROR by
            // n-32, so reduce into 1..=32 first.
            let mut amount = shift_amount;
            if amount > 32 {
                amount %= 32;
                if amount == 0 {
                    amount = 32;
                }
            }

            match amount {
                // ROR#0 is used to encode RRX.
                0 => ArithmeticOpResult {
                    result: (rm >> 1) | ((carry as u32) << 31),
                    carry: rm.get_bit(0),
                    ..Default::default()
                },
                1..=31 => ArithmeticOpResult {
                    result: rm.rotate_right(amount),
                    carry: rm.get_bit((amount - 1) as u8),
                    ..Default::default()
                },
                // ROR#32 keeps rm but sets carry to bit 31.
                _ => ArithmeticOpResult {
                    result: rm,
                    carry: rm.get_bit(31),
                    ..Default::default()
                },
            }
        }
    }
}

/// The type of PSR transfer operation.
///
/// The field mask of `MsrFlg` selects which quarters of the PSR to modify:
/// bit 3 = flags (31-24), bit 0 = control (7-0); the two middle fields are
/// reserved on the ARM7TDMI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PsrOpKind {
    /// MRS: transfer PSR contents to a register.
    Mrs { destination_register: u32 },
    /// MSR: transfer register contents to PSR (all fields).
    Msr { source_register: u32 },
    /// MSR with field mask: transfer register/immediate to selected fields.
    MsrFlg {
        operand: AluSecondOperandInfo,
        field_mask: u32,
    },
}

impl TryFrom<u32> for PsrOpKind {
    type Error = String;

    fn try_from(op_code: u32) -> Result<Self, Self::Error> {
        if op_code.get_bits(23..=27) == 0b0_0010
            && op_code.get_bits(16..=21) == 0b00_1111
            && op_code.get_bits(0..=11) == 0b0000_0000_0000
        {
            Ok(Self::Mrs {
                destination_register: op_code.get_bits(12..=15),
            })
        } else if op_code.get_bits(23..=27) == 0b00010
            && op_code.get_bits(12..=21) == 0b10_1001_1111
            && op_code.get_bits(4..=11) == 0b0000_0000
        {
            Ok(Self::Msr {
                source_register: op_code.get_bits(0..=3),
            })
        } else if op_code.get_bits(26..=27) == 0b00
            && op_code.get_bits(23..=24) == 0b10
            && op_code.get_bits(20..=21) == 0b10
            && op_code.get_bits(12..=15) == 0b1111
        {
            Ok(Self::MsrFlg {
                operand: if op_code.get_bit(25) {
                    AluSecondOperandInfo::Immediate {
                        base: op_code.get_bits(0..=7),
                        shift: op_code.get_bits(8..=11) * 2,
                    }
                } else {
                    AluSecondOperandInfo::Register {
                        shift_op: ShiftOperator::Immediate(0),
                        shift_kind: ShiftKind::Lsl,
                        register: op_code.get_bits(0..=3),
                    }
                },
                field_mask: op_code.get_bits(16..=19),
            })
        } else {
            Err(format!("invalid PSR operation opcode: 0x{op_code:08X}"))
        }
    }
}

/// Which Program Status Register to access: the current one or the
/// exception-mode saved copy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PsrKind {
    Cpsr,
    Spsr,
}

impl From<bool> for PsrKind {
    fn from(value: bool) -> Self {
        if value {
            Self::Spsr
        } else {
            Self::Cpsr
        }
    }
}

impl std::fmt::Display for PsrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpsr => write!(f, "CPSR"),
            Self::Spsr => write!(f, "SPSR"),
        }
    }
}

/// How the shift amount of a register operand is specified: a 5-bit
/// immediate, or the bottom byte of another register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShiftOperator {
    Immediate(u32),
    Register(u32),
}

impl std::fmt::Display for ShiftOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate(value) => write!(f, "#{value}"),
            Self::Register(register) => write!(f, "R{register}"),
        }
    }
}

/// The flexible second operand of data processing instructions: a register
/// with an optional shift, or an 8-bit immediate rotated right by an even
/// amount.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AluSecondOperandInfo {
    Register {
        shift_op: ShiftOperator,
        shift_kind: ShiftKind,
        register: u32,
    },
    Immediate {
        base: u32,
        shift: u32,
    },
}

impl std::fmt::Display for AluSecondOperandInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Register {
                shift_op,
                shift_kind,
                register,
            } => {
                if let ShiftOperator::Immediate(0) = shift_op {
                    return match shift_kind {
                        ShiftKind::Lsl => write!(f, "R{register}"),
                        ShiftKind::Ror => write!(f, "R{register}, RRX"),
                        _ => write!(f, "R{register}, {shift_kind} #32"),
                    };
                }

                write!(f, "R{register}, {shift_kind} {shift_op}")
            }
            Self::Immediate { base, shift } => {
                write!(f, "#{}", base.rotate_right(shift))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_logical_instruction() {
        let instruction_kind = ArmModeAluInstruction::from(9).kind();

        assert_eq!(instruction_kind, AluInstructionKind::Logical);
    }

    #[test]
    fn test_arithmetic_instruction() {
        let instruction_kind = ArmModeAluInstruction::from(2).kind();

        assert_eq!(instruction_kind, AluInstructionKind::Arithmetic);
    }

    #[test]
    fn lsl_carry_out() {
        let r = shift(ShiftKind::Lsl, 1, 0x8000_0001, false);
        assert_eq!(r.result, 2);
        assert!(r.carry);

        let r = shift(ShiftKind::Lsl, 0, 0xFFFF_FFFF, true);
        assert_eq!(r.result, 0xFFFF_FFFF);
        assert!(r.carry);

        let r = shift(ShiftKind::Lsl, 32, 1, false);
        assert_eq!(r.result, 0);
        assert!(r.carry);

        let r = shift(ShiftKind::Lsl, 33, 0xFFFF_FFFF, true);
        assert_eq!(r.result, 0);
        assert!(!r.carry);
    }

    #[test]
    fn lsr_zero_encodes_32() {
        let r = shift(ShiftKind::Lsr, 0, 0x8000_0000, false);
        assert_eq!(r.result, 0);
        assert!(r.carry);
    }

    #[test]
    fn asr_saturates_to_sign() {
        let r = shift(ShiftKind::Asr, 0, 0x8000_0000, false);
        assert_eq!(r.result, 0xFFFF_FFFF);
        assert!(r.carry);

        let r = shift(ShiftKind::Asr, 4, 0x8000_0000, false);
        assert_eq!(r.result, 0xF800_0000);
        assert!(!r.carry);
    }

    #[test]
    fn ror_zero_is_rrx() {
        let r = shift(ShiftKind::Ror, 0, 0b11, true);
        assert_eq!(r.result, 0x8000_0001);
        assert!(r.carry);
    }

    #[test]
    fn ror_wraps_over_32() {
        let value = 0x1234_5678;
        let a = shift(ShiftKind::Ror, 36, value, false);
        let b = shift(ShiftKind::Ror, 4, value, false);
        assert_eq!(a.result, b.result);
        assert_eq!(a.carry, b.carry);
    }
}
