use crate::bitwise::Bits;
use crate::cpu::arm::alu_instruction::{
    AluSecondOperandInfo, ArmModeAluInstruction, PsrKind, PsrOpKind, ShiftOperator,
};
use crate::cpu::condition::Condition;
use crate::cpu::flags::{
    HalfwordDataTransferOffsetKind, Indexing, LoadStoreKind, Offsetting, OperandKind,
    ReadWriteKind, ShiftKind,
};

/// Possible operation on transfer data.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SingleDataTransferKind {
    /// Load from memory into a register.
    Ldr,

    /// Store from a register into memory.
    Str,
}

impl From<u32> for SingleDataTransferKind {
    fn from(op_code: u32) -> Self {
        if op_code.get_bit(20) {
            Self::Ldr
        } else {
            Self::Str
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SingleDataTransferOffsetInfo {
    Immediate {
        offset: u32,
    },
    RegisterImmediate {
        shift_amount: u32,
        shift_kind: ShiftKind,
        reg_offset: u32,
    },
}

impl std::fmt::Display for SingleDataTransferOffsetInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate { offset } => write!(f, "#{offset}"),
            Self::RegisterImmediate {
                shift_amount,
                shift_kind,
                reg_offset,
            } => write!(f, "R{reg_offset}, {shift_kind} #{shift_amount}"),
        }
    }
}

/// The width of a halfword/signed transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HalfwordTransferKind {
    UnsignedHalfwords,
    SignedByte,
    SignedHalfwords,
}

impl From<u8> for HalfwordTransferKind {
    fn from(value: u8) -> Self {
        match value.get_bits(0..=1) {
            0b01 => Self::UnsignedHalfwords,
            0b10 => Self::SignedByte,
            0b11 => Self::SignedHalfwords,
            _ => unreachable!(),
        }
    }
}

impl std::fmt::Display for HalfwordTransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsignedHalfwords => f.write_str("H"),
            Self::SignedByte => f.write_str("SB"),
            Self::SignedHalfwords => f.write_str("SH"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArmModeMultiplyVariant {
    Mul,
    Mla,
}

impl From<u32> for ArmModeMultiplyVariant {
    fn from(op_code: u32) -> Self {
        match op_code.get_bits(21..=24) {
            0b0000 => Self::Mul,
            0b0001 => Self::Mla,
            _ => unreachable!(),
        }
    }
}

impl std::fmt::Display for ArmModeMultiplyVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mul => f.write_str("MUL"),
            Self::Mla => f.write_str("MLA"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArmModeMultiplyLongVariant {
    Umull,
    Umlal,
    Smull,
    Smlal,
}

impl From<u32> for ArmModeMultiplyLongVariant {
    fn from(op_code: u32) -> Self {
        match op_code.get_bits(21..=24) {
            0b0100 => Self::Umull,
            0b0101 => Self::Umlal,
            0b0110 => Self::Smull,
            0b0111 => Self::Smlal,
            _ => unreachable!(),
        }
    }
}

impl std::fmt::Display for ArmModeMultiplyLongVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Umull => f.write_str("UMULL"),
            Self::Umlal => f.write_str("UMLAL"),
            Self::Smull => f.write_str("SMULL"),
            Self::Smlal => f.write_str("SMLAL"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ArmModeInstruction {
    DataProcessing {
        condition: Condition,
        alu_instruction: ArmModeAluInstruction,
        set_conditions: bool,
        op_kind: OperandKind,
        rn: u32,
        destination: u32,
        op2: AluSecondOperandInfo,
    },
    Multiply {
        variant: ArmModeMultiplyVariant,
        condition: Condition,
        set_conditions: bool,
        rd_destination_register: u32,
        rn_accumulate_register: u32,
        rs_operand_register: u32,
        rm_operand_register: u32,
    },
    MultiplyLong {
        variant: ArmModeMultiplyLongVariant,
        condition: Condition,
        set_conditions: bool,
        rdhi_destination_register: u32,
        rdlo_destination_register: u32,
        rs_operand_register: u32,
        rm_operand_register: u32,
    },
    PSRTransfer {
        condition: Condition,
        psr_kind: PsrKind,
        kind: PsrOpKind,
    },
    SingleDataSwap {
        condition: Condition,
        quantity: ReadWriteKind,
        base_register: u32,
        destination_register: u32,
        source_register: u32,
    },
    BranchAndExchange {
        condition: Condition,
        register: usize,
    },
    HalfwordDataTransfer {
        condition: Condition,
        indexing: Indexing,
        offsetting: Offsetting,
        write_back: bool,
        load_store_kind: LoadStoreKind,
        offset_kind: HalfwordDataTransferOffsetKind,
        base_register: u32,
        source_destination_register: u32,
        transfer_kind: HalfwordTransferKind,
    },
    SingleDataTransfer {
        condition: Condition,
        kind: SingleDataTransferKind,
        quantity: ReadWriteKind,
        write_back: bool,
        indexing: Indexing,
        rd: u32,
        base_register: u32,
        offset_info: SingleDataTransferOffsetInfo,
        offsetting: Offsetting,
    },
    Undefined,
    BlockDataTransfer {
        condition: Condition,
        indexing: Indexing,
        offsetting: Offsetting,
        load_psr: bool,
        write_back: bool,
        load_store: LoadStoreKind,
        rn: u32,
        register_list: u32,
    },
    Branch {
        condition: Condition,
        link: bool,
        offset: u32,
    },
    /// Coprocessor traffic. The GBA has no coprocessors, so these decode
    /// for the disassembler but execute as undefined.
    Coprocessor,
    SoftwareInterrupt {
        condition: Condition,
        comment: u32,
    },
}

impl From<u32> for ArmModeInstruction {
    fn from(op_code: u32) -> Self {
        use ArmModeInstruction::*;

        let condition = Condition::from(op_code.get_bits(28..=31) as u8);
        // The order is based on how many bits are already known at decoding
        // time: patterns that pin more bits are matched first so they are
        // not swallowed by the broader classes.
        if op_code.get_bits(4..=27) == 0b0001_0010_1111_1111_1111_0001 {
            BranchAndExchange {
                condition,
                register: op_code.get_bits(0..=3) as usize,
            }
        } else if op_code.get_bits(23..=27) == 0b00010
            && op_code.get_bits(20..=21) == 0b00
            && op_code.get_bits(4..=11) == 0b0000_1001
        {
            SingleDataSwap {
                condition,
                quantity: op_code.get_bit(22).into(),
                base_register: op_code.get_bits(16..=19),
                destination_register: op_code.get_bits(12..=15),
                source_register: op_code.get_bits(0..=3),
            }
        } else if op_code.get_bits(23..=27) == 0b00001 && op_code.get_bits(4..=7) == 0b1001 {
            MultiplyLong {
                variant: ArmModeMultiplyLongVariant::from(op_code),
                condition,
                set_conditions: op_code.get_bit(20),
                rdhi_destination_register: op_code.get_bits(16..=19),
                rdlo_destination_register: op_code.get_bits(12..=15),
                rs_operand_register: op_code.get_bits(8..=11),
                rm_operand_register: op_code.get_bits(0..=3),
            }
        } else if op_code.get_bits(22..=27) == 0b000000 && op_code.get_bits(4..=7) == 0b1001 {
            Multiply {
                variant: ArmModeMultiplyVariant::from(op_code),
                condition,
                set_conditions: op_code.get_bit(20),
                rd_destination_register: op_code.get_bits(16..=19),
                rn_accumulate_register: op_code.get_bits(12..=15),
                rs_operand_register: op_code.get_bits(8..=11),
                rm_operand_register: op_code.get_bits(0..=3),
            }
        } else if op_code.get_bits(25..=27) == 0b000
            && op_code.get_bit(7)
            && op_code.get_bit(4)
            && op_code.get_bits(5..=6) != 0b00
        {
            let operand_kind: OperandKind = op_code.get_bit(22).into();

            HalfwordDataTransfer {
                condition,
                indexing: op_code.get_bit(24).into(),
                offsetting: op_code.get_bit(23).into(),
                write_back: op_code.get_bit(21),
                load_store_kind: op_code.get_bit(20).into(),
                offset_kind: if operand_kind == OperandKind::Immediate {
                    let immediate_offset_high = op_code.get_bits(8..=11);
                    let immediate_offset_low = op_code.get_bits(0..=3);
                    HalfwordDataTransferOffsetKind::Immediate {
                        offset: (immediate_offset_high << 4) | immediate_offset_low,
                    }
                } else {
                    HalfwordDataTransferOffsetKind::Register {
                        register: op_code.get_bits(0..=3),
                    }
                },
                base_register: op_code.get_bits(16..=19),
                source_destination_register: op_code.get_bits(12..=15),
                transfer_kind: HalfwordTransferKind::from(op_code.get_bits(5..=6) as u8),
            }
        } else if op_code.get_bits(25..=27) == 0b011 && op_code.get_bit(4) {
            Undefined
        } else if op_code.get_bits(24..=27) == 0b1111 {
            SoftwareInterrupt {
                condition,
                comment: op_code.get_bits(0..=23),
            }
        } else if op_code.get_bits(25..=27) == 0b110 || op_code.get_bits(24..=27) == 0b1110 {
            Coprocessor
        } else if op_code.get_bits(25..=27) == 0b100 {
            BlockDataTransfer {
                condition,
                indexing: op_code.get_bit(24).into(),
                offsetting: op_code.get_bit(23).into(),
                load_psr: op_code.get_bit(22),
                write_back: op_code.get_bit(21),
                load_store: op_code.get_bit(20).into(),
                rn: op_code.get_bits(16..=19),
                register_list: op_code.get_bits(0..=15),
            }
        } else if op_code.get_bits(25..=27) == 0b101 {
            Branch {
                condition,
                link: op_code.get_bit(24),
                offset: op_code.get_bits(0..=23) << 2,
            }
        } else if op_code.get_bits(26..=27) == 0b01 {
            // In this class the I bit meaning is inverted with respect to
            // data processing: I=0 is an immediate offset.
            let offset_info = if op_code.get_bit(25) {
                SingleDataTransferOffsetInfo::RegisterImmediate {
                    shift_amount: op_code.get_bits(7..=11),
                    shift_kind: op_code.get_bits(5..=6).into(),
                    reg_offset: op_code.get_bits(0..=3),
                }
            } else {
                SingleDataTransferOffsetInfo::Immediate {
                    offset: op_code.get_bits(0..=11),
                }
            };

            SingleDataTransfer {
                condition,
                kind: op_code.into(),
                quantity: op_code.into(),
                write_back: op_code.get_bit(21),
                indexing: op_code.get_bit(24).into(),
                rd: op_code.get_bits(12..=15),
                base_register: op_code.get_bits(16..=19),
                offset_info,
                offsetting: op_code.get_bit(23).into(),
            }
        } else if op_code.get_bits(26..=27) == 0b00 {
            if let Ok(kind) = PsrOpKind::try_from(op_code) {
                return PSRTransfer {
                    condition,
                    psr_kind: PsrKind::from(op_code.get_bit(22)),
                    kind,
                };
            }

            let op_kind: OperandKind = op_code.get_bit(25).into();
            let op2 = if op_kind == OperandKind::Immediate {
                AluSecondOperandInfo::Immediate {
                    base: op_code.get_bits(0..=7),
                    shift: op_code.get_bits(8..=11) * 2,
                }
            } else {
                AluSecondOperandInfo::Register {
                    shift_op: if op_code.get_bit(4) {
                        ShiftOperator::Register(op_code.get_bits(8..=11))
                    } else {
                        ShiftOperator::Immediate(op_code.get_bits(7..=11))
                    },
                    shift_kind: op_code.get_bits(5..=6).into(),
                    register: op_code.get_bits(0..=3),
                }
            };

            DataProcessing {
                condition,
                alu_instruction: op_code.get_bits(21..=24).into(),
                set_conditions: op_code.get_bit(20),
                op_kind,
                rn: op_code.get_bits(16..=19),
                destination: op_code.get_bits(12..=15),
                op2,
            }
        } else {
            Undefined
        }
    }
}

impl ArmModeInstruction {
    pub(crate) fn disassembler(&self) -> String {
        match self {
            Self::DataProcessing {
                condition,
                alu_instruction,
                set_conditions,
                op_kind: _,
                rn,
                destination,
                op2,
            } => {
                let set_string = if *set_conditions { "S" } else { "" };
                use ArmModeAluInstruction::*;
                match alu_instruction {
                    And | Eor | Sub | Rsb | Add | Adc | Sbc | Rsc | Orr | Bic => format!(
                        "{alu_instruction}{condition}{set_string} R{destination}, R{rn}, {op2}"
                    ),
                    Tst | Teq | Cmp | Cmn => format!("{alu_instruction}{condition} R{rn}, {op2}"),
                    Mov | Mvn => {
                        format!("{alu_instruction}{condition}{set_string} R{destination}, {op2}")
                    }
                }
            }
            Self::Multiply {
                variant,
                condition,
                set_conditions,
                rd_destination_register,
                rn_accumulate_register,
                rs_operand_register,
                rm_operand_register,
            } => {
                let s = if *set_conditions { "S" } else { "" };
                match variant {
                    ArmModeMultiplyVariant::Mul => format!(
                        "MUL{condition}{s} R{rd_destination_register}, R{rm_operand_register}, R{rs_operand_register}"
                    ),
                    ArmModeMultiplyVariant::Mla => format!(
                        "MLA{condition}{s} R{rd_destination_register}, R{rm_operand_register}, R{rs_operand_register}, R{rn_accumulate_register}"
                    ),
                }
            }
            Self::MultiplyLong {
                variant,
                condition,
                set_conditions,
                rdhi_destination_register,
                rdlo_destination_register,
                rs_operand_register,
                rm_operand_register,
            } => {
                let s = if *set_conditions { "S" } else { "" };
                format!(
                    "{variant}{condition}{s} R{rdlo_destination_register}, R{rdhi_destination_register}, R{rm_operand_register}, R{rs_operand_register}"
                )
            }
            Self::PSRTransfer {
                condition,
                psr_kind,
                kind,
            } => match kind {
                PsrOpKind::Mrs {
                    destination_register,
                } => {
                    format!("MRS{condition} R{destination_register}, {psr_kind}")
                }
                PsrOpKind::Msr { source_register } => {
                    format!("MSR{condition} {psr_kind}, R{source_register}")
                }
                PsrOpKind::MsrFlg { operand, .. } => {
                    format!("MSR{condition} {psr_kind}_flg, {operand}")
                }
            },
            Self::SingleDataSwap {
                condition,
                quantity,
                base_register,
                destination_register,
                source_register,
            } => {
                let b = match quantity {
                    ReadWriteKind::Word => "",
                    ReadWriteKind::Byte => "B",
                };
                format!(
                    "SWP{condition}{b} R{destination_register}, R{source_register}, [R{base_register}]"
                )
            }
            Self::BranchAndExchange {
                condition,
                register,
            } => format!("BX{condition} R{register}"),
            Self::HalfwordDataTransfer {
                condition,
                indexing,
                offsetting,
                load_store_kind,
                transfer_kind,
                source_destination_register,
                offset_kind,
                base_register,
                write_back,
                ..
            } => {
                let sign = match offsetting {
                    Offsetting::Up => "+",
                    Offsetting::Down => "-",
                };

                let offset = match offset_kind {
                    HalfwordDataTransferOffsetKind::Immediate { offset } => {
                        if *offset == 0 {
                            String::new()
                        } else {
                            format!(",#{sign}{offset}")
                        }
                    }
                    HalfwordDataTransferOffsetKind::Register { register } => {
                        format!(",{sign}R{register}")
                    }
                };

                let w = if *write_back { "!" } else { "" };

                let address = match indexing {
                    Indexing::Pre => format!("[R{base_register}{offset}{w}]"),
                    Indexing::Post => format!("[R{base_register}]{offset}"),
                };

                format!(
                    "{load_store_kind}{condition}{transfer_kind} R{source_destination_register}, {address}"
                )
            }
            Self::SingleDataTransfer {
                condition,
                kind,
                quantity,
                rd,
                offset_info,
                ..
            } => {
                let b = match quantity {
                    ReadWriteKind::Word => "",
                    ReadWriteKind::Byte => "B",
                };

                let op = match kind {
                    SingleDataTransferKind::Ldr => "LDR",
                    SingleDataTransferKind::Str => "STR",
                };

                format!("{op}{condition}{b} R{rd}, {offset_info}")
            }
            Self::Undefined => "UNDEF".to_string(),
            Self::BlockDataTransfer {
                condition,
                indexing,
                offsetting,
                load_psr,
                write_back,
                load_store,
                rn,
                register_list,
            } => {
                let op = match load_store {
                    LoadStoreKind::Store => "STM",
                    LoadStoreKind::Load => "LDM",
                };

                let offset_modifier = match offsetting {
                    Offsetting::Down => "D",
                    Offsetting::Up => "I",
                };
                let index_type = match indexing {
                    Indexing::Pre => "B",
                    Indexing::Post => "A",
                };

                let mut registers = String::new();
                for i in 0..=15 {
                    if register_list.get_bit(i) {
                        registers.push_str(&format!("R{i}, "));
                    }
                }

                let w = if *write_back { "!" } else { "" };
                let f = if *load_psr { "^" } else { "" };
                format!("{op}{condition}{offset_modifier}{index_type}, R{rn}{w} {{{registers}}}{f}")
            }
            Self::Branch {
                condition,
                link,
                offset,
            } => {
                let link = if *link { "L" } else { "" };
                format!("B{link}{condition} 0x{offset:08X}")
            }
            Self::Coprocessor => "CDP".to_string(),
            Self::SoftwareInterrupt { condition, comment } => {
                format!("SWI{condition} #{comment:#X}")
            }
        }
    }
}

impl std::fmt::Display for ArmModeInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.disassembler())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_branch_and_exchange() {
        let output = ArmModeInstruction::from(0xE12F_FF11);
        assert_eq!(
            output,
            ArmModeInstruction::BranchAndExchange {
                condition: Condition::AL,
                register: 1
            }
        );
        assert_eq!(output.disassembler(), "BX R1");
    }

    #[test]
    fn decode_branch_with_link() {
        let output = ArmModeInstruction::from(0xEB00_0005);
        assert_eq!(
            output,
            ArmModeInstruction::Branch {
                condition: Condition::AL,
                link: true,
                offset: 20,
            }
        );
    }

    #[test]
    fn decode_software_interrupt() {
        let output = ArmModeInstruction::from(0xEF00_0006);
        assert_eq!(
            output,
            ArmModeInstruction::SoftwareInterrupt {
                condition: Condition::AL,
                comment: 6,
            }
        );
        assert_eq!(output.disassembler(), "SWI #0x6");
    }

    #[test]
    fn decode_data_processing() {
        // ADD R1, R2, #4
        let output = ArmModeInstruction::from(0xE282_1004);
        assert_eq!(
            output,
            ArmModeInstruction::DataProcessing {
                condition: Condition::AL,
                alu_instruction: ArmModeAluInstruction::Add,
                set_conditions: false,
                op_kind: OperandKind::Immediate,
                rn: 2,
                destination: 1,
                op2: AluSecondOperandInfo::Immediate { base: 4, shift: 0 },
            }
        );
        assert_eq!(output.disassembler(), "ADD R1, R2, #4");
    }

    #[test]
    fn decode_msr_is_not_teq() {
        // MSR CPSR, R0 shares the TEQ opcode space without the S bit.
        let output = ArmModeInstruction::from(0xE129_F000);
        assert_eq!(
            output,
            ArmModeInstruction::PSRTransfer {
                condition: Condition::AL,
                psr_kind: PsrKind::Cpsr,
                kind: PsrOpKind::Msr { source_register: 0 },
            }
        );
    }

    #[test]
    fn decode_multiply() {
        // MUL R0, R1, R2
        let output = ArmModeInstruction::from(0xE000_0291);
        assert_eq!(
            output,
            ArmModeInstruction::Multiply {
                variant: ArmModeMultiplyVariant::Mul,
                condition: Condition::AL,
                set_conditions: false,
                rd_destination_register: 0,
                rn_accumulate_register: 0,
                rs_operand_register: 2,
                rm_operand_register: 1,
            }
        );
    }

    #[test]
    fn decode_single_data_swap() {
        // SWP R0, R1, [R2]
        let output = ArmModeInstruction::from(0xE102_0091);
        assert_eq!(
            output,
            ArmModeInstruction::SingleDataSwap {
                condition: Condition::AL,
                quantity: ReadWriteKind::Word,
                base_register: 2,
                destination_register: 0,
                source_register: 1,
            }
        );
    }

    #[test]
    fn decode_halfword_transfer() {
        // LDRH R0, [R1, #2]
        let output = ArmModeInstruction::from(0xE1D1_00B2);
        assert_eq!(
            output,
            ArmModeInstruction::HalfwordDataTransfer {
                condition: Condition::AL,
                indexing: Indexing::Pre,
                offsetting: Offsetting::Up,
                write_back: false,
                load_store_kind: LoadStoreKind::Load,
                offset_kind: HalfwordDataTransferOffsetKind::Immediate { offset: 2 },
                base_register: 1,
                source_destination_register: 0,
                transfer_kind: HalfwordTransferKind::UnsignedHalfwords,
            }
        );
    }

    #[test]
    fn decode_block_data_transfer() {
        // STMFD R13!, {R0, R1, R14}
        let output = ArmModeInstruction::from(0xE92D_4003);
        assert_eq!(
            output,
            ArmModeInstruction::BlockDataTransfer {
                condition: Condition::AL,
                indexing: Indexing::Pre,
                offsetting: Offsetting::Down,
                load_psr: false,
                write_back: true,
                load_store: LoadStoreKind::Store,
                rn: 13,
                register_list: 0b0100_0000_0000_0011,
            }
        );
    }
}
