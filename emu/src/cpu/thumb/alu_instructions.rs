/// The 16 sub-operations of the Thumb ALU-register form (format 4).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ThumbModeAluInstruction {
    And = 0x0,
    Eor = 0x1,
    Lsl = 0x2,
    Lsr = 0x3,
    Asr = 0x4,
    Adc = 0x5,
    Sbc = 0x6,
    Ror = 0x7,
    Tst = 0x8,
    Neg = 0x9,
    Cmp = 0xA,
    Cmn = 0xB,
    Orr = 0xC,
    Mul = 0xD,
    Bic = 0xE,
    Mvn = 0xF,
}

impl From<u16> for ThumbModeAluInstruction {
    fn from(op: u16) -> Self {
        match op {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Lsl,
            0x3 => Self::Lsr,
            0x4 => Self::Asr,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Ror,
            0x8 => Self::Tst,
            0x9 => Self::Neg,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mul,
            0xE => Self::Bic,
            0xF => Self::Mvn,
            _ => unreachable!(),
        }
    }
}

impl std::fmt::Display for ThumbModeAluInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{self:?}").to_uppercase())
    }
}

/// High-register operations of Thumb format 5 (operands may be R8-R15).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ThumbHighRegisterOperation {
    Add,
    Cmp,
    Mov,
    BxOrBlx,
}

impl From<u16> for ThumbHighRegisterOperation {
    fn from(op: u16) -> Self {
        match op & 0b11 {
            0 => Self::Add,
            1 => Self::Cmp,
            2 => Self::Mov,
            _ => Self::BxOrBlx,
        }
    }
}

impl std::fmt::Display for ThumbHighRegisterOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => f.write_str("ADD"),
            Self::Cmp => f.write_str("CMP"),
            Self::Mov => f.write_str("MOV"),
            Self::BxOrBlx => f.write_str("BX"),
        }
    }
}

/// The four operations of the MOV/CMP/ADD/SUB-immediate form (format 3).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ThumbImmediateOperation {
    Mov = 0b00,
    Cmp = 0b01,
    Add = 0b10,
    Sub = 0b11,
}

impl From<u16> for ThumbImmediateOperation {
    fn from(op: u16) -> Self {
        match op & 0b11 {
            0b00 => Self::Mov,
            0b01 => Self::Cmp,
            0b10 => Self::Add,
            _ => Self::Sub,
        }
    }
}

impl std::fmt::Display for ThumbImmediateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mov => f.write_str("MOV"),
            Self::Cmp => f.write_str("CMP"),
            Self::Add => f.write_str("ADD"),
            Self::Sub => f.write_str("SUB"),
        }
    }
}
