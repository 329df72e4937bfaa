use crate::bitwise::{sign_extend, Bits};
use crate::bus::Access;
use crate::cpu::arm::alu_instruction::{
    shift, AluInstructionKind, AluSecondOperandInfo, ArithmeticOpResult, ArmModeAluInstruction,
    Kind, PsrKind, PsrOpKind, ShiftOperator,
};
use crate::cpu::arm::instructions::{
    ArmModeInstruction, ArmModeMultiplyLongVariant, ArmModeMultiplyVariant, HalfwordTransferKind,
    SingleDataTransferKind, SingleDataTransferOffsetInfo,
};
use crate::cpu::arm7tdmi::{Arm7tdmi, VECTOR_SWI, VECTOR_UNDEFINED};
use crate::cpu::cpu_modes::Mode;
use crate::cpu::flags::{
    HalfwordDataTransferOffsetKind, Indexing, LoadStoreKind, Offsetting, ReadWriteKind,
};
use crate::cpu::psr::{CpuState, Psr};
use crate::cpu::registers::REG_PROGRAM_COUNTER;

pub const SIZE_OF_ARM_INSTRUCTION: u32 = 4;

impl Arm7tdmi {
    pub(crate) fn execute_arm(&mut self, instruction: ArmModeInstruction) {
        let condition = match instruction {
            ArmModeInstruction::DataProcessing { condition, .. }
            | ArmModeInstruction::Multiply { condition, .. }
            | ArmModeInstruction::MultiplyLong { condition, .. }
            | ArmModeInstruction::PSRTransfer { condition, .. }
            | ArmModeInstruction::SingleDataSwap { condition, .. }
            | ArmModeInstruction::BranchAndExchange { condition, .. }
            | ArmModeInstruction::HalfwordDataTransfer { condition, .. }
            | ArmModeInstruction::SingleDataTransfer { condition, .. }
            | ArmModeInstruction::BlockDataTransfer { condition, .. }
            | ArmModeInstruction::Branch { condition, .. }
            | ArmModeInstruction::SoftwareInterrupt { condition, .. } => condition,
            ArmModeInstruction::Undefined | ArmModeInstruction::Coprocessor => {
                crate::cpu::condition::Condition::AL
            }
        };

        if !self.cpsr.can_execute(condition) {
            return;
        }

        match instruction {
            ArmModeInstruction::DataProcessing {
                condition: _,
                alu_instruction,
                set_conditions,
                op_kind: _,
                rn,
                destination,
                op2,
            } => self.data_processing(alu_instruction, set_conditions, rn, destination, op2),
            ArmModeInstruction::Multiply {
                variant,
                set_conditions,
                rd_destination_register,
                rn_accumulate_register,
                rs_operand_register,
                rm_operand_register,
                ..
            } => self.multiply(
                variant,
                set_conditions,
                rd_destination_register,
                rn_accumulate_register,
                rs_operand_register,
                rm_operand_register,
            ),
            ArmModeInstruction::MultiplyLong {
                variant,
                set_conditions,
                rdhi_destination_register,
                rdlo_destination_register,
                rs_operand_register,
                rm_operand_register,
                ..
            } => self.multiply_long(
                variant,
                set_conditions,
                rdhi_destination_register,
                rdlo_destination_register,
                rs_operand_register,
                rm_operand_register,
            ),
            ArmModeInstruction::PSRTransfer {
                psr_kind, kind, ..
            } => self.psr_transfer(kind, psr_kind),
            ArmModeInstruction::SingleDataSwap {
                quantity,
                base_register,
                destination_register,
                source_register,
                ..
            } => self.single_data_swap(
                quantity,
                base_register,
                destination_register,
                source_register,
            ),
            ArmModeInstruction::BranchAndExchange { register, .. } => {
                self.branch_and_exchange(register)
            }
            ArmModeInstruction::HalfwordDataTransfer {
                indexing,
                offsetting,
                write_back,
                load_store_kind,
                offset_kind,
                base_register,
                source_destination_register,
                transfer_kind,
                ..
            } => self.half_word_data_transfer(
                indexing,
                offsetting,
                write_back,
                load_store_kind,
                offset_kind,
                base_register,
                source_destination_register,
                transfer_kind,
            ),
            ArmModeInstruction::SingleDataTransfer {
                kind,
                quantity,
                write_back,
                indexing,
                rd,
                base_register,
                offset_info,
                offsetting,
                ..
            } => self.single_data_transfer(
                kind,
                quantity,
                write_back,
                indexing,
                rd,
                base_register,
                offset_info,
                offsetting,
            ),
            ArmModeInstruction::BlockDataTransfer {
                indexing,
                offsetting,
                load_psr,
                write_back,
                load_store,
                rn,
                register_list,
                ..
            } => self.block_data_transfer(
                indexing,
                offsetting,
                load_psr,
                write_back,
                load_store,
                rn,
                register_list,
            ),
            ArmModeInstruction::Branch { link, offset, .. } => self.branch(link, offset),
            ArmModeInstruction::Undefined | ArmModeInstruction::Coprocessor => {
                self.undefined_exception();
            }
            ArmModeInstruction::SoftwareInterrupt { comment, .. } => {
                // The BIOS call number rides in bits 16-23 of the comment
                // field in ARM state.
                self.software_interrupt((comment >> 16) as u8);
            }
        }
    }

    pub(crate) fn undefined_exception(&mut self) {
        let link = self
            .registers
            .program_counter()
            .wrapping_sub(SIZE_OF_ARM_INSTRUCTION);
        self.enter_exception(VECTOR_UNDEFINED, Mode::Undefined, link, false);
    }

    pub(crate) fn software_interrupt(&mut self, number: u8) {
        if self.hle_bios {
            self.swi_hle(number);
            return;
        }

        let link = match self.cpsr.cpu_state() {
            CpuState::Arm => self.registers.program_counter().wrapping_sub(4),
            CpuState::Thumb => self.registers.program_counter().wrapping_sub(2),
        };
        self.enter_exception(VECTOR_SWI, Mode::Supervisor, link, false);
    }

    /// Second operand of data processing: immediate-with-rotation or a
    /// shifted register. Returns the value and the shifter carry-out.
    /// `pc_adjust` is the extra prefetch visible to register operands
    /// when the shift amount comes from a register.
    fn evaluate_operand2(&mut self, op2: AluSecondOperandInfo, pc_adjust: u32) -> (u32, bool) {
        let carry = self.cpsr.carry_flag();
        match op2 {
            AluSecondOperandInfo::Immediate { base, shift: 0 } => (base, carry),
            AluSecondOperandInfo::Immediate { base, shift: rot } => {
                let result = shift(crate::cpu::flags::ShiftKind::Ror, rot, base, carry);
                (result.result, result.carry)
            }
            AluSecondOperandInfo::Register {
                shift_op,
                shift_kind,
                register,
            } => {
                let mut rm = self.registers.register_at(register as usize);
                if register == REG_PROGRAM_COUNTER {
                    rm = rm.wrapping_add(pc_adjust);
                }

                match shift_op {
                    ShiftOperator::Immediate(amount) => {
                        let result = shift(shift_kind, amount, rm, carry);
                        (result.result, result.carry)
                    }
                    ShiftOperator::Register(rs) => {
                        // Register-specified shifts cost one internal
                        // cycle and use only the bottom byte; a zero
                        // amount leaves value and carry untouched.
                        self.bus.idle(1);
                        let amount = self.registers.register_at(rs as usize) & 0xFF;
                        if amount == 0 {
                            (rm, carry)
                        } else {
                            let result = shift(shift_kind, amount, rm, carry);
                            (result.result, result.carry)
                        }
                    }
                }
            }
        }
    }

    pub fn data_processing(
        &mut self,
        alu_instruction: ArmModeAluInstruction,
        set_conditions: bool,
        rn: u32,
        destination: u32,
        op2: AluSecondOperandInfo,
    ) {
        let shift_by_register = matches!(
            op2,
            AluSecondOperandInfo::Register {
                shift_op: ShiftOperator::Register(_),
                ..
            }
        );
        // With a register-specified shift the prefetch has advanced one
        // more step by the time operands are read: R15 reads as PC+12.
        let pc_adjust = if shift_by_register { 4 } else { 0 };

        let op1 = if rn == REG_PROGRAM_COUNTER {
            self.registers.program_counter().wrapping_add(pc_adjust)
        } else {
            self.registers.register_at(rn as usize)
        };
        let (op2, shifter_carry) = self.evaluate_operand2(op2, pc_adjust);

        use ArmModeAluInstruction::*;
        let result = match alu_instruction {
            And | Tst => ArithmeticOpResult::logical(op1 & op2, shifter_carry),
            Eor | Teq => ArithmeticOpResult::logical(op1 ^ op2, shifter_carry),
            Orr => ArithmeticOpResult::logical(op1 | op2, shifter_carry),
            Bic => ArithmeticOpResult::logical(op1 & !op2, shifter_carry),
            Mov => ArithmeticOpResult::logical(op2, shifter_carry),
            Mvn => ArithmeticOpResult::logical(!op2, shifter_carry),
            Sub | Cmp => Self::sub_inner_op(op1, op2),
            Rsb => Self::sub_inner_op(op2, op1),
            Add | Cmn => Self::add_inner_op(op1, op2),
            Adc => Self::adc_inner_op(op1, op2, self.cpsr.carry_flag()),
            Sbc => Self::sbc_inner_op(op1, op2, self.cpsr.carry_flag()),
            Rsc => Self::sbc_inner_op(op2, op1, self.cpsr.carry_flag()),
        };

        let is_test = matches!(alu_instruction, Tst | Teq | Cmp | Cmn);

        if set_conditions {
            if destination == REG_PROGRAM_COUNTER && !is_test {
                // Exception return: restore the saved PSR alongside the
                // PC write.
                let spsr = self.spsr;
                self.swap_mode(spsr.mode());
                self.cpsr = spsr;
            } else {
                self.cpsr.set_sign_flag(result.sign);
                self.cpsr.set_zero_flag(result.zero);
                self.cpsr.set_carry_flag(result.carry);
                if alu_instruction.kind() == AluInstructionKind::Arithmetic {
                    self.cpsr.set_overflow_flag(result.overflow);
                }
            }
        }

        if !is_test {
            self.registers
                .set_register_at(destination as usize, result.result);
            if destination == REG_PROGRAM_COUNTER {
                self.flush_pipeline();
            }
        }
    }

    pub fn add_inner_op(first_op: u32, second_op: u32) -> ArithmeticOpResult {
        let (result, carry) = first_op.overflowing_add(second_op);
        ArithmeticOpResult {
            result,
            carry,
            overflow: ((first_op ^ result) & (second_op ^ result)).get_bit(31),
            sign: result.get_bit(31),
            zero: result == 0,
        }
    }

    pub fn sub_inner_op(first_op: u32, second_op: u32) -> ArithmeticOpResult {
        let result = first_op.wrapping_sub(second_op);
        ArithmeticOpResult {
            result,
            // C means "no borrow" on ARM subtractions.
            carry: first_op >= second_op,
            overflow: ((first_op ^ second_op) & (first_op ^ result)).get_bit(31),
            sign: result.get_bit(31),
            zero: result == 0,
        }
    }

    pub fn adc_inner_op(first_op: u32, second_op: u32, carry_in: bool) -> ArithmeticOpResult {
        let wide = first_op as u64 + second_op as u64 + carry_in as u64;
        let result = wide as u32;
        ArithmeticOpResult {
            result,
            carry: wide > u32::MAX as u64,
            overflow: ((first_op ^ result) & (second_op ^ result)).get_bit(31),
            sign: result.get_bit(31),
            zero: result == 0,
        }
    }

    pub fn sbc_inner_op(first_op: u32, second_op: u32, carry_in: bool) -> ArithmeticOpResult {
        // a - b - !c expressed as a + !b + c.
        Self::adc_inner_op(first_op, !second_op, carry_in)
    }

    /// Internal cycles of a multiply: early-exit on the significant bytes
    /// of the Rs operand.
    fn multiplier_cycles(rs: u32) -> u32 {
        let masked = rs & 0xFFFF_FF00;
        if masked == 0 || masked == 0xFFFF_FF00 {
            1
        } else if (rs & 0xFFFF_0000) == 0 || (rs & 0xFFFF_0000) == 0xFFFF_0000 {
            2
        } else if (rs & 0xFF00_0000) == 0 || (rs & 0xFF00_0000) == 0xFF00_0000 {
            3
        } else {
            4
        }
    }

    pub fn multiply(
        &mut self,
        variant: ArmModeMultiplyVariant,
        set_conditions: bool,
        rd: u32,
        rn: u32,
        rs: u32,
        rm: u32,
    ) {
        let rs_value = self.registers.register_at(rs as usize);
        let rm_value = self.registers.register_at(rm as usize);

        let mut cycles = Self::multiplier_cycles(rs_value);
        let mut result = rm_value.wrapping_mul(rs_value);
        if variant == ArmModeMultiplyVariant::Mla {
            result = result.wrapping_add(self.registers.register_at(rn as usize));
            cycles += 1;
        }
        self.bus.idle(cycles);

        self.registers.set_register_at(rd as usize, result);

        if set_conditions {
            self.cpsr.set_sign_flag(result.get_bit(31));
            self.cpsr.set_zero_flag(result == 0);
        }
    }

    pub fn multiply_long(
        &mut self,
        variant: ArmModeMultiplyLongVariant,
        set_conditions: bool,
        rdhi: u32,
        rdlo: u32,
        rs: u32,
        rm: u32,
    ) {
        let rs_value = self.registers.register_at(rs as usize);
        let rm_value = self.registers.register_at(rm as usize);

        use ArmModeMultiplyLongVariant::*;
        let mut result = match variant {
            Umull | Umlal => (rm_value as u64).wrapping_mul(rs_value as u64),
            Smull | Smlal => {
                ((rm_value as i32 as i64).wrapping_mul(rs_value as i32 as i64)) as u64
            }
        };

        let mut cycles = Self::multiplier_cycles(rs_value) + 1;
        if matches!(variant, Umlal | Smlal) {
            let accumulator = (self.registers.register_at(rdhi as usize) as u64) << 32
                | self.registers.register_at(rdlo as usize) as u64;
            result = result.wrapping_add(accumulator);
            cycles += 1;
        }
        self.bus.idle(cycles);

        self.registers
            .set_register_at(rdhi as usize, (result >> 32) as u32);
        self.registers.set_register_at(rdlo as usize, result as u32);

        if set_conditions {
            self.cpsr.set_sign_flag((result >> 63) != 0);
            self.cpsr.set_zero_flag(result == 0);
        }
    }

    pub fn psr_transfer(&mut self, op_kind: PsrOpKind, psr_kind: PsrKind) {
        match op_kind {
            PsrOpKind::Mrs {
                destination_register,
            } => {
                let psr = match psr_kind {
                    PsrKind::Cpsr => self.cpsr,
                    PsrKind::Spsr => self.spsr,
                };
                self.registers
                    .set_register_at(destination_register as usize, psr.into());
            }
            PsrOpKind::Msr { source_register } => {
                let value = self.registers.register_at(source_register as usize);
                self.write_psr(psr_kind, value, 0b1111);
            }
            PsrOpKind::MsrFlg {
                operand,
                field_mask,
            } => {
                let (value, _) = self.evaluate_operand2(operand, 0);
                self.write_psr(psr_kind, value, field_mask);
            }
        }
    }

    /// MSR with a field mask. Unprivileged code can only touch the flag
    /// field of the CPSR; a control-field write rebinds the register
    /// window when it changes the mode bits.
    fn write_psr(&mut self, psr_kind: PsrKind, value: u32, field_mask: u32) {
        let mut mask = 0u32;
        for field in 0..4 {
            if field_mask.get_bit(field) {
                mask |= 0xFF << (field * 8);
            }
        }

        match psr_kind {
            PsrKind::Cpsr => {
                if self.cpsr.mode() == Mode::User {
                    mask &= 0xFF00_0000;
                }
                let new_value = (u32::from(self.cpsr) & !mask) | (value & mask);
                let new_psr = Psr::from(new_value);
                if new_psr.mode() != self.cpsr.mode() {
                    self.swap_mode(new_psr.mode());
                }
                self.cpsr = new_psr;
            }
            PsrKind::Spsr => {
                if self.cpsr.mode().has_spsr() {
                    let new_value = (u32::from(self.spsr) & !mask) | (value & mask);
                    self.spsr = Psr::from(new_value);
                }
            }
        }
    }

    pub fn single_data_swap(
        &mut self,
        quantity: ReadWriteKind,
        base_register: u32,
        destination_register: u32,
        source_register: u32,
    ) {
        let address = self.registers.register_at(base_register as usize);
        let source = self.registers.register_at(source_register as usize);

        let loaded = match quantity {
            ReadWriteKind::Word => {
                let value = self.read_word_rotated(address, Access::NonSequential);
                self.bus
                    .write_word(address & !3, source, Access::NonSequential);
                value
            }
            ReadWriteKind::Byte => {
                let value = self.bus.read_byte(address, Access::NonSequential) as u32;
                self.bus
                    .write_byte(address, source as u8, Access::NonSequential);
                value
            }
        };
        self.bus.idle(1);

        self.registers
            .set_register_at(destination_register as usize, loaded);
        if destination_register == REG_PROGRAM_COUNTER {
            self.flush_pipeline();
        }
    }

    pub fn branch_and_exchange(&mut self, register: usize) {
        let value = self.registers.register_at(register);
        if value.get_bit(0) {
            self.cpsr.set_cpu_state(CpuState::Thumb);
            self.registers.set_program_counter(value & !1);
        } else {
            self.cpsr.set_cpu_state(CpuState::Arm);
            self.registers.set_program_counter(value & !3);
        }
        self.flush_pipeline();
    }

    pub fn branch(&mut self, link: bool, offset: u32) {
        // The decoder already scaled the 24-bit field by 4.
        let offset = sign_extend(offset, 26);
        if link {
            let return_address = self
                .registers
                .program_counter()
                .wrapping_sub(SIZE_OF_ARM_INSTRUCTION);
            self.registers.set_register_at(14, return_address);
        }

        let target = self.registers.program_counter().wrapping_add(offset);
        self.registers.set_program_counter(target);
        self.flush_pipeline();
    }

    /// Word load with the ARM7 rotation quirk for unaligned addresses.
    pub(crate) fn read_word_rotated(&mut self, address: u32, access: Access) -> u32 {
        let value = self.bus.read_word(address & !3, access);
        value.rotate_right(8 * (address & 3))
    }

    /// Halfword load: unaligned addresses rotate the halfword into the
    /// high byte lanes.
    pub(crate) fn read_half_word_rotated(&mut self, address: u32, access: Access) -> u32 {
        let value = self.bus.read_half_word(address & !1, access) as u32;
        if address.get_bit(0) {
            value.rotate_right(8)
        } else {
            value
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn half_word_data_transfer(
        &mut self,
        indexing: Indexing,
        offsetting: Offsetting,
        write_back: bool,
        load_store_kind: LoadStoreKind,
        offset_kind: HalfwordDataTransferOffsetKind,
        base_register: u32,
        rd: u32,
        transfer_kind: HalfwordTransferKind,
    ) {
        let base = self.registers.register_at(base_register as usize);
        let offset = match offset_kind {
            HalfwordDataTransferOffsetKind::Immediate { offset } => offset,
            HalfwordDataTransferOffsetKind::Register { register } => {
                self.registers.register_at(register as usize)
            }
        };

        let offset_address = match offsetting {
            Offsetting::Up => base.wrapping_add(offset),
            Offsetting::Down => base.wrapping_sub(offset),
        };

        let address = match indexing {
            Indexing::Pre => offset_address,
            Indexing::Post => base,
        };

        // Post-indexing always writes back.
        if write_back || indexing == Indexing::Post {
            self.registers
                .set_register_at(base_register as usize, offset_address);
        }

        match load_store_kind {
            LoadStoreKind::Load => {
                let value = match transfer_kind {
                    HalfwordTransferKind::UnsignedHalfwords => {
                        self.read_half_word_rotated(address, Access::NonSequential)
                    }
                    HalfwordTransferKind::SignedByte => {
                        self.bus.read_byte(address, Access::NonSequential) as i8 as i32 as u32
                    }
                    HalfwordTransferKind::SignedHalfwords => {
                        if address.get_bit(0) {
                            // Misaligned LDRSH degrades to a signed byte
                            // load of the addressed byte.
                            self.bus.read_byte(address, Access::NonSequential) as i8 as i32 as u32
                        } else {
                            self.bus.read_half_word(address, Access::NonSequential) as i16 as i32
                                as u32
                        }
                    }
                };
                self.bus.idle(1);

                self.registers.set_register_at(rd as usize, value);
                if rd == REG_PROGRAM_COUNTER {
                    self.flush_pipeline();
                }
            }
            LoadStoreKind::Store => {
                let mut value = self.registers.register_at(rd as usize);
                if rd == REG_PROGRAM_COUNTER {
                    // Stored PC reads one fetch further ahead.
                    value = value.wrapping_add(4);
                }
                self.bus
                    .write_half_word(address & !1, value as u16, Access::NonSequential);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn single_data_transfer(
        &mut self,
        kind: SingleDataTransferKind,
        quantity: ReadWriteKind,
        write_back: bool,
        indexing: Indexing,
        rd: u32,
        base_register: u32,
        offset_info: SingleDataTransferOffsetInfo,
        offsetting: Offsetting,
    ) {
        let base = self.registers.register_at(base_register as usize);
        let offset = match offset_info {
            SingleDataTransferOffsetInfo::Immediate { offset } => offset,
            SingleDataTransferOffsetInfo::RegisterImmediate {
                shift_amount,
                shift_kind,
                reg_offset,
            } => {
                let rm = self.registers.register_at(reg_offset as usize);
                shift(shift_kind, shift_amount, rm, self.cpsr.carry_flag()).result
            }
        };

        let offset_address = match offsetting {
            Offsetting::Up => base.wrapping_add(offset),
            Offsetting::Down => base.wrapping_sub(offset),
        };

        let address = match indexing {
            Indexing::Pre => offset_address,
            Indexing::Post => base,
        };

        if write_back || indexing == Indexing::Post {
            self.registers
                .set_register_at(base_register as usize, offset_address);
        }

        match kind {
            SingleDataTransferKind::Ldr => {
                let value = match quantity {
                    ReadWriteKind::Word => self.read_word_rotated(address, Access::NonSequential),
                    ReadWriteKind::Byte => {
                        self.bus.read_byte(address, Access::NonSequential) as u32
                    }
                };
                self.bus.idle(1);

                self.registers.set_register_at(rd as usize, value);
                if rd == REG_PROGRAM_COUNTER {
                    self.flush_pipeline();
                }
            }
            SingleDataTransferKind::Str => {
                let mut value = self.registers.register_at(rd as usize);
                if rd == REG_PROGRAM_COUNTER {
                    value = value.wrapping_add(4);
                }
                match quantity {
                    ReadWriteKind::Word => {
                        self.bus
                            .write_word(address & !3, value, Access::NonSequential);
                    }
                    ReadWriteKind::Byte => {
                        self.bus
                            .write_byte(address, value as u8, Access::NonSequential);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn block_data_transfer(
        &mut self,
        indexing: Indexing,
        offsetting: Offsetting,
        load_psr: bool,
        write_back: bool,
        load_store: LoadStoreKind,
        rn: u32,
        register_list: u32,
    ) {
        let base = self.registers.register_at(rn as usize);

        // An empty list transfers R15 alone and moves the base by the
        // full 0x40 block.
        let (register_list, count) = if register_list == 0 {
            (1u32 << 15, 16u32)
        } else {
            (register_list, register_list.count_ones())
        };

        // Transfers always run through ascending addresses; decrementing
        // modes just start lower.
        let (start, final_base) = match (offsetting, indexing) {
            (Offsetting::Up, Indexing::Post) => (base, base.wrapping_add(4 * count)),
            (Offsetting::Up, Indexing::Pre) => (base.wrapping_add(4), base.wrapping_add(4 * count)),
            (Offsetting::Down, Indexing::Post) => {
                (base.wrapping_sub(4 * count).wrapping_add(4), base.wrapping_sub(4 * count))
            }
            (Offsetting::Down, Indexing::Pre) => {
                (base.wrapping_sub(4 * count), base.wrapping_sub(4 * count))
            }
        };

        let user_bank_transfer = load_psr
            && !(load_store == LoadStoreKind::Load && register_list.get_bit(15));

        let mut address = start;
        let mut access = Access::NonSequential;
        let mut pc_written = false;

        match load_store {
            LoadStoreKind::Store => {
                for reg in 0..16u8 {
                    if !register_list.get_bit(reg) {
                        continue;
                    }
                    let mut value = if user_bank_transfer {
                        self.user_register(reg as usize)
                    } else {
                        self.registers.register_at(reg as usize)
                    };
                    if u32::from(reg) == REG_PROGRAM_COUNTER {
                        value = value.wrapping_add(4);
                    }
                    self.bus.write_word(address & !3, value, access);
                    access = Access::Sequential;
                    address = address.wrapping_add(4);
                }
                if write_back {
                    self.registers.set_register_at(rn as usize, final_base);
                }
            }
            LoadStoreKind::Load => {
                if write_back {
                    self.registers.set_register_at(rn as usize, final_base);
                }
                for reg in 0..16u8 {
                    if !register_list.get_bit(reg) {
                        continue;
                    }
                    let value = self.bus.read_word(address & !3, access);
                    if user_bank_transfer {
                        self.set_user_register(reg as usize, value);
                    } else {
                        self.registers.set_register_at(reg as usize, value);
                    }
                    if u32::from(reg) == REG_PROGRAM_COUNTER {
                        pc_written = true;
                    }
                    access = Access::Sequential;
                    address = address.wrapping_add(4);
                }
                self.bus.idle(1);

                if pc_written {
                    if load_psr {
                        // LDM with PSR and R15: exception return.
                        let spsr = self.spsr;
                        self.swap_mode(spsr.mode());
                        self.cpsr = spsr;
                    }
                    self.flush_pipeline();
                }
            }
        }
    }

    /// User-bank view of a register, regardless of the current mode
    /// (STM/LDM with the S bit and no PC).
    fn user_register(&self, reg: usize) -> u32 {
        match (self.cpsr.mode(), reg) {
            (Mode::User | Mode::System, _) => self.registers.register_at(reg),
            (Mode::Fiq, 8) => self.register_bank.r8_old,
            (Mode::Fiq, 9) => self.register_bank.r9_old,
            (Mode::Fiq, 10) => self.register_bank.r10_old,
            (Mode::Fiq, 11) => self.register_bank.r11_old,
            (Mode::Fiq, 12) => self.register_bank.r12_old,
            (_, 13) => self.register_bank.r13_old,
            (_, 14) => self.register_bank.r14_old,
            _ => self.registers.register_at(reg),
        }
    }

    fn set_user_register(&mut self, reg: usize, value: u32) {
        match (self.cpsr.mode(), reg) {
            (Mode::User | Mode::System, _) => self.registers.set_register_at(reg, value),
            (Mode::Fiq, 8) => self.register_bank.r8_old = value,
            (Mode::Fiq, 9) => self.register_bank.r9_old = value,
            (Mode::Fiq, 10) => self.register_bank.r10_old = value,
            (Mode::Fiq, 11) => self.register_bank.r11_old = value,
            (Mode::Fiq, 12) => self.register_bank.r12_old = value,
            (_, 13) => self.register_bank.r13_old = value,
            (_, 14) => self.register_bank.r14_old = value,
            _ => self.registers.set_register_at(reg, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::arm7tdmi::tests::{assemble, cpu, cpu_with_rom};
    use pretty_assertions::assert_eq;

    /// Runs a fresh CPU over the given opcodes, one pipeline fill plus
    /// one step per opcode.
    fn run(ops: &[u32]) -> Arm7tdmi {
        let mut cpu = cpu_with_rom(assemble(ops));
        for _ in 0..ops.len() + 2 {
            cpu.step();
        }
        cpu
    }

    #[test]
    fn check_add_with_carry_and_overflow() {
        let mut cpu = cpu();

        let result = Arm7tdmi::add_inner_op(u32::MAX, 1);
        assert_eq!(result.result, 0);
        assert!(result.carry);
        assert!(result.zero);
        assert!(!result.overflow);

        let result = Arm7tdmi::add_inner_op(0x7FFF_FFFF, 1);
        assert!(result.overflow);
        assert!(result.sign);
        assert!(!result.carry);

        // ADCS folds the carry in.
        cpu.cpsr.set_carry_flag(true);
        let result = Arm7tdmi::adc_inner_op(1, 2, cpu.cpsr.carry_flag());
        assert_eq!(result.result, 4);
    }

    #[test]
    fn check_sub_borrow_rules() {
        let result = Arm7tdmi::sub_inner_op(5, 10);
        assert_eq!(result.result, (-5i32) as u32);
        assert!(!result.carry);
        assert!(result.sign);

        let result = Arm7tdmi::sub_inner_op(10, 10);
        assert!(result.carry);
        assert!(result.zero);

        // SBC with carry set behaves like plain SUB.
        let result = Arm7tdmi::sbc_inner_op(10, 4, true);
        assert_eq!(result.result, 6);
        assert!(result.carry);
    }

    #[test]
    fn check_mov_immediate() {
        // MOV R0, #0xFF000000 (0xFF ror 8)
        let cpu = run(&[0xE3A0_04FF]);
        assert_eq!(cpu.registers.register_at(0), 0xFF00_0000);
    }

    #[test]
    fn check_alu_program() {
        // MOV R0, #5; MOV R1, #7; ADD R2, R0, R1; SUBS R3, R2, R2
        let cpu = run(&[0xE3A0_0005, 0xE3A0_1007, 0xE080_2001, 0xE052_3002]);
        assert_eq!(cpu.registers.register_at(2), 12);
        assert_eq!(cpu.registers.register_at(3), 0);
        assert!(cpu.cpsr.zero_flag());
        assert!(cpu.cpsr.carry_flag());
    }

    #[test]
    fn check_logical_carry_from_shifter() {
        // MOVS R0, R1, LSL #1 with R1 = 0x80000001
        let mut cpu = cpu_with_rom(assemble(&[0xE1B0_0081, 0, 0]));
        cpu.registers.set_register_at(1, 0x8000_0001);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(0), 2);
        assert!(cpu.cpsr.carry_flag());
        assert!(!cpu.cpsr.zero_flag());
    }

    #[test]
    fn check_shift_by_register_amount_zero_keeps_carry() {
        // MOVS R0, R1, LSR R2 with R2 = 0
        let mut cpu = cpu_with_rom(assemble(&[0xE1B0_0231, 0, 0]));
        cpu.registers.set_register_at(1, 0xDEAD);
        cpu.registers.set_register_at(2, 0);
        cpu.cpsr.set_carry_flag(true);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(0), 0xDEAD);
        assert!(cpu.cpsr.carry_flag());
    }

    #[test]
    fn check_multiply() {
        // MUL R0, R1, R2
        let mut cpu = cpu_with_rom(assemble(&[0xE000_0291, 0, 0]));
        cpu.registers.set_register_at(1, 7);
        cpu.registers.set_register_at(2, 6);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(0), 42);
    }

    #[test]
    fn check_multiply_long_signed() {
        // SMULL R0, R1, R2, R3
        let mut cpu = cpu_with_rom(assemble(&[0xE0C1_0392, 0, 0]));
        cpu.registers.set_register_at(2, (-2i32) as u32);
        cpu.registers.set_register_at(3, 3);
        for _ in 0..3 {
            cpu.step();
        }
        let result =
            ((cpu.registers.register_at(1) as u64) << 32) | cpu.registers.register_at(0) as u64;
        assert_eq!(result as i64, -6);
    }

    #[test]
    fn check_branch_with_link() {
        // BL 0x08000010
        let mut cpu = cpu_with_rom(assemble(&[0xEB00_0002, 0, 0, 0, 0]));
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.program_counter(), 0x0800_0010);
        assert_eq!(cpu.registers.register_at(14), 0x0800_0004);
    }

    #[test]
    fn check_branch_and_exchange_to_thumb() {
        // BX R0 with R0 = target | 1
        let mut cpu = cpu_with_rom(assemble(&[0xE12F_FF10, 0, 0]));
        cpu.registers.set_register_at(0, 0x0800_0021);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.cpsr.cpu_state(), CpuState::Thumb);
        assert_eq!(cpu.registers.program_counter(), 0x0800_0020);
    }

    #[test]
    fn check_single_data_transfer_ldr_str() {
        // STR R1, [R0]; LDR R2, [R0]
        let mut cpu = cpu_with_rom(assemble(&[0xE580_1000, 0xE590_2000, 0, 0]));
        cpu.registers.set_register_at(0, 0x0200_0000);
        cpu.registers.set_register_at(1, 0xCAFE_BABE);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(2), 0xCAFE_BABE);
    }

    #[test]
    fn check_ldr_unaligned_rotates() {
        let mut cpu = cpu();
        cpu.bus
            .write_word(0x0200_0000, 0x1122_3344, Access::NonSequential);
        let value = cpu.read_word_rotated(0x0200_0001, Access::NonSequential);
        assert_eq!(value, 0x4411_2233);
    }

    #[test]
    fn check_post_index_writeback() {
        // LDR R2, [R0], #4
        let mut cpu = cpu_with_rom(assemble(&[0xE490_2004, 0, 0]));
        cpu.registers.set_register_at(0, 0x0200_0000);
        cpu.bus
            .write_word(0x0200_0000, 77, Access::NonSequential);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(2), 77);
        assert_eq!(cpu.registers.register_at(0), 0x0200_0004);
    }

    #[test]
    fn check_halfword_signed_transfers() {
        let mut cpu = cpu_with_rom(assemble(&[
            0xE1D0_10B0, // LDRH R1, [R0]
            0xE1D0_20D0, // LDRSB R2, [R0]
            0xE1D0_30F0, // LDRSH R3, [R0]
            0,
            0,
        ]));
        cpu.registers.set_register_at(0, 0x0200_0000);
        cpu.bus
            .write_half_word(0x0200_0000, 0x80FE, Access::NonSequential);
        for _ in 0..5 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(1), 0x80FE);
        assert_eq!(cpu.registers.register_at(2), 0xFFFF_FFFE);
        assert_eq!(cpu.registers.register_at(3), 0xFFFF_80FE);
    }

    #[test]
    fn check_block_data_transfer_round_trip() {
        // STMFD R13!, {R0, R1, R2}; LDMFD R13!, {R3, R4, R5}
        let mut cpu = cpu_with_rom(assemble(&[0xE92D_0007, 0xE8BD_0038, 0, 0]));
        let sp = 0x0300_7F00;
        cpu.registers.set_register_at(13, sp);
        cpu.registers.set_register_at(0, 0xA);
        cpu.registers.set_register_at(1, 0xB);
        cpu.registers.set_register_at(2, 0xC);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(3), 0xA);
        assert_eq!(cpu.registers.register_at(4), 0xB);
        assert_eq!(cpu.registers.register_at(5), 0xC);
        assert_eq!(cpu.registers.register_at(13), sp);
    }

    #[test]
    fn check_single_data_swap() {
        // SWP R0, R1, [R2]
        let mut cpu = cpu_with_rom(assemble(&[0xE102_0091, 0, 0]));
        cpu.registers.set_register_at(1, 0x1234);
        cpu.registers.set_register_at(2, 0x0200_0000);
        cpu.bus
            .write_word(0x0200_0000, 0x5678, Access::NonSequential);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(0), 0x5678);
        assert_eq!(
            cpu.bus.read_word(0x0200_0000, Access::NonSequential),
            0x1234
        );
    }

    #[test]
    fn check_mrs_msr_roundtrip() {
        // MSR CPSR_f, R0; MRS R1, CPSR
        let mut cpu = cpu_with_rom(assemble(&[0xE128_F000, 0xE10F_1000, 0, 0]));
        cpu.registers.set_register_at(0, 0xF000_0000);
        for _ in 0..4 {
            cpu.step();
        }
        assert!(cpu.cpsr.zero_flag());
        assert!(cpu.cpsr.sign_flag());
        assert_eq!(
            cpu.registers.register_at(1) & 0xF000_0000,
            0xF000_0000
        );
    }

    #[test]
    fn check_msr_user_mode_cannot_touch_control() {
        let mut cpu = cpu();
        assert_eq!(cpu.cpsr.mode(), Mode::User);

        // Attempt to switch to IRQ mode from user code.
        cpu.write_psr(PsrKind::Cpsr, 0b10010, 0b1111);
        assert_eq!(cpu.cpsr.mode(), Mode::User);
    }

    #[test]
    fn check_msr_privileged_mode_switch_rebinds_bank() {
        let mut cpu = cpu();
        cpu.swap_mode(Mode::Supervisor);
        cpu.registers.set_register_at(13, 0xAAAA);

        cpu.write_psr(PsrKind::Cpsr, u32::from(Mode::Irq), 0b0001);
        assert_eq!(cpu.cpsr.mode(), Mode::Irq);
        assert_eq!(cpu.registers.register_at(13), 0x0300_7FA0);
        assert_eq!(cpu.register_bank.r13_svc, 0xAAAA);
    }

    #[test]
    fn check_undefined_takes_exception() {
        // The 0x011 pattern with bit 4 set decodes as undefined.
        let mut cpu = cpu_with_rom(assemble(&[0xE7F0_00F0, 0, 0]));
        let hle = cpu.hle_bios;
        assert!(hle);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.cpsr.mode(), Mode::Undefined);
        assert!(cpu.cpsr.irq_disable());
    }

    #[test]
    fn check_data_processing_pc_write_flushes() {
        // MOV R15, R0 then garbage that must not execute.
        let mut cpu = cpu_with_rom(assemble(&[
            0xE1A0_F000, // MOV PC, R0
            0xE3A0_1001, // MOV R1, #1 (skipped)
            0xE3A0_1001,
            0xE3A0_2002, // MOV R2, #2 at 0x0800000C
        ]));
        cpu.registers.set_register_at(0, 0x0800_000C);
        for _ in 0..6 {
            cpu.step();
        }
        assert_eq!(cpu.registers.register_at(1), 0);
        assert_eq!(cpu.registers.register_at(2), 2);
    }
}
