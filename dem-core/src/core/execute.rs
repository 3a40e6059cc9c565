use crate::core::{Core, CsrSpecifier, Exception, ExecutionResult};
use crate::instruction::{AmoOp, AmoSize, CsrOp, FenceOrderCombination};
use crate::registers::{Registers, Specifier};
use crate::system_bus::{AccessError, SystemBus};
use crate::{Alignment, PrivilegeLevel, RawPrivilegeLevel};

#[derive(Debug)]
pub(super) struct Executor<'c> {
    pub core: &'c mut Core,
}

impl<'c> Executor<'c> {
    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1. Arithmetic overflow is
    /// > ignored and the result is simply the low XLEN bits of the result. ADDI rd, rs1, 0 is used
    /// > to implement the MV rd, rs1 assembler pseudoinstruction.
    pub fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s.wrapping_add_signed(imm))
    }

    /// Executes a `slti` instruction.
    ///
    /// > SLTI (set less than immediate) places the value 1 in register rd if register rs1 is less
    /// > than the sign-extended immediate when both are treated as signed numbers, else 0 is
    /// > written to rd.
    pub fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| ((s as i64) < imm) as u64)
    }

    /// Executes a `sltiu` instruction.
    ///
    /// > SLTIU is similar but compares the values as unsigned numbers (i.e., the immediate is
    /// > first sign-extended to XLEN bits then treated as an unsigned number). Note, SLTIU rd,
    /// > rs1, 1 sets rd to 1 if rs1 equals zero, otherwise sets rd to 0 (assembler
    /// > pseudoinstruction SEQZ rd, rs).
    pub fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| (s < (imm as u64)) as u64)
    }

    /// Executes an `andi` instruction.
    ///
    /// > ANDI, ORI, XORI are logical operations that perform bitwise AND, OR, and XOR on register
    /// > rs1 and the sign-extended 12-bit immediate and place the result in rd.
    pub fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s & (imm as u64))
    }

    /// Executes an `ori` instruction.
    pub fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s | (imm as u64))
    }

    /// Executes a `xori` instruction.
    ///
    /// > Note, XORI rd, rs1, -1 performs a bitwise logical inversion of register rs1 (assembler
    /// > pseudoinstruction NOT rd, rs).
    pub fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ (imm as u64))
    }

    /// Executes an `addiw` instruction.
    ///
    /// > ADDIW is an RV64I instruction that adds the sign-extended 12-bit immediate to register
    /// > rs1 and produces the proper sign-extension of a 32-bit result in rd. Overflows are
    /// > ignored and the result is the low 32 bits of the result sign-extended to 64 bits.
    pub fn addiw(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| {
            (s as u32).wrapping_add(imm as u32) as i32 as u64
        })
    }

    /// Executes a `slli` instruction.
    ///
    /// > SLLI is a logical left shift (zeros are shifted into the lower bits).
    ///
    /// # Panics
    ///
    /// `shift_amount` must fit in a u6 (`0..=63`), otherwise this will panic.
    pub fn slli(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
    ) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| s << shamt)
    }

    /// Executes a `srli` instruction.
    ///
    /// > SRLI is a logical right shift (zeros are shifted into the upper bits).
    ///
    /// # Panics
    ///
    /// `shift_amount` must fit in a u6 (`0..=63`), otherwise this will panic.
    pub fn srli(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
    ) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| s >> shamt)
    }

    /// Executes a `srai` instruction.
    ///
    /// > SRAI is an arithmetic right shift (the original sign bit is copied into the vacated upper
    /// > bits).
    ///
    /// # Panics
    ///
    /// `shift_amount` must fit in a u6 (`0..=63`), otherwise this will panic.
    pub fn srai(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
    ) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| {
            ((s as i64) >> shamt) as u64
        })
    }

    /// Executes a `slliw` instruction, the word variant of `slli`.
    pub fn slliw(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        self.reg_shamt32_op(dest, src, shift_amount_u5, |s, shamt| s << shamt)
    }

    /// Executes a `srliw` instruction, the word variant of `srli`.
    pub fn srliw(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        self.reg_shamt32_op(dest, src, shift_amount_u5, |s, shamt| s >> shamt)
    }

    /// Executes a `sraiw` instruction, the word variant of `srai`.
    pub fn sraiw(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        self.reg_shamt32_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as i32) >> shamt) as u32
        })
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI (load upper immediate) is used to build 32-bit constants and uses the U-type format.
    /// > LUI places the 32-bit U-immediate value into the destination register rd, filling in the
    /// > lowest 12 bits with zeros. The 32-bit result is sign-extended to 64 bits.
    pub fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let result = (immediate & !0xFFF) as i64 as u64;
        let registers = self.core.registers_mut();
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC (add upper immediate to pc) is used to build pc-relative addresses and uses the
    /// > U-type format. AUIPC forms a 32-bit offset from the U-immediate, filling in the lowest 12
    /// > bits with zeros, sign-extends the result to 64 bits, adds it to the address of the AUIPC
    /// > instruction, then places the result in register rd.
    pub fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let registers = self.core.registers_mut();
        let result = registers
            .pc()
            .wrapping_add_signed((immediate & !0xFFF) as i64);
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an `add` instruction.
    ///
    /// > ADD performs the addition of rs1 and rs2.
    pub fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    /// Executes a `sub` instruction.
    ///
    /// > SUB performs the subtraction of rs2 from rs1.
    pub fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    /// Executes a `slt` instruction.
    ///
    /// > SLT and SLTU perform signed and unsigned compares respectively, writing 1 to rd if
    /// > rs1 < rs2, 0 otherwise.
    pub fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64) < (s2 as i64)) as u64
        })
    }

    /// Executes a `sltu` instruction.
    pub fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u64)
    }

    /// Executes an `and` instruction.
    pub fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    /// Executes an `or` instruction.
    pub fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    /// Executes a `xor` instruction.
    pub fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// Executes a `sll` instruction.
    ///
    /// > SLL, SRL, and SRA perform logical left, logical right, and arithmetic right shifts on the
    /// > value in register rs1 by the shift amount held in the lower 6 bits of register rs2.
    pub fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x3F))
    }

    /// Executes a `srl` instruction.
    pub fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x3F))
    }

    /// Executes a `sra` instruction.
    pub fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64) >> (s2 & 0x3F)) as u64
        })
    }

    /// Executes a `mul` instruction.
    ///
    /// > MUL performs an XLEN-bit × XLEN-bit multiplication of rs1 by rs2 and places the lower
    /// > XLEN bits in the destination register.
    pub fn mul(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    /// Executes a `mulh` instruction (upper XLEN bits of signed × signed).
    pub fn mulh(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (((s1 as i64 as i128) * (s2 as i64 as i128)) >> 64) as u64
        })
    }

    /// Executes a `mulhsu` instruction (upper XLEN bits of signed × unsigned).
    pub fn mulhsu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (((s1 as i64 as i128) * (s2 as i128)) >> 64) as u64
        })
    }

    /// Executes a `mulhu` instruction (upper XLEN bits of unsigned × unsigned).
    pub fn mulhu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (((s1 as u128) * (s2 as u128)) >> 64) as u64
        })
    }

    /// Executes a `div` instruction.
    ///
    /// > DIV and DIVU perform an XLEN bits by XLEN bits signed and unsigned integer division of
    /// > rs1 by rs2, rounding towards zero. [...] The quotient of division by zero has all bits
    /// > set, and the remainder of division by zero equals the dividend. Signed division overflow
    /// > occurs only when the most-negative integer is divided by -1. The quotient of a signed
    /// > division with overflow is equal to the dividend, and the remainder is zero.
    pub fn div(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => u64::MAX,
            _ => (s1 as i64).wrapping_div(s2 as i64) as u64,
        })
    }

    /// Executes a `divu` instruction. See [`Executor::div`] for the division special cases.
    pub fn divu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => u64::MAX,
            _ => s1 / s2,
        })
    }

    /// Executes a `rem` instruction. See [`Executor::div`] for the division special cases.
    pub fn rem(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => s1,
            _ => (s1 as i64).wrapping_rem(s2 as i64) as u64,
        })
    }

    /// Executes a `remu` instruction. See [`Executor::div`] for the division special cases.
    pub fn remu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 {
            0 => s1,
            _ => s1 % s2,
        })
    }

    /// Executes an `addw` instruction.
    ///
    /// > ADDW and SUBW are RV64I-only instructions [...]. Overflows are ignored, and the low
    /// > 32-bits of the result is sign-extended to 64-bits and written to the destination
    /// > register.
    pub fn addw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    /// Executes a `subw` instruction.
    pub fn subw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    /// Executes a `sllw` instruction. Word shifts take the shift amount from the low 5 bits of
    /// rs2.
    pub fn sllw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x1F))
    }

    /// Executes a `srlw` instruction.
    pub fn srlw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x1F))
    }

    /// Executes a `sraw` instruction.
    pub fn sraw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u32
        })
    }

    /// Executes a `mulw` instruction.
    pub fn mulw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    /// Executes a `divw` instruction. See [`Executor::div`] for the division special cases.
    pub fn divw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| match s2 {
            0 => u32::MAX,
            _ => (s1 as i32).wrapping_div(s2 as i32) as u32,
        })
    }

    /// Executes a `divuw` instruction. See [`Executor::div`] for the division special cases.
    pub fn divuw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| match s2 {
            0 => u32::MAX,
            _ => s1 / s2,
        })
    }

    /// Executes a `remw` instruction. See [`Executor::div`] for the division special cases.
    pub fn remw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| match s2 {
            0 => s1,
            _ => (s1 as i32).wrapping_rem(s2 as i32) as u32,
        })
    }

    /// Executes a `remuw` instruction. See [`Executor::div`] for the division special cases.
    pub fn remuw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg32_op(dest, src1, src2, |s1, s2| match s2 {
            0 => s1,
            _ => s1 % s2,
        })
    }

    pub fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.pc().wrapping_add_signed(offset as i64)
        })
    }

    pub fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.x(base).wrapping_add_signed(offset as i64) & !1
        })
    }

    pub fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    pub fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    pub fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i64) < (s2 as i64))
    }

    pub fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    pub fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i64) >= (s2 as i64))
    }

    pub fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    pub fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u8(address).map(|value| value as i8 as u64)
        })
    }

    pub fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u8(address).map(|value| value as u64)
        })
    }

    pub fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u16(address).map(|value| value as i16 as u64)
        })
    }

    pub fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u16(address).map(|value| value as u64)
        })
    }

    pub fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u32(address).map(|value| value as i32 as u64)
        })
    }

    pub fn lwu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| {
            bus.read_u32(address).map(|value| value as u64)
        })
    }

    pub fn ld(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |bus, address| bus.read_u64(address))
    }

    pub fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |bus, address, value| {
            bus.write_u8(address, value as u8)
        })
    }

    pub fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |bus, address, value| {
            bus.write_u16(address, value as u16)
        })
    }

    pub fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |bus, address, value| {
            bus.write_u32(address, value as u32)
        })
    }

    pub fn sd(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |bus, address, value| {
            bus.write_u64(address, value)
        })
    }

    /// Executes an `lr.w` or `lr.d` instruction.
    ///
    /// > LR.W loads a word from the address in rs1, places the sign-extended value in rd, and
    /// > registers a reservation set—a set of bytes that subsumes the bytes in the addressed word.
    pub fn lr(&mut self, size: AmoSize, dest: Specifier, addr: Specifier) -> ExecutionResult {
        let address = self.core.registers().x(addr);
        if !amo_alignment(size).is_aligned(address) {
            return Err(Exception::LoadAddressMisaligned(address));
        }
        let value = match size {
            AmoSize::W => self
                .core
                .system_bus_mut()
                .read_u32(address)
                .map(|value| value as i32 as u64),
            AmoSize::D => self.core.system_bus_mut().read_u64(address),
        }
        .map_err(load_fault)?;
        self.core.set_reservation(address);
        let registers = self.core.registers_mut();
        registers.set_x(dest, value);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an `sc.w` or `sc.d` instruction.
    ///
    /// > SC.W conditionally writes a word in rs2 to the address in rs1: the SC.W succeeds only if
    /// > the reservation is still valid and the reservation set contains the bytes being written.
    /// > If the SC.W succeeds, [...] zero is written to rd. If the SC.W fails, [...] a nonzero
    /// > value is written to rd. Regardless of success or failure, executing an SC.W instruction
    /// > invalidates any reservation held by this hart.
    pub fn sc(
        &mut self,
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    ) -> ExecutionResult {
        let address = self.core.registers().x(addr);
        if !amo_alignment(size).is_aligned(address) {
            return Err(Exception::StoreOrAmoAddressMisaligned(address));
        }
        let value = self.core.registers().x(src);
        let status = match self.core.take_reservation(address) {
            true => {
                match size {
                    AmoSize::W => self.core.system_bus_mut().write_u32(address, value as u32),
                    AmoSize::D => self.core.system_bus_mut().write_u64(address, value),
                }
                .map_err(store_fault)?;
                0
            }
            false => 1,
        };
        let registers = self.core.registers_mut();
        registers.set_x(dest, status);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an AMO instruction.
    ///
    /// > The atomic memory operation (AMO) instructions perform read-modify-write operations for
    /// > multiprocessor synchronization [...]. These AMO instructions atomically load a data value
    /// > from the address in rs1, place the value into register rd, apply a binary operator to the
    /// > loaded value and the original value in rs2, then store the result back to the original
    /// > address in rs1.
    pub fn amo(
        &mut self,
        op: AmoOp,
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    ) -> ExecutionResult {
        let address = self.core.registers().x(addr);
        if !amo_alignment(size).is_aligned(address) {
            return Err(Exception::StoreOrAmoAddressMisaligned(address));
        }
        let rhs = self.core.registers().x(src);
        let old = match size {
            AmoSize::W => {
                let old = self
                    .core
                    .system_bus_mut()
                    .read_u32(address)
                    .map_err(store_fault)?;
                let new = amo_apply32(op, old, rhs as u32);
                self.core
                    .system_bus_mut()
                    .write_u32(address, new)
                    .map_err(store_fault)?;
                old as i32 as u64
            }
            AmoSize::D => {
                let old = self
                    .core
                    .system_bus_mut()
                    .read_u64(address)
                    .map_err(store_fault)?;
                let new = amo_apply64(op, old, rhs);
                self.core
                    .system_bus_mut()
                    .write_u64(address, new)
                    .map_err(store_fault)?;
                old
            }
        };
        self.core.clobber_reservation(address);
        let registers = self.core.registers_mut();
        registers.set_x(dest, old);
        increment_pc(registers);
        Ok(())
    }

    pub fn fence(
        &mut self,
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    ) -> ExecutionResult {
        // Since only one hart is supported, this is equivalent to a nop instruction.
        let _ = predecessor;
        let _ = successor;
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    pub fn fence_i(&mut self) -> ExecutionResult {
        // There is no instruction cache to synchronize, so this is a nop as well.
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    pub fn ecall(&mut self) -> ExecutionResult {
        Err(match self.core.privilege_mode() {
            PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
        })
    }

    pub fn ebreak(&mut self) -> ExecutionResult {
        Err(Exception::Breakpoint)
    }

    /// Executes an `mret` instruction.
    ///
    /// > An MRET or SRET instruction is used to return from a trap in M-mode or S-mode
    /// > respectively. When executing an xRET instruction, supposing xPP holds the value y, xIE is
    /// > set to xPIE; the privilege mode is changed to y; xPIE is set to 1; and xPP is set to the
    /// > least-privileged supported mode (U if U-mode is implemented, else M).
    pub fn mret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode() != PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction);
        }
        let previous_privilege = self.core.status().mpp();
        let previous_enable = self.core.status().mpie();
        let status = self.core.status_mut();
        status.set_mie(previous_enable);
        status.set_mpie(true);
        status.set_mpp(RawPrivilegeLevel::User);
        self.core.set_privilege_mode(previous_privilege);
        let epc = self.core.trap().read_mepc();
        *self.core.registers_mut().pc_mut() = epc;
        Ok(())
    }

    /// Executes an `sret` instruction. See [`Executor::mret`].
    pub fn sret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode() < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction);
        }
        let previous_privilege = self.core.status().spp();
        let previous_enable = self.core.status().spie();
        let status = self.core.status_mut();
        status.set_sie(previous_enable);
        status.set_spie(true);
        status.set_spp(RawPrivilegeLevel::User);
        self.core.set_privilege_mode(previous_privilege);
        let epc = self.core.trap().read_sepc();
        *self.core.registers_mut().pc_mut() = epc;
        Ok(())
    }

    /// Executes a `wfi` instruction.
    ///
    /// > The Wait for Interrupt instruction (WFI) provides a hint to the implementation that the
    /// > current hart can be stalled until an interrupt might need servicing.
    ///
    /// The instruction retires (pc advances) before the hart stalls, so execution resumes at the
    /// following instruction once an interrupt wakes the hart up.
    pub fn wfi(&mut self) -> ExecutionResult {
        self.core.halt();
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    /// Executes a `csrrw` instruction.
    ///
    /// > The CSRRW (Atomic Read/Write CSR) instruction atomically swaps values in the CSRs and
    /// > integer registers. CSRRW reads the old value of the CSR, zero-extends the value to XLEN
    /// > bits, then writes it to integer register rd. The initial value in rs1 is written to the
    /// > CSR. If rd=x0, then the instruction shall not read the CSR and shall not cause any of the
    /// > side effects that might occur on a CSR read.
    pub fn csrrw(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadWrite, dest, csr, src)
    }

    /// Executes a `csrrs` instruction.
    ///
    /// > The CSRRS (Atomic Read and Set Bits in CSR) instruction reads the value of the CSR,
    /// > zero-extends the value to XLEN bits, and writes it to integer register rd. The initial
    /// > value in integer register rs1 is treated as a bit mask that specifies bit positions to be
    /// > set in the CSR. [...]
    /// >
    /// > For both CSRRS and CSRRC, if rs1=x0, then the instruction will not write to the CSR at
    /// > all, and so shall not cause any of the side effects that might otherwise occur on a CSR
    /// > write.
    pub fn csrrs(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadSet, dest, csr, src)
    }

    /// Executes a `csrrc` instruction.
    ///
    /// > The CSRRC (Atomic Read and Clear Bits in CSR) instruction reads the value of the CSR,
    /// > zero-extends the value to XLEN bits, and writes it to integer register rd. The initial
    /// > value in integer register rs1 is treated as a bit mask that specifies bit positions to be
    /// > cleared in the CSR.
    pub fn csrrc(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadClear, dest, csr, src)
    }

    /// Executes a `csrrwi` instruction.
    ///
    /// > The CSRRWI, CSRRSI, and CSRRCI variants are similar to CSRRW, CSRRS, and CSRRC
    /// > respectively, except they update the CSR using an XLEN-bit value obtained by
    /// > zero-extending a 5-bit unsigned immediate (uimm\[4:0]) field encoded in the rs1 field
    /// > instead of a value from an integer register.
    pub fn csrrwi(
        &mut self,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadWrite, dest, csr, immediate)
    }

    /// Executes a `csrrsi` instruction. See [`Executor::csrrwi`].
    pub fn csrrsi(
        &mut self,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadSet, dest, csr, immediate)
    }

    /// Executes a `csrrci` instruction. See [`Executor::csrrwi`].
    pub fn csrrci(
        &mut self,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadClear, dest, csr, immediate)
    }

    // Private generic implementations

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, i64) -> u64,
    {
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src), immediate as i64));
        increment_pc(registers);
        Ok(())
    }

    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, u32) -> u64,
    {
        if shift_amount_u6 > 63 {
            panic!("out of range u6 used");
        }
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src), shift_amount_u6));
        increment_pc(registers);
        Ok(())
    }

    fn reg_shamt32_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        if shift_amount_u5 > 31 {
            panic!("out of range u5 used");
        }
        let registers = self.core.registers_mut();
        let result = op(registers.x(src) as u32, shift_amount_u5);
        registers.set_x(dest, result as i32 as u64);
        increment_pc(registers);
        Ok(())
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, u64) -> u64,
    {
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        increment_pc(registers);
        Ok(())
    }

    /// Like [`Executor::reg_reg_op`], but operating on the low words with the sign-extended word
    /// result written to `dest`.
    fn reg_reg32_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = self.core.registers_mut();
        let result = op(registers.x(src1) as u32, registers.x(src2) as u32);
        registers.set_x(dest, result as i32 as u64);
        increment_pc(registers);
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&Registers) -> u64,
    {
        let registers = self.core.registers_mut();
        // Compute target pc
        let new_pc = compute_target(registers);
        // Check target pc is word-aligned
        if !Alignment::WORD.is_aligned(new_pc) {
            return Err(Exception::InstructionAddressMisaligned(new_pc));
        }
        // Update pc to target
        let old_pc = std::mem::replace(registers.pc_mut(), new_pc);
        // Write incremented old pc to `dest` register
        registers.set_x(dest, old_pc.wrapping_add(4));
        Ok(())
    }

    // Takes the branch if `predicate` returns `true`.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u64, u64) -> bool,
    {
        let registers = self.core.registers_mut();
        if predicate(registers.x(src1), registers.x(src2)) {
            let new_pc = registers.pc().wrapping_add_signed(offset as i64);
            // Check target pc is word-aligned
            if !Alignment::WORD.is_aligned(new_pc) {
                return Err(Exception::InstructionAddressMisaligned(new_pc));
            }
            *registers.pc_mut() = new_pc;
        } else {
            increment_pc(registers);
        }
        Ok(())
    }

    fn load_op<F>(&mut self, dest: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&mut SystemBus, u64) -> Result<u64, AccessError>,
    {
        let address = self.core.registers().x(base).wrapping_add_signed(offset as i64);
        match op(self.core.system_bus_mut(), address) {
            Ok(value) => {
                let registers = self.core.registers_mut();
                registers.set_x(dest, value);
                increment_pc(registers);
                Ok(())
            }
            Err(err) => Err(load_fault(err)),
        }
    }

    fn store_op<F>(&mut self, src: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&mut SystemBus, u64, u64) -> Result<(), AccessError>,
    {
        let registers = self.core.registers();
        let value = registers.x(src);
        let address = registers.x(base).wrapping_add_signed(offset as i64);
        match op(self.core.system_bus_mut(), address, value) {
            Ok(()) => {
                self.core.clobber_reservation(address);
                increment_pc(self.core.registers_mut());
                Ok(())
            }
            Err(err) => Err(store_fault(err)),
        }
    }

    fn csr_reg_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || src != Specifier::X0)
                .then(|| self.core.registers().x(src)),
        )
    }

    fn csr_imm_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate as u64),
        )
    }

    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src_value: Option<u64>,
    ) -> ExecutionResult {
        // Read and store the core's current privilege level, since the CSR read may cause the
        // privilege level to be changed as a side-effect. This CSR operation should be atomic, so
        // both the read and write should be performed at the same, original privilege level.
        let privilege_level = self.core.privilege_mode();
        if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            let old_value = self
                .core
                .read_csr(csr, privilege_level)
                .map_err(|_| Exception::IllegalInstruction)?;
            let registers = self.core.registers_mut();
            registers.set_x(dest, old_value);
        };
        if let Some(src_value) = src_value {
            let (value, mask) = match op {
                CsrOp::ReadWrite => (src_value, u64::MAX),
                CsrOp::ReadSet => (u64::MAX, src_value),
                CsrOp::ReadClear => (0, src_value),
            };
            self.core
                .write_csr(csr, privilege_level, value, mask)
                .map_err(|_| Exception::IllegalInstruction)?;
        }
        increment_pc(self.core.registers_mut());
        Ok(())
    }
}

/// The natural alignment required by A-extension instructions of the given size.
fn amo_alignment(size: AmoSize) -> Alignment {
    match size {
        AmoSize::W => Alignment::WORD,
        AmoSize::D => Alignment::DOUBLEWORD,
    }
}

fn amo_apply64(op: AmoOp, old: u64, rhs: u64) -> u64 {
    match op {
        AmoOp::Swap => rhs,
        AmoOp::Add => old.wrapping_add(rhs),
        AmoOp::Xor => old ^ rhs,
        AmoOp::And => old & rhs,
        AmoOp::Or => old | rhs,
        AmoOp::Min => (old as i64).min(rhs as i64) as u64,
        AmoOp::Max => (old as i64).max(rhs as i64) as u64,
        AmoOp::Minu => old.min(rhs),
        AmoOp::Maxu => old.max(rhs),
    }
}

fn amo_apply32(op: AmoOp, old: u32, rhs: u32) -> u32 {
    match op {
        AmoOp::Swap => rhs,
        AmoOp::Add => old.wrapping_add(rhs),
        AmoOp::Xor => old ^ rhs,
        AmoOp::And => old & rhs,
        AmoOp::Or => old | rhs,
        AmoOp::Min => (old as i32).min(rhs as i32) as u32,
        AmoOp::Max => (old as i32).max(rhs as i32) as u32,
        AmoOp::Minu => old.min(rhs),
        AmoOp::Maxu => old.max(rhs),
    }
}

fn load_fault(err: AccessError) -> Exception {
    Exception::LoadAccessFault(err.address())
}

fn store_fault(err: AccessError) -> Exception {
    Exception::StoreOrAmoAccessFault(err.address())
}

fn increment_pc(registers: &mut Registers) {
    let pc = registers.pc_mut();
    *pc = pc.wrapping_add(4);
}
