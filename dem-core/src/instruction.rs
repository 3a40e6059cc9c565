use crate::core::csr::CsrSpecifier;
use crate::registers::Specifier;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded form.
///
/// Covers the RV64IMA base and extensions, the Zicsr extension, and the privileged instructions
/// needed to run a supervisor (MRET, SRET, WFI).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    /// 32-bit (word) variant of [`Instruction::OpImm`]; the result is sign-extended to 64 bits.
    OpImm32 {
        op: RegImm32Op,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
    },
    /// 32-bit (word) variant of [`Instruction::OpShiftImm`]; shifts the low word and sign-extends.
    OpShiftImm32 {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    /// 32-bit (word) variant of [`Instruction::Op`]; the result is sign-extended to 64 bits.
    Op32 {
        op: RegReg32Op,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    /// Load-reserved from the address in `addr`.
    LoadReserved {
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
    },
    /// Store-conditional of `src` to the address in `addr`; `dest` receives the status code.
    StoreConditional {
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    /// Atomic read-modify-write of the memory at the address in `addr`.
    Amo {
        op: AmoOp,
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    Fence {
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    },
    FenceI,
    Ecall,
    Ebreak,
    Mret,
    Sret,
    Wfi,
    Csr {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    },
    Csri {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImm32Op {
    Addiw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
    // M standard extension
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegReg32Op {
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    // M standard extension
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
    Sd,
}

/// Access size of an A-extension instruction: a word (32-bit) or doubleword (64-bit).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoSize {
    W,
    D,
}

impl AmoSize {
    /// The access size in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Self::W => 4,
            Self::D => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FenceOrderCombination {
    pub device_input: bool,
    pub device_output: bool,
    pub memory_reads: bool,
    pub memory_writes: bool,
}

impl Instruction {
    pub fn decode(raw_instruction: u32) -> Result<Self, DecodeError> {
        match opcode(raw_instruction).ok_or(DecodeError::UnsupportedOpcode)? {
            Opcode::OpImm => match i_funct(raw_instruction) {
                Some(op) => Ok(Self::OpImm {
                    op,
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                None => match i_shfunct(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u6: shamt6(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::OpImm32 => match funct3(raw_instruction) {
                0b000 => Ok(Self::OpImm32 {
                    op: RegImm32Op::Addiw,
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                _ => match i_shfunct32(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm32 {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u5: shamt5(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::Auipc => Ok(Self::Auipc {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Lui => Ok(Self::Lui {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Op => match r_funct(raw_instruction) {
                Some(op) => Ok(Self::Op {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Op32 => match r_funct32(raw_instruction) {
                Some(op) => Ok(Self::Op32 {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Jal => Ok(Self::Jal {
                dest: rd(raw_instruction),
                offset: j_imm(raw_instruction),
            }),
            Opcode::Jalr => match funct3(raw_instruction) {
                0b000 => Ok(Self::Jalr {
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Branch => match b_funct(raw_instruction) {
                Some(condition) => Ok(Self::Branch {
                    condition,
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    offset: b_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Load => match i_width(raw_instruction) {
                Some(width) => Ok(Self::Load {
                    width,
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Store => match s_width(raw_instruction) {
                Some(width) => Ok(Self::Store {
                    width,
                    src: rs2(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: s_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Amo => decode_amo(raw_instruction),
            Opcode::MiscMem => match funct3(raw_instruction) {
                0b000 => {
                    // All unused fields (fm, rd, rs1) are reserved for future use. The spec states
                    // unknown values must be treated as a normal fence for forward compatibility,
                    // so they are simply ignored here. The same holds for the optional FENCE.TSO
                    // encoding (fm == 0b1000).
                    let predecessor = FenceOrderCombination {
                        device_input: (raw_instruction >> 27) & 0b1 == 1,
                        device_output: (raw_instruction >> 26) & 0b1 == 1,
                        memory_reads: (raw_instruction >> 25) & 0b1 == 1,
                        memory_writes: (raw_instruction >> 24) & 0b1 == 1,
                    };
                    let successor = FenceOrderCombination {
                        device_input: (raw_instruction >> 23) & 0b1 == 1,
                        device_output: (raw_instruction >> 22) & 0b1 == 1,
                        memory_reads: (raw_instruction >> 21) & 0b1 == 1,
                        memory_writes: (raw_instruction >> 20) & 0b1 == 1,
                    };
                    Ok(Self::Fence {
                        predecessor,
                        successor,
                    })
                }
                0b001 => Ok(Self::FenceI),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::System => decode_system(raw_instruction),
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has unsupported opcode")]
    UnsupportedOpcode,
    #[error("illegal instruction")]
    IllegalInstruction,
}

fn decode_amo(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let size = match funct3(raw_instruction) {
        0b010 => AmoSize::W,
        0b011 => AmoSize::D,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    let dest = rd(raw_instruction);
    let addr = rs1(raw_instruction);
    let src = rs2(raw_instruction);
    // The aq and rl ordering bits (26 and 25) carry no meaning on a single hart and are ignored.
    match funct5(raw_instruction) {
        0b00010 => match u8::from(src) {
            0 => Ok(Instruction::LoadReserved { size, dest, addr }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b00011 => Ok(Instruction::StoreConditional {
            size,
            dest,
            addr,
            src,
        }),
        funct5 => {
            let op = match funct5 {
                0b00001 => AmoOp::Swap,
                0b00000 => AmoOp::Add,
                0b00100 => AmoOp::Xor,
                0b01100 => AmoOp::And,
                0b01000 => AmoOp::Or,
                0b10000 => AmoOp::Min,
                0b10100 => AmoOp::Max,
                0b11000 => AmoOp::Minu,
                0b11100 => AmoOp::Maxu,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::Amo {
                op,
                size,
                dest,
                addr,
                src,
            })
        }
    }
}

fn decode_system(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let dest = rd(raw_instruction);
    let src = rs1(raw_instruction);
    match funct3(raw_instruction) {
        0b000 => {
            if u8::from(dest) != 0 || u8::from(src) != 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            match (raw_instruction >> 20) & 0xFFF {
                0b0000_0000_0000 => Ok(Instruction::Ecall),
                0b0000_0000_0001 => Ok(Instruction::Ebreak),
                0b0001_0000_0010 => Ok(Instruction::Sret),
                0b0001_0000_0101 => Ok(Instruction::Wfi),
                0b0011_0000_0010 => Ok(Instruction::Mret),
                _ => Err(DecodeError::IllegalInstruction),
            }
        }
        funct3 => {
            let op = match funct3 & 0b011 {
                0b01 => CsrOp::ReadWrite,
                0b10 => CsrOp::ReadSet,
                0b11 => CsrOp::ReadClear,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            let csr = csr_specifier(raw_instruction);
            match funct3 & 0b100 {
                0 => Ok(Instruction::Csr { op, dest, csr, src }),
                _ => Ok(Instruction::Csri {
                    op,
                    dest,
                    csr,
                    immediate: u32::from(u8::from(src)),
                }),
            }
        }
    }
}

/// Returns the 7-bit *opcode* value of the instruction, or `None` if it isn't supported.
fn opcode(raw_instruction: u32) -> Option<Opcode> {
    #[allow(clippy::unusual_byte_groupings)]
    match raw_instruction & 0x7F {
        0b00_000_11 => Some(Opcode::Load),
        // LoadFp = 0b00_001_11,
        // custom-0
        0b00_011_11 => Some(Opcode::MiscMem),
        0b00_100_11 => Some(Opcode::OpImm),
        0b00_101_11 => Some(Opcode::Auipc),
        0b00_110_11 => Some(Opcode::OpImm32),
        // 48b
        0b01_000_11 => Some(Opcode::Store),
        // StoreFp = 0b01_001_11,
        // custom-1
        0b01_011_11 => Some(Opcode::Amo),
        0b01_100_11 => Some(Opcode::Op),
        0b01_101_11 => Some(Opcode::Lui),
        0b01_110_11 => Some(Opcode::Op32),
        // 64b
        // Madd = 0b10_000_11,
        // Msub = 0b10_001_11,
        // Nmsub = 0b10_010_11,
        // Nmadd = 0b10_011_11,
        // OpFp = 0b10_100_11,
        // reserved
        // custom-2/rv128
        // 48b
        0b11_000_11 => Some(Opcode::Branch),
        0b11_001_11 => Some(Opcode::Jalr),
        // reserved
        0b11_011_11 => Some(Opcode::Jal),
        0b11_100_11 => Some(Opcode::System),
        // reserved
        // custom-3/rv128
        // >= 80b
        _ => None,
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type instructions.
fn rd(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type instructions.
fn rs1(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 20) & 0x1F) as u8)
}

fn i_funct(raw_instruction: u32) -> Option<RegImmOp> {
    match funct3(raw_instruction) {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

/// Decodes the shift-immediate forms of the OP-IMM opcode. RV64 shift amounts take six bits, so
/// the distinguishing funct field is only six bits wide (bits 31:26).
fn i_shfunct(raw_instruction: u32) -> Option<RegShiftImmOp> {
    match (raw_instruction >> 26, funct3(raw_instruction)) {
        (0b000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b010000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

/// Decodes the shift-immediate forms of the OP-IMM-32 opcode (five-bit shift amounts).
fn i_shfunct32(raw_instruction: u32) -> Option<RegShiftImmOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b0000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b0100000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_width(raw_instruction: u32) -> Option<LoadWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b011 => Some(LoadWidth::Ld),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        0b110 => Some(LoadWidth::Lwu),
        _ => None,
    }
}

fn s_width(raw_instruction: u32) -> Option<StoreWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        0b011 => Some(StoreWidth::Sd),
        _ => None,
    }
}

fn r_funct(raw_instruction: u32) -> Option<RegRegOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        (0b0000001, 0b000) => Some(RegRegOp::Mul),
        (0b0000001, 0b001) => Some(RegRegOp::Mulh),
        (0b0000001, 0b010) => Some(RegRegOp::Mulhsu),
        (0b0000001, 0b011) => Some(RegRegOp::Mulhu),
        (0b0000001, 0b100) => Some(RegRegOp::Div),
        (0b0000001, 0b101) => Some(RegRegOp::Divu),
        (0b0000001, 0b110) => Some(RegRegOp::Rem),
        (0b0000001, 0b111) => Some(RegRegOp::Remu),
        _ => None,
    }
}

fn r_funct32(raw_instruction: u32) -> Option<RegReg32Op> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegReg32Op::Addw),
        (0b0100000, 0b000) => Some(RegReg32Op::Subw),
        (0b0000000, 0b001) => Some(RegReg32Op::Sllw),
        (0b0000000, 0b101) => Some(RegReg32Op::Srlw),
        (0b0100000, 0b101) => Some(RegReg32Op::Sraw),
        (0b0000001, 0b000) => Some(RegReg32Op::Mulw),
        (0b0000001, 0b100) => Some(RegReg32Op::Divw),
        (0b0000001, 0b101) => Some(RegReg32Op::Divuw),
        (0b0000001, 0b110) => Some(RegReg32Op::Remw),
        (0b0000001, 0b111) => Some(RegReg32Op::Remuw),
        _ => None,
    }
}

fn b_funct(raw_instruction: u32) -> Option<BranchCondition> {
    match funct3(raw_instruction) {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type instructions.
fn funct3(raw_instruction: u32) -> u8 {
    ((raw_instruction >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw_instruction: u32) -> u8 {
    (raw_instruction >> 25) as u8
}

/// Returns the 5-bit *funct5* value (bits 31:27) for A-extension instructions.
fn funct5(raw_instruction: u32) -> u8 {
    (raw_instruction >> 27) as u8
}

/// Returns the 6-bit *shamt* value for RV64 I-type shift instructions.
fn shamt6(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x3F
}

/// Returns the 5-bit *shamt* value for RV64 word-form I-type shift instructions.
fn shamt5(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x1F
}

/// Returns the 12-bit CSR specifier of Zicsr instructions.
fn csr_specifier(raw_instruction: u32) -> CsrSpecifier {
    (raw_instruction >> 20) as CsrSpecifier
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw_instruction: u32) -> i32 {
    raw_instruction as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw_instruction: u32) -> i32 {
    let imm_11_5 = raw_instruction & 0x7F00_0000;
    let imm_4_0 = raw_instruction & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw_instruction: u32) -> i32 {
    let imm_12 = raw_instruction & 0x8000_0000;
    let imm_10_5 = raw_instruction & 0x7E00_0000;
    let imm_4_1 = raw_instruction & 0x0000_0F00;
    let imm_11 = raw_instruction & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw_instruction: u32) -> i32 {
    (raw_instruction & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw_instruction: u32) -> i32 {
    let imm_20 = raw_instruction & 0x8000_0000;
    let imm_10_1 = raw_instruction & 0x7FE0_0000;
    let imm_11 = raw_instruction & 0x0010_0000;
    let imm_19_12 = raw_instruction & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Opcode {
    OpImm,
    OpImm32,
    Auipc,
    Lui,
    Op,
    Op32,
    Jal,
    Jalr,
    Branch,
    Load,
    Store,
    Amo,
    MiscMem,
    System,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::csr;

    #[test]
    fn test_i_imm() {
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        assert_eq!(-42, i_imm((-42_i32 << 20) as u32));
        // Check other bits are ignored
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF1_2345));
        assert_eq!(1209, i_imm((1209 << 20) | 0x000C_D10A));
    }

    #[test]
    fn test_decode_op_imm() {
        // addi x2, x0, 0x7B
        assert_eq!(
            Instruction::decode(0x07B0_0113),
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(2),
                src: Specifier::X0,
                immediate: 0x7B,
            })
        );
        // srai x5, x6, 63 (six-bit shift amount)
        assert_eq!(
            Instruction::decode(0x43F3_5293),
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Srai,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
                shift_amount_u6: 63,
            })
        );
        // slliw x5, x6, 31
        assert_eq!(
            Instruction::decode(0x01F3_129B),
            Ok(Instruction::OpShiftImm32 {
                op: RegShiftImmOp::Slli,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
                shift_amount_u5: 31,
            })
        );
        // slliw with shamt bit 5 set is reserved
        assert_eq!(
            Instruction::decode(0x03F3_129B),
            Err(DecodeError::IllegalInstruction)
        );
    }

    #[test]
    fn test_decode_loads_stores() {
        // sd x2, 0(x1)
        assert_eq!(
            Instruction::decode(0x0020_B023),
            Ok(Instruction::Store {
                width: StoreWidth::Sd,
                src: Specifier::from_u5(2),
                base: Specifier::from_u5(1),
                offset: 0,
            })
        );
        // ld x3, 0(x1)
        assert_eq!(
            Instruction::decode(0x0000_B183),
            Ok(Instruction::Load {
                width: LoadWidth::Ld,
                dest: Specifier::from_u5(3),
                base: Specifier::from_u5(1),
                offset: 0,
            })
        );
        // lwu x4, -8(x9)
        assert_eq!(
            Instruction::decode(0xFF84_E203),
            Ok(Instruction::Load {
                width: LoadWidth::Lwu,
                dest: Specifier::from_u5(4),
                base: Specifier::from_u5(9),
                offset: -8,
            })
        );
    }

    #[test]
    fn test_decode_mul_div() {
        // divu x10, x11, x12
        assert_eq!(
            Instruction::decode(0x02C5_D533),
            Ok(Instruction::Op {
                op: RegRegOp::Divu,
                dest: Specifier::from_u5(10),
                src1: Specifier::from_u5(11),
                src2: Specifier::from_u5(12),
            })
        );
        // mulw x10, x11, x12
        assert_eq!(
            Instruction::decode(0x02C5_853B),
            Ok(Instruction::Op32 {
                op: RegReg32Op::Mulw,
                dest: Specifier::from_u5(10),
                src1: Specifier::from_u5(11),
                src2: Specifier::from_u5(12),
            })
        );
    }

    #[test]
    fn test_decode_amo() {
        // lr.d x1, (x10)
        assert_eq!(
            Instruction::decode(0x1005_30AF),
            Ok(Instruction::LoadReserved {
                size: AmoSize::D,
                dest: Specifier::from_u5(1),
                addr: Specifier::from_u5(10),
            })
        );
        // sc.d x3, x4, (x10)
        assert_eq!(
            Instruction::decode(0x1845_31AF),
            Ok(Instruction::StoreConditional {
                size: AmoSize::D,
                dest: Specifier::from_u5(3),
                addr: Specifier::from_u5(10),
                src: Specifier::from_u5(4),
            })
        );
        // amoswap.w x7, x6, (x5)
        assert_eq!(
            Instruction::decode(0x0862_A3AF),
            Ok(Instruction::Amo {
                op: AmoOp::Swap,
                size: AmoSize::W,
                dest: Specifier::from_u5(7),
                addr: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
            })
        );
        // lr with rs2 != 0 is reserved
        assert_eq!(
            Instruction::decode(0x1015_30AF),
            Err(DecodeError::IllegalInstruction)
        );
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(Instruction::decode(0x0000_0073), Ok(Instruction::Ecall));
        assert_eq!(Instruction::decode(0x0010_0073), Ok(Instruction::Ebreak));
        assert_eq!(Instruction::decode(0x1020_0073), Ok(Instruction::Sret));
        assert_eq!(Instruction::decode(0x1050_0073), Ok(Instruction::Wfi));
        assert_eq!(Instruction::decode(0x3020_0073), Ok(Instruction::Mret));
        // csrrw x0, mtvec, x1
        assert_eq!(
            Instruction::decode(0x3050_9073),
            Ok(Instruction::Csr {
                op: CsrOp::ReadWrite,
                dest: Specifier::X0,
                csr: csr::MTVEC,
                src: Specifier::from_u5(1),
            })
        );
        // csrrsi x2, mstatus, 8
        assert_eq!(
            Instruction::decode(0x3004_6173),
            Ok(Instruction::Csri {
                op: CsrOp::ReadSet,
                dest: Specifier::from_u5(2),
                csr: csr::MSTATUS,
                immediate: 8,
            })
        );
    }

    #[test]
    fn test_decode_fence() {
        // fence rw, rw
        assert!(matches!(
            Instruction::decode(0x0330_000F),
            Ok(Instruction::Fence { .. })
        ));
        // fence.i
        assert_eq!(Instruction::decode(0x0000_100F), Ok(Instruction::FenceI));
    }
}
