//! Provides a simulatable RV64IMA hart implementation.

pub mod csr;
mod execute;
mod interrupts;
mod status;
mod trap;

use crate::instruction::{
    BranchCondition, CsrOp, Instruction, LoadWidth, RegImm32Op, RegImmOp, RegReg32Op, RegRegOp,
    RegShiftImmOp, StoreWidth,
};
use crate::interrupt::IrqLine;
use crate::registers::Registers;
use crate::system_bus::SystemBus;
use crate::{Alignment, PrivilegeLevel, RawPrivilegeLevel};
use execute::Executor;
use log::trace;
use thiserror::Error;

pub use csr::CsrSpecifier;
pub use interrupts::Interrupts;
pub use status::Status;
pub use trap::{Trap, TvecMode};

#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. This register must be readable in any implementation.
    /// > Hart IDs might not necessarily be numbered contiguously in a multiprocessor system, but
    /// > at least one hart must have a hart ID of zero.
    pub hart_id: u64,
    /// Address to which the core's PC register is reset.
    pub reset_vector: u64,
}

/// The set of interrupt lines a core samples in between instructions.
///
/// The devices driving these lines hold clones of them; see [`crate::interrupt::IrqLine`].
#[derive(Debug, Clone, Default)]
pub struct InterruptLines {
    /// Machine software interrupt, driven by the CLINT msip register.
    pub msip: IrqLine,
    /// Machine timer interrupt, driven by the CLINT mtime/mtimecmp comparison.
    pub mtip: IrqLine,
    /// Machine external interrupt, driven by the PLIC.
    pub meip: IrqLine,
}

impl InterruptLines {
    pub fn new() -> Self {
        Self::default()
    }
}

/// RISC-V core implementing the RV64IMA ISA with M-, S-, and U-mode.
///
/// As we don't support hardware multithreading, every core always only has a single hart.
/// We therefore don't model RISC-V harts explicitly, but rather consider [`Core`] to be the whole
/// of a core with a single hart.
///
/// > From the perspective of software running in a given execution environment, a hart is a
/// > resource that autonomously fetches and executes RISC-V instructions within that execution
/// > environment.
///
/// > The execution environment is responsible for ensuring the eventual forward progress of each
/// > of its harts. For a given hart, that responsibility is suspended while the hart is exercising
/// > a mechanism that explicitly waits for an event, such as the wait-for-interrupt instruction
/// > defined in Volume II of this specification.
///
/// The core owns the system bus; devices hanging off the bus communicate interrupt state back
/// through the [`InterruptLines`], which are folded into the mip CSR in between instructions.
#[derive(Debug)]
pub struct Core {
    config: Config,
    system_bus: SystemBus,
    registers: Registers,
    status: Status,
    trap: Trap,
    interrupts: Interrupts,
    privilege_mode: PrivilegeLevel,
    /// Set when a WFI instruction retires; cleared when an interrupt is taken. While set, the
    /// hart does not fetch instructions.
    waiting_for_interrupt: bool,
    /// The doubleword granule reserved by the last LR instruction, if still valid.
    reservation: Option<u64>,
}

impl Core {
    /// The misa CSR value, indicating that MXL=64 and that extensions I, M, and A are supported.
    ///
    /// > The misa CSR is a WARL read-write register reporting the ISA supported by the hart. This
    /// > register must be readable in any implementation, but a value of zero can be returned to
    /// > indicate the misa register has not been implemented.
    pub const MISA: u64 = (2 << 62) | (1 << 12) | (1 << 8) | (1 << 0);

    pub fn new(system_bus: SystemBus, config: Config, lines: InterruptLines) -> Self {
        Self {
            registers: Registers::new(config.reset_vector),
            config,
            system_bus,
            status: Status::new(),
            trap: Trap::new(),
            interrupts: Interrupts::new(lines.msip, lines.mtip, lines.meip),
            privilege_mode: PrivilegeLevel::Machine,
            waiting_for_interrupt: false,
            reservation: None,
        }
    }

    /// Provide a read-only view of this core's configuration.
    ///
    /// It is not possible to modify the configuration after creation.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub(super) fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }

    pub fn trap(&self) -> &Trap {
        &self.trap
    }

    pub fn system_bus(&self) -> &SystemBus {
        &self.system_bus
    }

    pub fn system_bus_mut(&mut self) -> &mut SystemBus {
        &mut self.system_bus
    }

    /// Returns the current privilege mode the core is in.
    ///
    /// See also [`PrivilegeLevel`].
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    pub(super) fn set_privilege_mode(&mut self, privilege_mode: PrivilegeLevel) {
        self.privilege_mode = privilege_mode;
    }

    /// Returns `true` if the hart is stalled on a WFI instruction.
    pub fn is_waiting_for_interrupt(&self) -> bool {
        self.waiting_for_interrupt
    }

    /// Stalls the hart until the next interrupt is taken. Used by the WFI instruction.
    pub(super) fn halt(&mut self) {
        self.waiting_for_interrupt = true;
    }

    /// Wakes the hart from a WFI stall without delivering an interrupt. The external driver may
    /// use this to force progress when it has reason to (e.g. to let the guest observe new device
    /// state on its next poll).
    pub fn wake(&mut self) {
        self.waiting_for_interrupt = false;
    }

    /// Attempt to execute up to `n` instructions, returning the number of instructions that
    /// actually retired.
    ///
    /// Each cycle first samples the device interrupt lines into mip and delivers the
    /// highest-priority ready interrupt, if any. Taking an interrupt consumes a cycle without
    /// retiring an instruction; the handler's first instruction executes on the next cycle. When
    /// the hart is stalled on WFI and no interrupt is deliverable, this returns early.
    pub fn step(&mut self, n: u64) -> u64 {
        let mut retired = 0;
        for _ in 0..n {
            self.interrupts.sync_lines();
            // A pending enabled interrupt wakes the hart even when it cannot be taken because
            // the global enable is clear; execution then resumes after the WFI.
            if self.waiting_for_interrupt && self.interrupts.any_pending_and_enabled() {
                self.waiting_for_interrupt = false;
            }
            if let Some(interrupt) = self.deliverable_interrupt() {
                self.waiting_for_interrupt = false;
                self.take_interrupt(interrupt);
                continue;
            }
            if self.waiting_for_interrupt {
                break;
            }
            let pc = self.registers.pc();
            let raw_instruction = match self.fetch_instruction(pc) {
                Ok(raw_instruction) => raw_instruction,
                Err(exception) => {
                    self.take_exception(exception, 0);
                    continue;
                }
            };
            match Instruction::decode(raw_instruction) {
                Ok(instruction) => match self.execute_instruction(instruction) {
                    Ok(()) => retired += 1,
                    Err(exception) => self.take_exception(exception, raw_instruction),
                },
                // > The behavior upon decoding a reserved instruction is UNSPECIFIED.
                // This implementation raises an illegal-instruction exception, with the raw
                // encoding as the trap value.
                Err(_) => self.take_exception(Exception::IllegalInstruction, raw_instruction),
            }
        }
        retired
    }

    /// Execute a single decoded instruction on this core.
    ///
    /// This only takes care of executing the instruction-specific operations, such as updating
    /// `x` registers, updating memory, updating the `pc` register, and depending on the
    /// instruction also updating CSRs. Interrupt delivery and exception handling are the caller's
    /// responsibility (see [`Core::step`]).
    pub fn execute_instruction(&mut self, instruction: Instruction) -> ExecutionResult {
        let mut executor = Executor { core: self };
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImmOp::Addi => Executor::addi,
                    RegImmOp::Slti => Executor::slti,
                    RegImmOp::Sltiu => Executor::sltiu,
                    RegImmOp::Xori => Executor::xori,
                    RegImmOp::Ori => Executor::ori,
                    RegImmOp::Andi => Executor::andi,
                };
                op(&mut executor, dest, src, immediate)
            }
            Instruction::OpImm32 {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImm32Op::Addiw => Executor::addiw,
                };
                op(&mut executor, dest, src, immediate)
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u6,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slli,
                    RegShiftImmOp::Srli => Executor::srli,
                    RegShiftImmOp::Srai => Executor::srai,
                };
                op(&mut executor, dest, src, shift_amount_u6)
            }
            Instruction::OpShiftImm32 {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slliw,
                    RegShiftImmOp::Srli => Executor::srliw,
                    RegShiftImmOp::Srai => Executor::sraiw,
                };
                op(&mut executor, dest, src, shift_amount_u5)
            }
            Instruction::Auipc { dest, immediate } => executor.auipc(dest, immediate),
            Instruction::Lui { dest, immediate } => executor.lui(dest, immediate),
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegRegOp::Add => Executor::add,
                    RegRegOp::Slt => Executor::slt,
                    RegRegOp::Sltu => Executor::sltu,
                    RegRegOp::And => Executor::and,
                    RegRegOp::Or => Executor::or,
                    RegRegOp::Xor => Executor::xor,
                    RegRegOp::Sll => Executor::sll,
                    RegRegOp::Srl => Executor::srl,
                    RegRegOp::Sub => Executor::sub,
                    RegRegOp::Sra => Executor::sra,
                    RegRegOp::Mul => Executor::mul,
                    RegRegOp::Mulh => Executor::mulh,
                    RegRegOp::Mulhsu => Executor::mulhsu,
                    RegRegOp::Mulhu => Executor::mulhu,
                    RegRegOp::Div => Executor::div,
                    RegRegOp::Divu => Executor::divu,
                    RegRegOp::Rem => Executor::rem,
                    RegRegOp::Remu => Executor::remu,
                };
                op(&mut executor, dest, src1, src2)
            }
            Instruction::Op32 {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegReg32Op::Addw => Executor::addw,
                    RegReg32Op::Subw => Executor::subw,
                    RegReg32Op::Sllw => Executor::sllw,
                    RegReg32Op::Srlw => Executor::srlw,
                    RegReg32Op::Sraw => Executor::sraw,
                    RegReg32Op::Mulw => Executor::mulw,
                    RegReg32Op::Divw => Executor::divw,
                    RegReg32Op::Divuw => Executor::divuw,
                    RegReg32Op::Remw => Executor::remw,
                    RegReg32Op::Remuw => Executor::remuw,
                };
                op(&mut executor, dest, src1, src2)
            }
            Instruction::Jal { dest, offset } => executor.jal(dest, offset),
            Instruction::Jalr { dest, base, offset } => executor.jalr(dest, base, offset),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let op = match condition {
                    BranchCondition::Beq => Executor::beq,
                    BranchCondition::Bne => Executor::bne,
                    BranchCondition::Blt => Executor::blt,
                    BranchCondition::Bltu => Executor::bltu,
                    BranchCondition::Bge => Executor::bge,
                    BranchCondition::Bgeu => Executor::bgeu,
                };
                op(&mut executor, src1, src2, offset)
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let op = match width {
                    LoadWidth::Lb => Executor::lb,
                    LoadWidth::Lh => Executor::lh,
                    LoadWidth::Lw => Executor::lw,
                    LoadWidth::Ld => Executor::ld,
                    LoadWidth::Lbu => Executor::lbu,
                    LoadWidth::Lhu => Executor::lhu,
                    LoadWidth::Lwu => Executor::lwu,
                };
                op(&mut executor, dest, base, offset)
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let op = match width {
                    StoreWidth::Sb => Executor::sb,
                    StoreWidth::Sh => Executor::sh,
                    StoreWidth::Sw => Executor::sw,
                    StoreWidth::Sd => Executor::sd,
                };
                op(&mut executor, src, base, offset)
            }
            Instruction::LoadReserved { size, dest, addr } => executor.lr(size, dest, addr),
            Instruction::StoreConditional {
                size,
                dest,
                addr,
                src,
            } => executor.sc(size, dest, addr, src),
            Instruction::Amo {
                op,
                size,
                dest,
                addr,
                src,
            } => executor.amo(op, size, dest, addr, src),
            Instruction::Fence {
                predecessor,
                successor,
            } => executor.fence(predecessor, successor),
            Instruction::FenceI => executor.fence_i(),
            Instruction::Ecall => executor.ecall(),
            Instruction::Ebreak => executor.ebreak(),
            Instruction::Mret => executor.mret(),
            Instruction::Sret => executor.sret(),
            Instruction::Wfi => executor.wfi(),
            Instruction::Csr { op, dest, csr, src } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrw,
                    CsrOp::ReadSet => Executor::csrrs,
                    CsrOp::ReadClear => Executor::csrrc,
                };
                op(&mut executor, dest, csr, src)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrwi,
                    CsrOp::ReadSet => Executor::csrrsi,
                    CsrOp::ReadClear => Executor::csrrci,
                };
                op(&mut executor, dest, csr, immediate)
            }
        }
    }

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege_level` indicates at what privilege level the read is performed. If the CSR that
    /// is being read requires a higher privilege level (see [`csr::required_privilege_level`]),
    /// then a [`CsrAccessError::Privileged`] will be given. Specifiers without backing state read
    /// as zero.
    pub fn read_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<u64, CsrAccessError> {
        self.check_csr_access(specifier, privilege_level)?;
        match specifier {
            csr::MISA => Ok(Self::MISA),
            csr::MHARTID => Ok(self.config.hart_id),
            csr::MSTATUS => Ok(self.status.read_mstatus()),
            csr::SSTATUS => Ok(self.status.read_sstatus()),
            csr::MIE => Ok(self.interrupts.read_mie()),
            csr::MIP => Ok(self.interrupts.read_mip()),
            csr::MIDELEG => Ok(self.interrupts.read_mideleg()),
            csr::MEDELEG => Ok(self.interrupts.read_medeleg()),
            csr::SIE => Ok(self.interrupts.read_sie()),
            csr::SIP => Ok(self.interrupts.read_sip()),
            csr::MTVEC => Ok(self.trap.read_mtvec()),
            csr::MSCRATCH => Ok(self.trap.read_mscratch()),
            csr::MEPC => Ok(self.trap.read_mepc()),
            csr::MCAUSE => Ok(self.trap.read_mcause()),
            csr::MTVAL => Ok(self.trap.read_mtval()),
            csr::STVEC => Ok(self.trap.read_stvec()),
            csr::SSCRATCH => Ok(self.trap.read_sscratch()),
            csr::SEPC => Ok(self.trap.read_sepc()),
            csr::SCAUSE => Ok(self.trap.read_scause()),
            csr::STVAL => Ok(self.trap.read_stval()),
            // All other specifiers are implemented as read-only zero.
            _ => Ok(0),
        }
    }

    /// Write the value of a CSR by its specifier.
    ///
    /// Only the bits of `value` selected by `mask` are written; the CSR itself may apply further
    /// WARL rules. Writes to specifiers without backing state are ignored, except that writes to
    /// the read-only quadrant fail with [`CsrWriteError::WriteToReadOnly`].
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        value: u64,
        mask: u64,
    ) -> Result<(), CsrWriteError> {
        self.check_csr_access(specifier, privilege_level)
            .map_err(CsrWriteError::AccessError)?;
        if csr::is_read_only(specifier) {
            return Err(CsrWriteError::WriteToReadOnly);
        }
        match specifier {
            // The misa register is WARL; this implementation hardwires it.
            csr::MISA => {}
            csr::MSTATUS => self.status.write_mstatus(value, mask),
            csr::SSTATUS => self.status.write_sstatus(value, mask),
            csr::MIE => self.interrupts.write_mie(value, mask),
            csr::MIP => self.interrupts.write_mip(value, mask),
            csr::MIDELEG => self.interrupts.write_mideleg(value, mask),
            csr::MEDELEG => self.interrupts.write_medeleg(value, mask),
            csr::SIE => self.interrupts.write_sie(value, mask),
            csr::SIP => self.interrupts.write_sip(value, mask),
            csr::MTVEC => self.trap.write_mtvec(value, mask),
            csr::MSCRATCH => self.trap.write_mscratch(value, mask),
            csr::MEPC => self.trap.write_mepc(value, mask),
            csr::MCAUSE => self.trap.write_mcause(value, mask),
            csr::MTVAL => self.trap.write_mtval(value, mask),
            csr::STVEC => self.trap.write_stvec(value, mask),
            csr::SSCRATCH => self.trap.write_sscratch(value, mask),
            csr::SEPC => self.trap.write_sepc(value, mask),
            csr::SCAUSE => self.trap.write_scause(value, mask),
            csr::STVAL => self.trap.write_stval(value, mask),
            // All other write attempts are ignored.
            _ => {}
        }
        Ok(())
    }

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<(), CsrAccessError> {
        let required_level = csr::required_privilege_level(specifier);
        if privilege_level < required_level {
            return Err(CsrAccessError::Privileged {
                specifier,
                required_level,
                actual_level: privilege_level,
            });
        }
        Ok(())
    }

    /// Returns the highest-priority interrupt that is pending, enabled, and whose delivery is
    /// allowed by the global interrupt-enable state of the current privilege mode.
    ///
    /// > An interrupt i will trap to M-mode [...] if all of the following are true: (a) either the
    /// > current privilege mode is M and the MIE bit in the mstatus register is set, or the
    /// > current privilege mode has less privilege than M-mode; (b) bit i is set in both mip and
    /// > mie; and (c) [...] bit i is not set in mideleg.
    fn deliverable_interrupt(&self) -> Option<Interrupt> {
        let m_enabled = self.privilege_mode < PrivilegeLevel::Machine
            || (self.privilege_mode == PrivilegeLevel::Machine && self.status.mie());
        if m_enabled {
            if let interrupt @ Some(_) = self.interrupts.highest_priority_m_ready() {
                return interrupt;
            }
        }
        let s_enabled = self.privilege_mode < PrivilegeLevel::Supervisor
            || (self.privilege_mode == PrivilegeLevel::Supervisor && self.status.sie());
        if s_enabled {
            if let interrupt @ Some(_) = self.interrupts.highest_priority_s_ready() {
                return interrupt;
            }
        }
        None
    }

    /// "Independent instruction fetch unit"
    ///
    /// > The base RISC-V ISA has fixed-length 32-bit instructions that must be naturally aligned
    /// > on 32-bit boundaries.
    fn fetch_instruction(&mut self, address: u64) -> Result<u32, Exception> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(Exception::InstructionAddressMisaligned(address));
        }
        self.system_bus
            .fetch(address)
            .map_err(|err| Exception::InstructionAccessFault(err.address()))
    }

    fn take_interrupt(&mut self, interrupt: Interrupt) {
        let delegate = self.privilege_mode <= PrivilegeLevel::Supervisor
            && self.interrupts.should_delegate(interrupt);
        trace!(
            "taking interrupt {interrupt:?} from {} into {}",
            self.privilege_mode,
            if delegate { "S" } else { "M" },
        );
        self.enter_trap(interrupt.code(), true, 0, delegate);
    }

    fn take_exception(&mut self, exception: Exception, raw_instruction: u32) {
        let code = exception.code();
        let tval = self.exception_tval(&exception, raw_instruction);
        let delegate = self.privilege_mode <= PrivilegeLevel::Supervisor
            && self.interrupts.should_delegate_exception(code);
        trace!(
            "taking exception {exception:?} at pc {:#x} into {}",
            self.registers.pc(),
            if delegate { "S" } else { "M" },
        );
        self.enter_trap(code, false, tval, delegate);
    }

    /// Performs the trap entry sequence into M-mode, or into S-mode when delegated:
    /// save the interrupted pc to xepc, the cause to xcause, auxiliary data to xtval, the
    /// previous privilege and interrupt-enable to the xstatus stack fields, then vector to xtvec.
    fn enter_trap(&mut self, code: u64, is_interrupt: bool, tval: u64, delegate: bool) {
        // Any trap that enters a handler invalidates an open load reservation.
        self.reservation = None;
        let pc = self.registers.pc();
        let cause = code | ((is_interrupt as u64) << 63);
        let target = match delegate {
            true => {
                self.trap.write_sepc(pc, u64::MAX);
                self.trap.write_scause(cause, u64::MAX);
                self.trap.write_stval(tval, u64::MAX);
                let sie = self.status.sie();
                self.status.set_spie(sie);
                self.status.set_sie(false);
                self.status.set_spp(RawPrivilegeLevel::from(self.privilege_mode));
                self.privilege_mode = PrivilegeLevel::Supervisor;
                self.trap.read_stvec()
            }
            false => {
                self.trap.write_mepc(pc, u64::MAX);
                self.trap.write_mcause(cause, u64::MAX);
                self.trap.write_mtval(tval, u64::MAX);
                let mie = self.status.mie();
                self.status.set_mpie(mie);
                self.status.set_mie(false);
                self.status.set_mpp(RawPrivilegeLevel::from(self.privilege_mode));
                self.privilege_mode = PrivilegeLevel::Machine;
                self.trap.read_mtvec()
            }
        };
        *self.registers.pc_mut() = trap_vector(target, code, is_interrupt);
    }

    fn exception_tval(&self, exception: &Exception, raw_instruction: u32) -> u64 {
        match *exception {
            Exception::InstructionAddressMisaligned(address)
            | Exception::InstructionAccessFault(address)
            | Exception::LoadAddressMisaligned(address)
            | Exception::LoadAccessFault(address)
            | Exception::StoreOrAmoAddressMisaligned(address)
            | Exception::StoreOrAmoAccessFault(address) => address,
            Exception::IllegalInstruction => raw_instruction as u64,
            Exception::Breakpoint => self.registers.pc(),
            Exception::EnvironmentCallFromUMode
            | Exception::EnvironmentCallFromSMode
            | Exception::EnvironmentCallFromMMode => 0,
        }
    }

    // Reservation bookkeeping for the A extension. The reservation granule is the naturally
    // aligned doubleword containing the reserved address.

    pub(self) fn set_reservation(&mut self, address: u64) {
        self.reservation = Some(reservation_granule(address));
    }

    /// Consumes the reservation, returning `true` if it was valid for the granule of `address`.
    pub(self) fn take_reservation(&mut self, address: u64) -> bool {
        self.reservation.take() == Some(reservation_granule(address))
    }

    /// Invalidates the reservation if `address` falls within the reserved granule. Called for
    /// every store the hart performs.
    pub(self) fn clobber_reservation(&mut self, address: u64) {
        if self.reservation == Some(reservation_granule(address)) {
            self.reservation = None;
        }
    }
}

fn reservation_granule(address: u64) -> u64 {
    address & !0b111
}

/// Computes the address execution vectors to when trapping with the given xtvec register value.
fn trap_vector(tvec: u64, code: u64, is_interrupt: bool) -> u64 {
    let (base, mode) = Trap::decode_tvec(tvec);
    match (mode, is_interrupt) {
        (TvecMode::Vectored, true) => base + 4 * code,
        _ => base,
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrAccessError {
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access specifier {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        /// The CSR for which access was requested.
        specifier: CsrSpecifier,
        /// The minimum required privilege level to access that CSR.
        required_level: RawPrivilegeLevel,
        /// The actual privilege level from which the access was performed.
        actual_level: PrivilegeLevel,
    },
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

/// Result of executing a single instruction. [`Ok`] if execution went normal, [`Err`] if an
/// exception occurred.
pub type ExecutionResult = Result<(), Exception>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte aligned boundary in memory. Carries the
    /// misaligned target address.
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - (*UNSPECIFIED*) Attempt to decode a reserved instruction.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - Attempt to use MRET/SRET from an insufficient privilege mode.
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreOrAmoAddressMisaligned(u64),
    StoreOrAmoAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => 0,
            Self::InstructionAccessFault(_) => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned(_) => 4,
            Self::LoadAccessFault(_) => 5,
            Self::StoreOrAmoAddressMisaligned(_) => 6,
            Self::StoreOrAmoAccessFault(_) => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftwareInterrupt = 1,
    MachineSoftwareInterrupt = 3,
    SupervisorTimerInterrupt = 5,
    MachineTimerInterrupt = 7,
    SupervisorExternalInterrupt = 9,
    MachineExternalInterrupt = 11,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt.
    pub fn code(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Specifier;

    const RAM_BASE: u64 = 0x8000_0000;
    const RAM_SIZE: u64 = 0x2_0000;

    fn core_with_ram() -> (Core, InterruptLines) {
        let lines = InterruptLines::new();
        let system_bus = SystemBus::new(RAM_BASE, RAM_SIZE).unwrap();
        let core = Core::new(
            system_bus,
            Config {
                hart_id: 0,
                reset_vector: RAM_BASE,
            },
            lines.clone(),
        );
        (core, lines)
    }

    fn load_program(core: &mut Core, words: &[u32]) {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        core.system_bus_mut().copy_to_ram(RAM_BASE, &bytes).unwrap();
    }

    fn x(index: u8) -> Specifier {
        Specifier::from_u5(index)
    }

    #[test]
    fn test_store_load_round_trip() {
        let (mut core, _) = core_with_ram();
        // addi x2, x0, 0x7B; sd x2, 0(x1); ld x3, 0(x1)
        load_program(&mut core, &[0x07B0_0113, 0x0020_B023, 0x0000_B183]);
        core.registers_mut().set_x(x(1), RAM_BASE + 0x1000);
        assert_eq!(3, core.step(3));
        assert_eq!(0x7B, core.registers().x(x(2)));
        assert_eq!(0x7B, core.registers().x(x(3)));
        assert_eq!(
            0x7B,
            core.system_bus_mut().read_u64(RAM_BASE + 0x1000).unwrap()
        );
        assert_eq!(0, core.registers().x(Specifier::X0));
    }

    #[test]
    fn test_timer_interrupt_delivery() {
        let (mut core, lines) = core_with_ram();
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MTVEC, m, 0x100, u64::MAX).unwrap();
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        core.execute_instruction(Instruction::Csri {
            op: CsrOp::ReadSet,
            dest: Specifier::X0,
            csr: csr::MSTATUS,
            immediate: 8, // mstatus.MIE
        })
        .unwrap();
        let pre_trap_pc = core.registers().pc();
        lines.mtip.raise();
        assert_eq!(0, core.step(1));
        assert_eq!(0x100, core.registers().pc());
        assert_eq!(
            0x8000_0000_0000_0007,
            core.read_csr(csr::MCAUSE, m).unwrap()
        );
        assert_eq!(pre_trap_pc, core.read_csr(csr::MEPC, m).unwrap());
        assert!(!core.status().mie());
        assert!(core.status().mpie());
        assert_eq!(PrivilegeLevel::Machine, core.status().mpp());
    }

    #[test]
    fn test_vectored_interrupt() {
        let (mut core, lines) = core_with_ram();
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MTVEC, m, 0x101, u64::MAX).unwrap();
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        core.status_mut().set_mie(true);
        lines.mtip.raise();
        core.step(1);
        // Vectored mode: base + 4 * cause.
        assert_eq!(0x100 + 4 * 7, core.registers().pc());
    }

    #[test]
    fn test_mret_round_trip() {
        let (mut core, lines) = core_with_ram();
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MTVEC, m, 0x100, u64::MAX).unwrap();
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        core.status_mut().set_mie(true);
        lines.mtip.raise();
        core.step(1);
        let mepc = core.read_csr(csr::MEPC, m).unwrap();
        lines.mtip.lower();
        core.execute_instruction(Instruction::Mret).unwrap();
        assert_eq!(mepc, core.registers().pc());
        assert_eq!(PrivilegeLevel::Machine, core.privilege_mode());
        // MIE was restored from MPIE.
        assert!(core.status().mie());
        assert!(core.status().mpie());
    }

    #[test]
    fn test_lr_sc_clobbered_by_store() {
        let (mut core, _) = core_with_ram();
        // lr.d x1, (x10); sd x2, 0(x10); sc.d x3, x4, (x10)
        load_program(&mut core, &[0x1005_30AF, 0x0025_3023, 0x1845_31AF]);
        core.registers_mut().set_x(x(10), RAM_BASE + 0x1000);
        core.registers_mut().set_x(x(2), 0xAA);
        core.registers_mut().set_x(x(4), 0xBB);
        assert_eq!(3, core.step(3));
        // The sc must fail and the memory must still hold x2's value.
        assert_eq!(1, core.registers().x(x(3)));
        assert_eq!(
            0xAA,
            core.system_bus_mut().read_u64(RAM_BASE + 0x1000).unwrap()
        );
    }

    #[test]
    fn test_lr_sc_success() {
        let (mut core, _) = core_with_ram();
        // lr.d x1, (x10); sc.d x3, x4, (x10)
        load_program(&mut core, &[0x1005_30AF, 0x1845_31AF]);
        core.registers_mut().set_x(x(10), RAM_BASE + 0x1000);
        core.registers_mut().set_x(x(4), 0xBB);
        assert_eq!(2, core.step(2));
        assert_eq!(0, core.registers().x(x(3)));
        assert_eq!(
            0xBB,
            core.system_bus_mut().read_u64(RAM_BASE + 0x1000).unwrap()
        );
        // The reservation was consumed; a second sc fails.
        core.registers_mut().set_x(x(4), 0xCC);
        *core.registers_mut().pc_mut() = RAM_BASE + 4;
        core.step(1);
        assert_eq!(1, core.registers().x(x(3)));
        assert_eq!(
            0xBB,
            core.system_bus_mut().read_u64(RAM_BASE + 0x1000).unwrap()
        );
    }

    #[test]
    fn test_reservation_invalidated_by_trap() {
        let (mut core, _) = core_with_ram();
        // lr.d x1, (x10); ecall; (handler at 0x8000_000C:) sc.d x3, x4, (x10)
        load_program(
            &mut core,
            &[0x1005_30AF, 0x0000_0073, 0x0000_0000, 0x1845_31AF],
        );
        core.write_csr(
            csr::MTVEC,
            PrivilegeLevel::Machine,
            RAM_BASE + 0xC,
            u64::MAX,
        )
        .unwrap();
        core.registers_mut().set_x(x(10), RAM_BASE + 0x1000);
        core.step(3);
        assert_eq!(1, core.registers().x(x(3)));
    }

    #[test]
    fn test_division_edge_cases() {
        let (mut core, _) = core_with_ram();
        // div x5, x6, x7; rem x8, x6, x7
        load_program(&mut core, &[0x0273_42B3, 0x0273_6433]);
        core.registers_mut().set_x(x(6), 42);
        core.registers_mut().set_x(x(7), 0);
        core.step(2);
        assert_eq!(u64::MAX, core.registers().x(x(5)));
        assert_eq!(42, core.registers().x(x(8)));

        *core.registers_mut().pc_mut() = RAM_BASE;
        core.registers_mut().set_x(x(6), i64::MIN as u64);
        core.registers_mut().set_x(x(7), -1_i64 as u64);
        core.step(2);
        assert_eq!(i64::MIN as u64, core.registers().x(x(5)));
        assert_eq!(0, core.registers().x(x(8)));
    }

    #[test]
    fn test_shift_amount_masking() {
        let (mut core, _) = core_with_ram();
        // sll x5, x6, x7; sllw x8, x6, x7
        load_program(&mut core, &[0x0073_12B3, 0x0073_143B]);
        core.registers_mut().set_x(x(6), 1);
        // 70 & 0x3F == 6 for the 64-bit form, 70 & 0x1F == 6 for the 32-bit form.
        core.registers_mut().set_x(x(7), 70);
        core.step(2);
        assert_eq!(1 << 6, core.registers().x(x(5)));
        assert_eq!(1 << 6, core.registers().x(x(8)));
    }

    #[test]
    fn test_word_op_sign_extension() {
        let (mut core, _) = core_with_ram();
        // addw x5, x6, x7
        load_program(&mut core, &[0x0073_02BB]);
        core.registers_mut().set_x(x(6), 0x7FFF_FFFF);
        core.registers_mut().set_x(x(7), 1);
        core.step(1);
        assert_eq!(0xFFFF_FFFF_8000_0000, core.registers().x(x(5)));
    }

    #[test]
    fn test_load_fault_reports_address() {
        let (mut core, _) = core_with_ram();
        // ld x3, 0(x1) with x1 pointing into a vacant region
        load_program(&mut core, &[0x0000_B183]);
        core.registers_mut().set_x(x(1), 0x4000_0000);
        core.step(1);
        let m = PrivilegeLevel::Machine;
        assert_eq!(5, core.read_csr(csr::MCAUSE, m).unwrap());
        assert_eq!(0x4000_0000, core.read_csr(csr::MTVAL, m).unwrap());
    }

    #[test]
    fn test_illegal_instruction_reports_encoding() {
        let (mut core, _) = core_with_ram();
        load_program(&mut core, &[0xFFFF_FFFF]);
        core.step(1);
        let m = PrivilegeLevel::Machine;
        assert_eq!(2, core.read_csr(csr::MCAUSE, m).unwrap());
        assert_eq!(0xFFFF_FFFF, core.read_csr(csr::MTVAL, m).unwrap());
    }

    #[test]
    fn test_wfi_stalls_until_interrupt() {
        let (mut core, lines) = core_with_ram();
        // wfi; addi x2, x0, 0x7B
        load_program(&mut core, &[0x1050_0073, 0x07B0_0113]);
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MTVEC, m, 0x100, u64::MAX).unwrap();
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        core.status_mut().set_mie(true);
        assert_eq!(1, core.step(10));
        assert!(core.is_waiting_for_interrupt());
        assert_eq!(RAM_BASE + 4, core.registers().pc());
        // No deliverable interrupt: the hart stays stalled.
        assert_eq!(0, core.step(10));
        lines.mtip.raise();
        assert_eq!(0, core.step(1));
        assert!(!core.is_waiting_for_interrupt());
        assert_eq!(0x100, core.registers().pc());
        // mepc points at the instruction after the wfi.
        assert_eq!(RAM_BASE + 4, core.read_csr(csr::MEPC, m).unwrap());
    }

    #[test]
    fn test_wfi_wakes_without_delivery_when_globally_disabled() {
        let (mut core, lines) = core_with_ram();
        // wfi; addi x2, x0, 0x7B
        load_program(&mut core, &[0x1050_0073, 0x07B0_0113]);
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        // mstatus.MIE stays clear: the interrupt may not be taken, but it must still end the
        // stall, resuming after the wfi.
        assert_eq!(1, core.step(1));
        assert!(core.is_waiting_for_interrupt());
        lines.mtip.raise();
        assert_eq!(1, core.step(1));
        assert!(!core.is_waiting_for_interrupt());
        assert_eq!(0x7B, core.registers().x(x(2)));
        assert_eq!(RAM_BASE + 8, core.registers().pc());
    }

    #[test]
    fn test_csr_round_trip() {
        let (mut core, _) = core_with_ram();
        let m = PrivilegeLevel::Machine;
        for (specifier, value, expected) in [
            (csr::MSCRATCH, 0xDEAD_BEEF_CAFE_F00D, 0xDEAD_BEEF_CAFE_F00D),
            (csr::MEPC, 0x8000_0001, 0x8000_0000),
            (csr::MTVEC, 0x8000_0101, 0x8000_0101),
            (csr::SSCRATCH, 42, 42),
            (csr::MIE, u64::MAX, 0xAAA),
        ] {
            core.write_csr(specifier, m, value, u64::MAX).unwrap();
            assert_eq!(expected, core.read_csr(specifier, m).unwrap(), "{specifier:#x}");
        }
        // Unimplemented CSRs read as zero and ignore writes.
        core.write_csr(0x7C0, m, u64::MAX, u64::MAX).unwrap();
        assert_eq!(0, core.read_csr(0x7C0, m).unwrap());
        // mhartid is read-only.
        assert!(core.write_csr(csr::MHARTID, m, 1, u64::MAX).is_err());
        assert_eq!(0, core.read_csr(csr::MHARTID, m).unwrap());
        // misa reports RV64IMA.
        assert_eq!(0x8000_0000_0000_1101, core.read_csr(csr::MISA, m).unwrap());
    }

    #[test]
    fn test_csr_privilege_check() {
        let (mut core, _) = core_with_ram();
        assert!(core
            .read_csr(csr::MSTATUS, PrivilegeLevel::Supervisor)
            .is_err());
        assert!(core
            .read_csr(csr::SSTATUS, PrivilegeLevel::User)
            .is_err());
        assert!(core
            .read_csr(csr::SSTATUS, PrivilegeLevel::Supervisor)
            .is_ok());
    }

    #[test]
    fn test_exception_delegation() {
        let (mut core, _) = core_with_ram();
        let m = PrivilegeLevel::Machine;
        // Delegate U-mode environment calls to S-mode.
        core.write_csr(csr::MEDELEG, m, 1 << 8, u64::MAX).unwrap();
        core.write_csr(csr::STVEC, m, 0x200, u64::MAX).unwrap();
        core.write_csr(csr::MTVEC, m, 0x100, u64::MAX).unwrap();
        core.set_privilege_mode(PrivilegeLevel::User);
        load_program(&mut core, &[0x0000_0073]);
        core.step(1);
        assert_eq!(PrivilegeLevel::Supervisor, core.privilege_mode());
        assert_eq!(0x200, core.registers().pc());
        assert_eq!(8, core.read_csr(csr::SCAUSE, m).unwrap());
        assert_eq!(RAM_BASE, core.read_csr(csr::SEPC, m).unwrap());
        assert_eq!(PrivilegeLevel::User, core.status().spp());
        // M-mode environment calls are never delegated.
        core.set_privilege_mode(PrivilegeLevel::Machine);
        *core.registers_mut().pc_mut() = RAM_BASE;
        core.step(1);
        assert_eq!(0x100, core.registers().pc());
        assert_eq!(11, core.read_csr(csr::MCAUSE, m).unwrap());
    }

    #[test]
    fn test_misaligned_fetch_faults() {
        let (mut core, _) = core_with_ram();
        // jalr x0, 2(x1) jumps to a target that is not four-byte aligned.
        load_program(&mut core, &[0x0020_8067]);
        core.registers_mut().set_x(x(1), RAM_BASE + 0x1000);
        core.step(1);
        let m = PrivilegeLevel::Machine;
        assert_eq!(0, core.read_csr(csr::MCAUSE, m).unwrap());
        assert_eq!(RAM_BASE + 0x1002, core.read_csr(csr::MTVAL, m).unwrap());
    }
}
