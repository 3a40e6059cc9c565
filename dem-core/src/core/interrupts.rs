use bitvec::{array::BitArray, field::BitField, order::Lsb0};
use log::trace;

use super::Interrupt;
use crate::interrupt::IrqLine;

const SUPERVISOR_SOFTWARE_INTERRUPT: usize = Interrupt::SupervisorSoftwareInterrupt as usize;
const MACHINE_SOFTWARE_INTERRUPT: usize = Interrupt::MachineSoftwareInterrupt as usize;
const SUPERVISOR_TIMER_INTERRUPT: usize = Interrupt::SupervisorTimerInterrupt as usize;
const MACHINE_TIMER_INTERRUPT: usize = Interrupt::MachineTimerInterrupt as usize;
const SUPERVISOR_EXTERNAL_INTERRUPT: usize = Interrupt::SupervisorExternalInterrupt as usize;
const MACHINE_EXTERNAL_INTERRUPT: usize = Interrupt::MachineExternalInterrupt as usize;

#[allow(clippy::identity_op)]
const VALID_INTERRUPTS_MASK: u16 = 0
    | (1 << SUPERVISOR_SOFTWARE_INTERRUPT)
    | (1 << MACHINE_SOFTWARE_INTERRUPT)
    | (1 << SUPERVISOR_TIMER_INTERRUPT)
    | (1 << MACHINE_TIMER_INTERRUPT)
    | (1 << SUPERVISOR_EXTERNAL_INTERRUPT)
    | (1 << MACHINE_EXTERNAL_INTERRUPT);

// Delegatable interrupts according to QEMU's implementation.
#[allow(clippy::identity_op)]
const DELEGATABLE_INTERRUPTS_MASK: u16 = 0
    | (1 << SUPERVISOR_SOFTWARE_INTERRUPT)
    | (1 << SUPERVISOR_TIMER_INTERRUPT)
    | (1 << SUPERVISOR_EXTERNAL_INTERRUPT);

/// Exception causes that may be delegated to S-mode. Cause 10 is reserved and cause 11
/// (environment call from M-mode) can by definition never be handled below M-mode.
const DELEGATABLE_EXCEPTIONS_MASK: u64 = 0xB3FF;

/// The mip, mie, mideleg, and medeleg registers, together with the interrupt lines that devices
/// drive into the M-level pending bits.
///
/// The MSIP, MTIP, and MEIP bits of mip are read-only for guest software; their values are sampled
/// from the device lines in between instructions. The supervisor-level bits are writable from
/// M-mode (and SSIP also through sip).
#[derive(Debug)]
pub struct Interrupts {
    /// Array of booleans, with for each bit index matching an interrupt's code a bool indicating
    /// whether handling that interrupt should be delegated to S-mode (if not trapped in M-mode).
    delegate: BitArray<[u16; 1], Lsb0>,

    /// Bitmap of exception causes whose handling is delegated to S-mode (the medeleg register).
    delegate_exceptions: u64,

    /// The mip register as visible from guest software.
    mip: BitArray<[u16; 1], Lsb0>,

    /// The mie register.
    mie: BitArray<[u16; 1], Lsb0>,

    msip_line: IrqLine,
    mtip_line: IrqLine,
    meip_line: IrqLine,
}

impl Interrupts {
    pub fn new(msip_line: IrqLine, mtip_line: IrqLine, meip_line: IrqLine) -> Self {
        Self {
            delegate: BitArray::new([0x0000]),
            delegate_exceptions: 0,
            mip: BitArray::new([0x0000]),
            mie: BitArray::new([0x0000]),
            msip_line,
            mtip_line,
            meip_line,
        }
    }

    /// Samples the device-driven interrupt lines into the M-level pending bits.
    ///
    /// Must be called in between instructions, before delivery decisions are made, so that device
    /// state changes from the previous instruction (or from the external timing loop) are
    /// observable in mip.
    pub fn sync_lines(&mut self) {
        for (index, line, name) in [
            (MACHINE_SOFTWARE_INTERRUPT, &self.msip_line, "MSIP"),
            (MACHINE_TIMER_INTERRUPT, &self.mtip_line, "MTIP"),
            (MACHINE_EXTERNAL_INTERRUPT, &self.meip_line, "MEIP"),
        ] {
            let level = line.is_raised();
            if self.mip[index] != level {
                trace!("setting mip.{name} to {level}");
                self.mip.set(index, level);
            }
        }
    }

    /// Returns `true` if any interrupt is both pending and enabled, regardless of the global
    /// enable and delegation state. This is the WFI wake-up condition:
    ///
    /// > The hart resumes if any enabled interrupt becomes pending, even if the interrupt will
    /// > not be taken because the global interrupt enable is clear.
    pub fn any_pending_and_enabled(&self) -> bool {
        (self.mip & self.mie).any()
    }

    pub fn should_delegate(&self, interrupt: Interrupt) -> bool {
        self.delegate[interrupt as usize]
    }

    pub fn should_delegate_exception(&self, code: u64) -> bool {
        code < 64 && self.delegate_exceptions & (1 << code) != 0
    }

    /// Returns `Some(interrupt)` if there is an interrupt pending and enabled whose handling
    /// belongs to M-mode. If there are multiple, `interrupt` is the one with the highest priority.
    ///
    /// An interrupt belongs to M-mode if it is pending in mip, enabled by mie, and not delegated
    /// by mideleg.
    pub fn highest_priority_m_ready(&self) -> Option<Interrupt> {
        let ready = self.mip & self.mie & !self.delegate;
        [
            Interrupt::MachineExternalInterrupt,
            Interrupt::MachineSoftwareInterrupt,
            Interrupt::MachineTimerInterrupt,
            Interrupt::SupervisorExternalInterrupt,
            Interrupt::SupervisorSoftwareInterrupt,
            Interrupt::SupervisorTimerInterrupt,
        ]
        .into_iter()
        .find(|&i| ready[i as usize])
    }

    /// Returns `Some(interrupt)` if there is an interrupt pending and enabled whose handling is
    /// delegated to S-mode. If there are multiple, `interrupt` is the one with the highest
    /// priority.
    pub fn highest_priority_s_ready(&self) -> Option<Interrupt> {
        let ready = self.mip & self.mie & self.delegate;
        [
            Interrupt::SupervisorExternalInterrupt,
            Interrupt::SupervisorSoftwareInterrupt,
            Interrupt::SupervisorTimerInterrupt,
        ]
        .into_iter()
        .find(|&i| ready[i as usize])
    }

    pub fn read_mideleg(&self) -> u64 {
        self.delegate.load_le::<u16>() as u64
    }

    /// The mideleg register is **WARL**.
    pub fn write_mideleg(&mut self, value: u64, mask: u64) {
        let mask = mask as u16 & DELEGATABLE_INTERRUPTS_MASK;
        let mideleg = self.delegate.load_le::<u16>() & !mask | value as u16 & mask;
        self.delegate.store_le(mideleg);
    }

    pub fn read_medeleg(&self) -> u64 {
        self.delegate_exceptions
    }

    /// The medeleg register is **WARL**.
    pub fn write_medeleg(&mut self, value: u64, mask: u64) {
        let mask = mask & DELEGATABLE_EXCEPTIONS_MASK;
        self.delegate_exceptions = self.delegate_exceptions & !mask | value & mask;
    }

    pub fn read_mip(&self) -> u64 {
        self.mip.load_le::<u16>() as u64
    }

    /// Writes to MEIP, MTIP, and MSIP are ignored; those bits are device-driven. MEIP follows the
    /// PLIC, MTIP follows the memory-mapped mtime/mtimecmp comparison, and MSIP follows the
    /// memory-mapped msip register.
    pub fn write_mip(&mut self, value: u64, mask: u64) {
        #[allow(clippy::identity_op)]
        const WRITABLE: u16 = 0
            | (1 << SUPERVISOR_SOFTWARE_INTERRUPT)
            | (1 << SUPERVISOR_TIMER_INTERRUPT)
            | (1 << SUPERVISOR_EXTERNAL_INTERRUPT);
        let mask = mask as u16 & WRITABLE;
        let mip = self.mip.load_le::<u16>() & !mask | value as u16 & mask;
        self.mip.store_le(mip);
    }

    pub fn read_mie(&self) -> u64 {
        self.mie.load_le::<u16>() as u64
    }

    pub fn write_mie(&mut self, value: u64, mask: u64) {
        let mask = mask as u16 & VALID_INTERRUPTS_MASK;
        let mie = self.mie.load_le::<u16>() & !mask | value as u16 & mask;
        self.mie.store_le(mie);
    }

    pub fn read_sip(&self) -> u64 {
        (self.mip & self.delegate).load_le::<u16>() as u64
    }

    /// Only SSIP is writable through sip; SEIP and STIP are read-only in the S-mode view.
    pub fn write_sip(&mut self, value: u64, mask: u64) {
        let delegate = self.delegate.load_le::<u16>();
        let mask = mask as u16 & delegate & (1 << SUPERVISOR_SOFTWARE_INTERRUPT);
        let mip = self.mip.load_le::<u16>() & !mask | value as u16 & mask;
        self.mip.store_le(mip);
    }

    pub fn read_sie(&self) -> u64 {
        (self.mie & self.delegate).load_le::<u16>() as u64
    }

    pub fn write_sie(&mut self, value: u64, mask: u64) {
        let delegate = self.delegate.load_le::<u16>();
        // Since we are masking with `delegate`, it is not needed to also mask with
        // VALID_INTERRUPTS_MASK (or DELEGATABLE_INTERRUPTS_MASK).
        let mask = mask as u16 & delegate;
        let mie = self.mie.load_le::<u16>() & !mask | value as u16 & mask;
        self.mie.store_le(mie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interrupts() -> (Interrupts, IrqLine, IrqLine, IrqLine) {
        let msip = IrqLine::new();
        let mtip = IrqLine::new();
        let meip = IrqLine::new();
        let interrupts = Interrupts::new(msip.clone(), mtip.clone(), meip.clone());
        (interrupts, msip, mtip, meip)
    }

    #[test]
    fn test_lines_fold_into_mip() {
        let (mut interrupts, msip, mtip, meip) = interrupts();
        assert_eq!(0, interrupts.read_mip());
        mtip.raise();
        // Not observable until the next sync point.
        assert_eq!(0, interrupts.read_mip());
        interrupts.sync_lines();
        assert_eq!(1 << 7, interrupts.read_mip());
        msip.raise();
        meip.raise();
        mtip.lower();
        interrupts.sync_lines();
        assert_eq!((1 << 3) | (1 << 11), interrupts.read_mip());
    }

    #[test]
    fn test_machine_bits_not_writable() {
        let (mut interrupts, _msip, mtip, _meip) = interrupts();
        mtip.raise();
        interrupts.sync_lines();
        interrupts.write_mip(0, u64::MAX);
        assert_eq!(1 << 7, interrupts.read_mip());
        // The supervisor bits are writable from M-mode.
        interrupts.write_mip(1 << 1, u64::MAX);
        assert_eq!((1 << 1) | (1 << 7), interrupts.read_mip());
    }

    #[test]
    fn test_priority_order() {
        let (mut interrupts, msip, mtip, meip) = interrupts();
        interrupts.write_mie(u64::MAX, u64::MAX);
        msip.raise();
        mtip.raise();
        meip.raise();
        interrupts.sync_lines();
        assert_eq!(
            Some(Interrupt::MachineExternalInterrupt),
            interrupts.highest_priority_m_ready()
        );
        meip.lower();
        interrupts.sync_lines();
        assert_eq!(
            Some(Interrupt::MachineSoftwareInterrupt),
            interrupts.highest_priority_m_ready()
        );
        msip.lower();
        interrupts.sync_lines();
        assert_eq!(
            Some(Interrupt::MachineTimerInterrupt),
            interrupts.highest_priority_m_ready()
        );
    }

    #[test]
    fn test_delegation() {
        let (mut interrupts, _msip, _mtip, _meip) = interrupts();
        interrupts.write_mideleg(u64::MAX, u64::MAX);
        // Only the supervisor interrupts are delegatable.
        assert_eq!(0b10_0010_0010, interrupts.read_mideleg());
        assert!(interrupts.should_delegate(Interrupt::SupervisorTimerInterrupt));
        assert!(!interrupts.should_delegate(Interrupt::MachineTimerInterrupt));

        interrupts.write_medeleg(u64::MAX, u64::MAX);
        assert_eq!(DELEGATABLE_EXCEPTIONS_MASK, interrupts.read_medeleg());
        assert!(interrupts.should_delegate_exception(8));
        assert!(!interrupts.should_delegate_exception(11));

        // A delegated, pending, enabled supervisor interrupt is S-ready, not M-ready.
        interrupts.write_mie(u64::MAX, u64::MAX);
        interrupts.write_mip(1 << 5, u64::MAX);
        assert_eq!(None, interrupts.highest_priority_m_ready());
        assert_eq!(
            Some(Interrupt::SupervisorTimerInterrupt),
            interrupts.highest_priority_s_ready()
        );
    }
}
