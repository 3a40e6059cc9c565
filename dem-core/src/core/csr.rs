//! Specifiers for the implemented CSRs.
//!
//! Only the machine- and supervisor-level registers needed to boot a no-MMU supervisor are backed
//! by state. Every other specifier reads as zero and ignores writes, provided the access passes
//! the privilege check encoded in the specifier itself.

use crate::RawPrivilegeLevel;

/// General 12-bit value representing a CSR specifier. Note that this can hold any 12-bit value,
/// even if the value represents an unsupported or non-existent CSR.
pub type CsrSpecifier = u16;

//
// Supervisor trap setup (`0x100`, `0x104..=0x105`).
//
/// Supervisor status register; a restricted view of [`MSTATUS`].
pub const SSTATUS: CsrSpecifier = 0x100;
/// Supervisor interrupt-enable register; a restricted view of [`MIE`].
pub const SIE: CsrSpecifier = 0x104;
/// Supervisor trap handler base address.
pub const STVEC: CsrSpecifier = 0x105;

//
// Supervisor trap handling (`0x140..=0x144`).
//
/// Scratch register for supervisor trap handling.
pub const SSCRATCH: CsrSpecifier = 0x140;
/// Supervisor exception program counter.
pub const SEPC: CsrSpecifier = 0x141;
/// Supervisor trap cause.
pub const SCAUSE: CsrSpecifier = 0x142;
/// Supervisor bad address or instruction.
pub const STVAL: CsrSpecifier = 0x143;
/// Supervisor interrupt pending; a restricted view of [`MIP`].
pub const SIP: CsrSpecifier = 0x144;

//
// Machine information registers (`0xF14`).
//
/// Hardware thread ID.
pub const MHARTID: CsrSpecifier = 0xF14;

//
// Machine trap setup (`0x300..=0x305`).
//
/// Machine status register.
pub const MSTATUS: CsrSpecifier = 0x300;
/// ISA and extensions.
pub const MISA: CsrSpecifier = 0x301;
/// Machine exception delegation register.
pub const MEDELEG: CsrSpecifier = 0x302;
/// Machine interrupt delegation register.
pub const MIDELEG: CsrSpecifier = 0x303;
/// Machine interrupt-enable register.
pub const MIE: CsrSpecifier = 0x304;
/// Machine trap-handler base address.
pub const MTVEC: CsrSpecifier = 0x305;

//
// Machine trap handling (`0x340..=0x344`).
//
/// Scratch register for machine trap handlers.
pub const MSCRATCH: CsrSpecifier = 0x340;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Machine bad address or instruction.
pub const MTVAL: CsrSpecifier = 0x343;
/// Machine interrupt pending.
pub const MIP: CsrSpecifier = 0x344;

/// Returns the lowest privilege level that is allowed to access the CSR specified by `specifier`.
///
/// > By convention, the upper 4 bits of the CSR address (csr\[11:8]) are used to encode the read
/// > and write accessibility of the CSRs according to privilege level. The top two bits
/// > (csr\[11:10]) indicate whether the register is read/write (00, 01, or 10) or read-only (11).
/// > The next two bits (csr\[9:8]) encode the lowest privilege level that can access the CSR.
pub fn required_privilege_level(specifier: CsrSpecifier) -> RawPrivilegeLevel {
    RawPrivilegeLevel::from_u2(((specifier >> 8) & 0b11) as u8)
}

/// Returns `true` if the CSR specified by `specifier` is read-only.
///
/// Note that this is only based on the accessibility encoded in the specifier, it does not take
/// into account whether the CSR's value can effectively be modified (e.g. a read-write CSR can
/// still be WARL with all fields read-only).
pub fn is_read_only(specifier: CsrSpecifier) -> bool {
    (specifier >> 10) & 0b11 == 0b11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_privilege_level() {
        assert_eq!(
            RawPrivilegeLevel::Machine,
            required_privilege_level(MSTATUS)
        );
        assert_eq!(RawPrivilegeLevel::Machine, required_privilege_level(MHARTID));
        assert_eq!(
            RawPrivilegeLevel::Supervisor,
            required_privilege_level(SSTATUS)
        );
        assert_eq!(RawPrivilegeLevel::User, required_privilege_level(0x001));
    }

    #[test]
    fn test_is_read_only() {
        assert!(is_read_only(MHARTID));
        assert!(is_read_only(0xC00));
        assert!(!is_read_only(MSTATUS));
        assert!(!is_read_only(SSCRATCH));
    }
}
