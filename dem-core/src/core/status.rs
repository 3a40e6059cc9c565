use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::{PrivilegeLevel, RawPrivilegeLevel};

// Bit indices of the mstatus fields backed by this implementation.
mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
}

/// Mask of the mstatus bits that are writable through the CSR interface.
#[allow(clippy::identity_op)]
const MSTATUS_WRITABLE_MASK: u64 = 0
    | (1 << idx::SIE)
    | (1 << idx::MIE)
    | (1 << idx::SPIE)
    | (1 << idx::MPIE)
    | (1 << idx::SPP)
    | (0b11 << idx::MPP)
    | (1 << idx::MPRV)
    | (1 << idx::SUM)
    | (1 << idx::MXR);

/// Mask to be applied to mstatus to get sstatus.
///
/// The visible fields are SIE, SPIE, UBE, SPP, VS, FS, XS, SUM, MXR, UXL, and SD.
const SSTATUS_MASK: u64 = 0x8000_0003_000D_E762;

/// Mask of the sstatus bits that are writable through the CSR interface.
const SSTATUS_WRITABLE_MASK: u64 = MSTATUS_WRITABLE_MASK & SSTATUS_MASK;

/// The read-only UXL and SXL fields, both hardwired to `2` (XLEN=64 in U- and S-mode).
const UXL_SXL_64: u64 = (2 << 32) | (2 << 34);

/// Provides the mstatus register and its sstatus view.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The mstatus register keeps
/// > track of and controls the hart's current operating state. A restricted view of mstatus
/// > appears as the sstatus register in the S-level ISA.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            mstatus: 0x0000_0000_0000_0000,
        }
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**, so this is always a defined privilege level.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .try_into()
        .unwrap()
    }

    /// Sets the privilege level encoded by the MPP (M-mode Previous Privilege level) field to
    /// `value`.
    ///
    /// The MPP field is **WARL**.
    pub fn set_mpp(&mut self, value: RawPrivilegeLevel) {
        let Ok(value) = PrivilegeLevel::try_from(value) else {
            // MPP is a WARL field, so ignore illegal values.
            return;
        };
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    ///
    /// The SPP field is **WARL**.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the privilege level encoded by the SPP (S-mode Previous Privilege level) field to
    /// `value`.
    ///
    /// The SPP field is **WARL**.
    pub fn set_spp(&mut self, value: RawPrivilegeLevel) {
        match PrivilegeLevel::try_from(value) {
            Ok(value) if value <= PrivilegeLevel::Supervisor => {
                let bit = value as u8 != 0;
                self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
            }
            _ => {} // SPP is a WARL field, so ignore illegal values.
        };
    }

    /// Reads the full mstatus register, including the hardwired UXL and SXL fields.
    pub fn read_mstatus(&self) -> u64 {
        self.mstatus | UXL_SXL_64
    }

    /// Writes the mstatus register. Bits outside the writable fields are ignored, and the WARL
    /// MPP field silently drops the reserved encoding.
    pub fn write_mstatus(&mut self, value: u64, mask: u64) {
        let mask = mask & MSTATUS_WRITABLE_MASK;
        let old_mpp = self.mpp();
        self.mstatus = self.mstatus & !mask | value & mask;
        // Re-apply the WARL rule in case the write landed a reserved MPP encoding.
        let mpp_u2: u8 = self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le();
        if RawPrivilegeLevel::from_u2(mpp_u2).is_reserved() {
            self.set_mpp(old_mpp.into());
        }
    }

    /// Reads the sstatus register, the S-mode restricted view of mstatus.
    pub fn read_sstatus(&self) -> u64 {
        self.read_mstatus() & SSTATUS_MASK
    }

    /// Writes the sstatus register; only the S-mode visible writable fields are affected.
    pub fn write_sstatus(&mut self, value: u64, mask: u64) {
        self.write_mstatus(value, mask & SSTATUS_WRITABLE_MASK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_enable_bits() {
        let mut status = Status::new();
        assert!(!status.mie());
        status.set_mie(true);
        assert!(status.mie());
        assert!(!status.sie());
        status.set_mie(false);
        status.set_sie(true);
        assert!(status.sie());
        assert!(!status.mie());
    }

    #[test]
    fn test_mpp_warl() {
        let mut status = Status::new();
        status.set_mpp(RawPrivilegeLevel::Machine);
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
        // The reserved encoding is dropped, keeping the previous value.
        status.set_mpp(RawPrivilegeLevel::Reserved);
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
        status.set_mpp(RawPrivilegeLevel::User);
        assert_eq!(PrivilegeLevel::User, status.mpp());
    }

    #[test]
    fn test_mstatus_round_trip() {
        let mut status = Status::new();
        status.write_mstatus(u64::MAX, u64::MAX);
        let read = status.read_mstatus();
        // Every writable bit is set (MPP saturates at M = 0b11).
        assert_eq!(read & MSTATUS_WRITABLE_MASK, MSTATUS_WRITABLE_MASK);
        // UXL and SXL are hardwired to 64-bit.
        assert_eq!(UXL_SXL_64, read & UXL_SXL_64);
        status.write_mstatus(0, u64::MAX);
        assert_eq!(UXL_SXL_64, status.read_mstatus());
    }

    #[test]
    fn test_sstatus_view() {
        let mut status = Status::new();
        status.set_mie(true);
        status.set_sie(true);
        status.set_spie(true);
        let sstatus = status.read_sstatus();
        // MIE is not visible in sstatus, SIE and SPIE are.
        assert_eq!(0, sstatus & (1 << 3));
        assert_ne!(0, sstatus & (1 << 1));
        assert_ne!(0, sstatus & (1 << 5));
        // Writes through sstatus cannot touch MIE.
        status.write_sstatus(0, u64::MAX);
        assert!(status.mie());
        assert!(!status.sie());
    }
}
