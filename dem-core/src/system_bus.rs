//! The physical address space: a flat little-endian RAM region plus a registry of memory-mapped
//! device regions.
//!
//! The address mapping is in the form of a set of memory regions. The RISC-V specification defines
//! three types of memory regions:
//! - *vacant*: address range mapped to nothing
//! - *main memory*: address range mapped to main memory
//! - *I/O regions*: address range mapped to I/O devices (anything that's not main memory)
//!
//! Main memory is addressed byte-wise and never has access side effects. I/O regions dispatch to
//! a [`MmioDevice`], which models a row of 64-bit registers: reads and writes of any width are
//! presented to the device as 64-bit accesses at the original address, with the requested byte
//! lanes extracted (loads) or merged (stores) by the bus. Device reads may have side effects.
//!
//! No two regions may overlap, and accesses to vacant ranges fault.

use crate::AddressRange;
use rangemap::RangeInclusiveMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Interface of a memory-mapped device occupying an I/O region.
///
/// A device is addressed with the absolute physical address of the access, not an offset into its
/// region. Registers are modelled as 64 bits wide at every byte address; narrower guest accesses
/// are widened by the bus (see [`MmioDevice::store_subword`]).
pub trait MmioDevice {
    /// Reads the 64-bit register at `address`. May have side effects (UART receive, PLIC claim).
    fn load64(&mut self, address: u64) -> u64;

    /// Writes the 64-bit register at `address`.
    fn store64(&mut self, address: u64, value: u64);

    /// Writes the byte lanes selected by `mask` of the 64-bit register at `address`.
    ///
    /// The default implementation performs a read-modify-write. Devices whose reads have side
    /// effects at `address` (UART data register, PLIC claim/complete register) must override this
    /// to merge without reading.
    fn store_subword(&mut self, address: u64, value: u64, mask: u64) {
        let old = self.load64(address);
        self.store64(address, old & !mask | value & mask);
    }
}

/// Shared handle to an attached device. Devices are also held by the board so that the external
/// timing loop can reach them in between instruction batches.
pub type SharedDevice = Rc<RefCell<dyn MmioDevice>>;

/// Single master interface over the entire 64-bit physical address space.
pub struct SystemBus {
    ram_range: AddressRange,
    ram: Vec<u8>,
    /// Map of physical address range to the index in `devices` of the device it is mapped to.
    regions: RangeInclusiveMap<u64, usize>,
    devices: Vec<SharedDevice>,
}

impl fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBus")
            .field("ram_range", &self.ram_range)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl SystemBus {
    /// Creates a bus with a zero-initialized RAM region of `ram_size` bytes at `ram_base` and no
    /// device regions.
    pub fn new(ram_base: u64, ram_size: u64) -> Result<Self, ResourceMappingError> {
        let ram_range = AddressRange::from_base_size(ram_base, ram_size)
            .map_err(|_| ResourceMappingError::EmptyRegion)?;
        let ram_size = usize::try_from(ram_size).map_err(|_| ResourceMappingError::EmptyRegion)?;
        Ok(Self {
            ram_range,
            ram: vec![0; ram_size],
            regions: RangeInclusiveMap::new(),
            devices: Vec::new(),
        })
    }

    /// Attaches `device` to the I/O region `range`.
    ///
    /// Fails if `range` overlaps the RAM region or a previously attached device region.
    pub fn attach_device(
        &mut self,
        range: AddressRange,
        device: SharedDevice,
    ) -> Result<(), ResourceMappingError> {
        if range.overlaps(self.ram_range) || self.regions.overlaps(&range.into()) {
            return Err(ResourceMappingError::OverlappingRegions(range));
        }
        let index = self.devices.len();
        self.devices.push(device);
        self.regions.insert(range.into(), index);
        Ok(())
    }

    pub fn ram_range(&self) -> AddressRange {
        self.ram_range
    }

    /// Copies host bytes into RAM. Only used while loading boot images.
    pub fn copy_to_ram(&mut self, address: u64, bytes: &[u8]) -> Result<(), AccessError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let offset = self.ram_offset(address, bytes.len() as u64)?;
        self.ram[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads `SIZE` bytes at `address`, returning them zero-extended as little-endian.
    fn read<const SIZE: u32>(&mut self, address: u64) -> Result<u64, AccessError> {
        const_assert!(usize::BITS >= 32);
        let size = SIZE as u64;
        debug_assert!(SIZE.is_power_of_two() && SIZE <= 8);
        if self.ram_range.contains(address) {
            let offset = self.ram_offset(address, size)?;
            let mut buf = [0u8; 8];
            buf[..SIZE as usize].copy_from_slice(&self.ram[offset..offset + SIZE as usize]);
            return Ok(u64::from_le_bytes(buf));
        }
        let (range, &index) = self
            .regions
            .get_key_value(&address)
            .ok_or(AccessError::Unmapped(address))?;
        if address + (size - 1) > *range.end() {
            return Err(AccessError::Unmapped(address));
        }
        let value = self.devices[index].borrow_mut().load64(address);
        Ok(value & lane_mask(size))
    }

    /// Writes the low `SIZE` bytes of `value` at `address` in little-endian order.
    fn write<const SIZE: u32>(&mut self, address: u64, value: u64) -> Result<(), AccessError> {
        let size = SIZE as u64;
        debug_assert!(SIZE.is_power_of_two() && SIZE <= 8);
        if self.ram_range.contains(address) {
            let offset = self.ram_offset(address, size)?;
            self.ram[offset..offset + SIZE as usize]
                .copy_from_slice(&value.to_le_bytes()[..SIZE as usize]);
            return Ok(());
        }
        let (range, &index) = self
            .regions
            .get_key_value(&address)
            .ok_or(AccessError::Unmapped(address))?;
        if address + (size - 1) > *range.end() {
            return Err(AccessError::Unmapped(address));
        }
        let mut device = self.devices[index].borrow_mut();
        match SIZE {
            8 => device.store64(address, value),
            _ => device.store_subword(address, value & lane_mask(size), lane_mask(size)),
        }
        Ok(())
    }

    pub fn read_u8(&mut self, address: u64) -> Result<u8, AccessError> {
        self.read::<1>(address).map(|v| v as u8)
    }

    pub fn read_u16(&mut self, address: u64) -> Result<u16, AccessError> {
        self.read::<2>(address).map(|v| v as u16)
    }

    pub fn read_u32(&mut self, address: u64) -> Result<u32, AccessError> {
        self.read::<4>(address).map(|v| v as u32)
    }

    pub fn read_u64(&mut self, address: u64) -> Result<u64, AccessError> {
        self.read::<8>(address)
    }

    pub fn write_u8(&mut self, address: u64, value: u8) -> Result<(), AccessError> {
        self.write::<1>(address, value as u64)
    }

    pub fn write_u16(&mut self, address: u64, value: u16) -> Result<(), AccessError> {
        self.write::<2>(address, value as u64)
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<(), AccessError> {
        self.write::<4>(address, value as u64)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), AccessError> {
        self.write::<8>(address, value)
    }

    /// Reads a 32-bit instruction parcel.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit little-endian parcels,
    /// > regardless of memory system endianness.
    pub fn fetch(&mut self, address: u64) -> Result<u32, AccessError> {
        self.read_u32(address)
    }

    /// Translates `address` to an offset into the RAM buffer, checking that the whole access of
    /// `size` bytes stays within the RAM region.
    fn ram_offset(&self, address: u64, size: u64) -> Result<usize, AccessError> {
        if !self.ram_range.contains(address) {
            return Err(AccessError::Unmapped(address));
        }
        let last = address
            .checked_add(size - 1)
            .ok_or(AccessError::Unmapped(address))?;
        if !self.ram_range.contains(last) {
            return Err(AccessError::Unmapped(address));
        }
        Ok((address - self.ram_range.start()) as usize)
    }
}

/// Mask selecting the low `size` byte lanes of a 64-bit value.
fn lane_mask(size: u64) -> u64 {
    match size {
        8 => u64::MAX,
        _ => (1u64 << (8 * size)) - 1,
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ResourceMappingError {
    /// The region overlaps with RAM or with a previously attached device region.
    #[error("memory region {0} overlaps with a previously mapped memory region")]
    OverlappingRegions(AddressRange),
    /// The region is empty or not representable.
    #[error("memory region is empty")]
    EmptyRegion,
}

/// Attempt to access an address that falls within a vacant memory region, or an access that runs
/// past the end of the region containing its start address.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum AccessError {
    #[error("address {0:#x} maps to a vacant memory region")]
    Unmapped(u64),
}

impl AccessError {
    /// The faulting address, as reported in the trap value register.
    pub fn address(&self) -> u64 {
        match *self {
            Self::Unmapped(address) => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;

    /// A device of eight 64-bit scratch registers without read side effects.
    struct Scratch {
        base: u64,
        regs: [u64; 8],
    }

    impl MmioDevice for Scratch {
        fn load64(&mut self, address: u64) -> u64 {
            self.regs[((address - self.base) >> 3) as usize]
        }

        fn store64(&mut self, address: u64, value: u64) {
            self.regs[((address - self.base) >> 3) as usize] = value;
        }
    }

    fn bus_with_scratch() -> (SystemBus, Rc<RefCell<Scratch>>) {
        let mut bus = SystemBus::new(0x8000_0000, 0x1_0000).unwrap();
        let device = Rc::new(RefCell::new(Scratch {
            base: 0x1000_0000,
            regs: [0; 8],
        }));
        bus.attach_device(address_range![0x1000_0000, 0x1000_003F], device.clone())
            .unwrap();
        (bus, device)
    }

    #[test]
    fn test_ram_round_trip() {
        let (mut bus, _) = bus_with_scratch();
        for address in (0x8000_0000u64..0x8000_0040).step_by(8) {
            bus.write_u64(address, address ^ 0x0123_4567_89AB_CDEF)
                .unwrap();
            assert_eq!(
                address ^ 0x0123_4567_89AB_CDEF,
                bus.read_u64(address).unwrap()
            );
        }
        // Little-endian byte order.
        bus.write_u64(0x8000_0100, 0x7B).unwrap();
        assert_eq!(0x7B, bus.read_u8(0x8000_0100).unwrap());
        assert_eq!(0, bus.read_u8(0x8000_0101).unwrap());
        // Misaligned RAM accesses are supported.
        bus.write_u32(0x8000_0203, 0xDEAD_BEEF).unwrap();
        assert_eq!(0xDEAD_BEEF, bus.read_u32(0x8000_0203).unwrap());
    }

    #[test]
    fn test_unmapped_access_faults() {
        let (mut bus, _) = bus_with_scratch();
        assert_eq!(
            Err(AccessError::Unmapped(0x2000_0000)),
            bus.read_u64(0x2000_0000)
        );
        assert_eq!(
            Err(AccessError::Unmapped(0x2000_0000)),
            bus.write_u8(0x2000_0000, 0)
        );
        // Access running off the end of RAM faults.
        assert_eq!(
            Err(AccessError::Unmapped(0x8000_FFFC)),
            bus.read_u64(0x8000_FFFC)
        );
        // Access running off the end of a device region faults.
        assert_eq!(
            Err(AccessError::Unmapped(0x1000_003C)),
            bus.read_u64(0x1000_003C)
        );
    }

    #[test]
    fn test_mmio_lane_extraction() {
        let (mut bus, device) = bus_with_scratch();
        device.borrow_mut().regs[0] = 0x8877_6655_4433_2211;
        assert_eq!(0x11, bus.read_u8(0x1000_0000).unwrap());
        assert_eq!(0x2211, bus.read_u16(0x1000_0000).unwrap());
        assert_eq!(0x4433_2211, bus.read_u32(0x1000_0000).unwrap());
        assert_eq!(0x8877_6655_4433_2211, bus.read_u64(0x1000_0000).unwrap());
    }

    #[test]
    fn test_mmio_subword_store_merges() {
        let (mut bus, device) = bus_with_scratch();
        device.borrow_mut().regs[1] = 0xFFFF_FFFF_FFFF_FFFF;
        bus.write_u16(0x1000_0008, 0xABCD).unwrap();
        assert_eq!(0xFFFF_FFFF_FFFF_ABCD, device.borrow().regs[1]);
        bus.write_u64(0x1000_0008, 0).unwrap();
        assert_eq!(0, device.borrow().regs[1]);
    }

    #[test]
    fn test_overlap_rejected() {
        let (mut bus, _) = bus_with_scratch();
        let device = Rc::new(RefCell::new(Scratch {
            base: 0,
            regs: [0; 8],
        }));
        assert!(bus
            .attach_device(address_range![0x1000_0020, 0x1000_0080], device.clone())
            .is_err());
        assert!(bus
            .attach_device(address_range![0x8000_0000, 0x8000_0008], device)
            .is_err());
    }

    #[test]
    fn test_copy_to_ram() {
        let (mut bus, _) = bus_with_scratch();
        bus.copy_to_ram(0x8000_0000, &[0x7B, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(0x7B, bus.read_u64(0x8000_0000).unwrap());
        assert!(bus.copy_to_ram(0x8000_FFFF, &[1, 2]).is_err());
    }
}
