//! The SoC assembly: a single RV64IMA core, RAM, and the memory-mapped peripherals a no-MMU
//! Linux kernel expects, together with the external timing loop that drives them.

use crate::core::{Config as CoreConfig, Core, InterruptLines};
use crate::fdt::{self, FramebufferLayout, Region, SocLayout};
use crate::registers::Specifier;
use crate::resources::clint::Clint;
use crate::resources::framebuffer::{FramePixels, Framebuffer};
use crate::resources::plic::Plic;
use crate::resources::uart::{Console, Uart};
use crate::system_bus::{ResourceMappingError, SystemBus};
use crate::{align_up, AddressRange};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const PLIC_BASE: u64 = 0x0C00_0000;
pub const PLIC_SIZE: u64 = 0x0400_0000;
pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;
pub const CLINT_BASE: u64 = 0x1100_0000;
pub const CLINT_SIZE: u64 = 0x1_0000;
pub const FRAMEBUFFER_BASE: u64 = 0x5000_0000;
pub const FRAMEBUFFER_WIDTH: u32 = 600;
pub const FRAMEBUFFER_HEIGHT: u32 = 400;

/// Ticks of mtime per second: one tick is one microsecond.
pub const TIMEBASE_FREQUENCY: u32 = 1_000_000;

/// Upper bound on the instructions attempted in a single [`Core::step`] call.
const MAX_BATCH: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub ram_base: u64,
    pub ram_size: u64,
    pub with_plic: bool,
}

impl Config {
    /// The profile for booting a kernel with an initial ramdisk: 1 GiB of RAM at the conventional
    /// RISC-V load address, PLIC present.
    pub fn linux() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_size: 1 << 30,
            with_plic: true,
        }
    }

    /// The profile for a single flat image: 128 MiB of RAM at guest physical zero, no PLIC.
    pub fn bare() -> Self {
        Self {
            ram_base: 0,
            ram_size: 128 << 20,
            with_plic: false,
        }
    }
}

/// Where the boot images ended up in guest physical memory.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub kernel_size: u64,
    pub dtb_addr: u64,
    pub dtb_size: u64,
    pub initrd: Option<Region>,
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("memory map: {0}")]
    Mapping(#[from] ResourceMappingError),
    #[error("device tree: {0}")]
    Fdt(#[from] fdt::FdtError),
    #[error("{0} image does not fit in guest RAM")]
    ImageDoesNotFit(&'static str),
}

/// A board with a single core. Multiprocessing is not supported.
///
/// > A RISC-V hardware platform can contain one or more RISC-V-compatible processing cores
/// > together with other non-RISC-V-compatible cores, fixed-function accelerators, various
/// > physical memory structures, I/O devices, and an interconnect structure to allow the
/// > components to communicate.
///
/// The board keeps shared handles to the devices the timing loop needs to reach in between
/// instruction batches; the core reaches them through the system bus.
#[derive(Debug)]
pub struct Board {
    config: Config,
    core: Core,
    clint: Rc<RefCell<Clint>>,
    plic: Option<Rc<RefCell<Plic>>>,
    uart: Rc<RefCell<Uart>>,
    framebuffer: Arc<FramePixels>,
}

impl Board {
    pub fn new(config: Config, console: Box<dyn Console>) -> Result<Self, BoardError> {
        let lines = InterruptLines::new();
        let mut system_bus = SystemBus::new(config.ram_base, config.ram_size)?;

        let clint = Rc::new(RefCell::new(Clint::new(
            CLINT_BASE,
            lines.msip.clone(),
            lines.mtip.clone(),
        )));
        system_bus.attach_device(region_range(CLINT_BASE, CLINT_SIZE), clint.clone())?;

        let uart = Rc::new(RefCell::new(Uart::new(UART_BASE, console)));
        system_bus.attach_device(region_range(UART_BASE, UART_SIZE), uart.clone())?;

        let plic = match config.with_plic {
            true => {
                let plic = Rc::new(RefCell::new(Plic::new(PLIC_BASE, lines.meip.clone())));
                system_bus.attach_device(region_range(PLIC_BASE, PLIC_SIZE), plic.clone())?;
                Some(plic)
            }
            false => None,
        };

        let framebuffer_device = Framebuffer::new(
            FRAMEBUFFER_BASE,
            FRAMEBUFFER_WIDTH,
            FRAMEBUFFER_HEIGHT,
        );
        let framebuffer = framebuffer_device.pixels();
        system_bus.attach_device(
            region_range(FRAMEBUFFER_BASE, framebuffer.size_bytes()),
            Rc::new(RefCell::new(framebuffer_device)),
        )?;

        let core = Core::new(
            system_bus,
            CoreConfig {
                hart_id: 0,
                reset_vector: config.ram_base,
            },
            lines,
        );

        Ok(Self {
            config,
            core,
            clint,
            plic,
            uart,
            framebuffer,
        })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Returns a handle to the framebuffer pixels for the display thread.
    pub fn framebuffer(&self) -> Arc<FramePixels> {
        Arc::clone(&self.framebuffer)
    }

    pub fn plic(&self) -> Option<&Rc<RefCell<Plic>>> {
        self.plic.as_ref()
    }

    /// The kernel command line advertised through the chosen node.
    pub fn bootargs(&self) -> String {
        format!(
            "earlycon=uart8250,mmio,{UART_BASE:#x},{TIMEBASE_FREQUENCY} console=ttyS0"
        )
    }

    /// Loads the boot images and establishes the boot register state.
    ///
    /// The kernel goes to the base of RAM, the device tree blob directly after it, and the initrd
    /// directly after that, each rounded up to an 8-byte boundary. On return the core is ready to
    /// run: `x10` holds the hart id, `x11` the blob address, and the pc sits on the kernel entry
    /// point.
    pub fn load_images(
        &mut self,
        kernel: &[u8],
        initrd: Option<&[u8]>,
    ) -> Result<BootInfo, BoardError> {
        let ram_base = self.config.ram_base;
        let bootargs = self.bootargs();
        let mut dtb = fdt::build_device_tree(&self.soc_layout(), &bootargs, initrd.is_some())?;

        let dtb_addr = align_up(ram_base + kernel.len() as u64, 8);
        let initrd_region = initrd.map(|initrd| Region {
            base: align_up(dtb_addr + dtb.len() as u64, 8),
            size: initrd.len() as u64,
        });
        if let Some(region) = initrd_region {
            fdt::patch_initrd(&mut dtb, region.base, region.base + region.size)?;
        }

        let bus = self.core.system_bus_mut();
        bus.copy_to_ram(ram_base, kernel)
            .map_err(|_| BoardError::ImageDoesNotFit("kernel"))?;
        bus.copy_to_ram(dtb_addr, &dtb)
            .map_err(|_| BoardError::ImageDoesNotFit("device tree"))?;
        if let (Some(region), Some(initrd)) = (initrd_region, initrd) {
            bus.copy_to_ram(region.base, initrd)
                .map_err(|_| BoardError::ImageDoesNotFit("initrd"))?;
        }

        let registers = self.core.registers_mut();
        registers.set_x(Specifier::X10, 0);
        registers.set_x(Specifier::X11, dtb_addr);
        *registers.pc_mut() = ram_base;

        info!("kernel: {} bytes at {ram_base:#x}", kernel.len());
        info!("dtb: {} bytes at {dtb_addr:#x}", dtb.len());
        if let Some(region) = initrd_region {
            info!("initrd: {} bytes at {:#x}", region.size, region.base);
        }
        info!("bootargs: {bootargs}");

        Ok(BootInfo {
            kernel_size: kernel.len() as u64,
            dtb_addr,
            dtb_size: dtb.len() as u64,
            initrd: initrd_region,
        })
    }

    /// Runs the guest until `should_close` is observed.
    ///
    /// Instructions execute in batches sized from a smoothed instructions-per-microsecond
    /// estimate, so that a pending timer deadline is neither overshot by a long batch nor
    /// nibbled at one instruction at a time. Between batches the wall clock is folded into
    /// mtime and the interrupt lines are refreshed. While the hart sits in WFI the thread
    /// sleeps toward the timer deadline in short slices, waking early when console input
    /// arrives.
    pub fn run(&mut self, should_close: &AtomicBool) {
        let boot = Instant::now();
        // Smoothed estimate of simulated instructions per host microsecond.
        let mut ips: u64 = 1;
        while !should_close.load(Ordering::Relaxed) {
            let mut executed: u64 = 0;
            let batch_start = Instant::now();
            while executed < 1000 && !should_close.load(Ordering::Relaxed) {
                if !self.core.is_waiting_for_interrupt() {
                    executed += self.core.step(self.batch_size(ips));
                } else {
                    // Pending interrupts are delivered inside step even when no instruction
                    // retires.
                    self.core.step(1);
                    if self.core.is_waiting_for_interrupt() {
                        self.sleep_toward_deadline(should_close);
                    }
                }
                self.sync_devices(boot);
            }
            let elapsed = batch_start.elapsed().as_micros() as u64;
            if elapsed > 0 && executed > 0 {
                ips = ((ips * 8 + (executed / elapsed) * 2) / 10).max(1);
            }
        }
        debug!("run loop exiting");
    }

    /// Advances mtime from the host clock and re-evaluates the timer and external interrupt
    /// lines. Called in between instruction batches.
    fn sync_devices(&mut self, boot: Instant) {
        let now_us = boot.elapsed().as_micros() as u64;
        self.clint.borrow_mut().sync_mtime(now_us);
        if let Some(plic) = &self.plic {
            plic.borrow_mut().refresh();
        }
    }

    /// Picks how many instructions to attempt before the next device sync: enough to make
    /// progress, few enough not to sail past an armed timer deadline.
    fn batch_size(&self, ips: u64) -> u64 {
        match self.clint.borrow().time_until_deadline() {
            Some(time_left) => (time_left.saturating_mul(ips)).clamp(1, MAX_BATCH),
            None => 10,
        }
    }

    /// Sleeps up to the armed timer deadline in slices of at most one millisecond, returning
    /// early when new console input arrives or shutdown is requested.
    ///
    /// Input that was already pending when the hart stalled does not cut the sleep short: the
    /// UART has no interrupt line, so the guest can only notice it on its own timer-driven poll
    /// anyway, and returning early for it would spin the host until that poll fires.
    fn sleep_toward_deadline(&mut self, should_close: &AtomicBool) {
        let input_already_pending = self.uart.borrow_mut().has_input();
        let mut remaining = self
            .clint
            .borrow()
            .time_until_deadline()
            .unwrap_or(1000);
        while remaining > 0 && !should_close.load(Ordering::Relaxed) {
            if !input_already_pending && self.uart.borrow_mut().has_input() {
                break;
            }
            let slice = remaining.min(1000);
            std::thread::sleep(Duration::from_micros(slice));
            remaining -= slice;
        }
    }

    fn soc_layout(&self) -> SocLayout {
        SocLayout {
            ram_base: self.config.ram_base,
            ram_size: self.config.ram_size,
            timebase_frequency: TIMEBASE_FREQUENCY,
            uart: Region {
                base: UART_BASE,
                size: UART_SIZE,
            },
            clint: Region {
                base: CLINT_BASE,
                size: CLINT_SIZE,
            },
            plic: self.plic.as_ref().map(|_| Region {
                base: PLIC_BASE,
                size: PLIC_SIZE,
            }),
            framebuffer: Some(FramebufferLayout {
                base: FRAMEBUFFER_BASE,
                width: FRAMEBUFFER_WIDTH,
                height: FRAMEBUFFER_HEIGHT,
            }),
        }
    }
}

fn region_range(base: u64, size: u64) -> AddressRange {
    AddressRange::from_base_size(base, size).expect("device region layout is static")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestConsoleState {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct TestConsole(Arc<Mutex<TestConsoleState>>);

    impl Console for TestConsole {
        fn has_input(&mut self) -> bool {
            !self.0.lock().unwrap().input.is_empty()
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.0.lock().unwrap().input.pop_front()
        }

        fn write_byte(&mut self, byte: u8) {
            self.0.lock().unwrap().output.push(byte);
        }
    }

    fn small_config() -> Config {
        Config {
            ram_base: 0x8000_0000,
            ram_size: 4 << 20,
            with_plic: true,
        }
    }

    fn board(config: Config) -> (Board, TestConsole) {
        let console = TestConsole::default();
        let board = Board::new(config, Box::new(console.clone())).unwrap();
        (board, console)
    }

    #[test]
    fn test_bootargs_format() {
        let (board, _) = board(small_config());
        assert_eq!(
            "earlycon=uart8250,mmio,0x10000000,1000000 console=ttyS0",
            board.bootargs()
        );
    }

    #[test]
    fn test_boot_layout() {
        let (mut board, _) = board(small_config());
        let kernel = vec![0x13u8; 100]; // 100 bytes of addi x0, x0, 0 filler
        let initrd = vec![0xA5u8; 4096];
        let boot_info = board.load_images(&kernel, Some(&initrd)).unwrap();

        assert_eq!(100, boot_info.kernel_size);
        // The blob lands on the first 8-byte boundary after the kernel.
        assert_eq!(0x8000_0068, boot_info.dtb_addr);
        let initrd_region = boot_info.initrd.unwrap();
        assert_eq!(
            align_up(boot_info.dtb_addr + boot_info.dtb_size, 8),
            initrd_region.base
        );
        assert_eq!(4096, initrd_region.size);

        // Boot register file: a0 = hart id, a1 = blob address, pc = kernel entry.
        let registers = board.core().registers();
        assert_eq!(0, registers.x(Specifier::X10));
        assert_eq!(boot_info.dtb_addr, registers.x(Specifier::X11));
        assert_eq!(0x8000_0000, registers.pc());

        // The blob placed in guest memory is a valid device tree with the patched initrd range.
        let mut blob = vec![0u8; boot_info.dtb_size as usize];
        for (offset, byte) in blob.iter_mut().enumerate() {
            *byte = board
                .core_mut()
                .system_bus_mut()
                .read_u8(boot_info.dtb_addr + offset as u64)
                .unwrap();
        }
        let fdt = ::fdt::Fdt::new(&blob).unwrap();
        let chosen = fdt.find_node("/chosen").unwrap();
        assert_eq!(
            initrd_region.base,
            u64::from_be_bytes(
                chosen
                    .property("linux,initrd-start")
                    .unwrap()
                    .value
                    .try_into()
                    .unwrap()
            )
        );
        assert_eq!(
            initrd_region.base + initrd_region.size,
            u64::from_be_bytes(
                chosen
                    .property("linux,initrd-end")
                    .unwrap()
                    .value
                    .try_into()
                    .unwrap()
            )
        );

        // The initrd bytes are in place.
        assert_eq!(
            0xA5,
            board
                .core_mut()
                .system_bus_mut()
                .read_u8(initrd_region.base)
                .unwrap()
        );
    }

    #[test]
    fn test_uart_reachable_through_bus() {
        let (mut board, console) = board(small_config());
        console.0.lock().unwrap().input.push_back(b'A');
        let bus = board.core_mut().system_bus_mut();
        assert_eq!(0x61, bus.read_u8(UART_BASE + 0x5).unwrap());
        assert_eq!(b'A', bus.read_u8(UART_BASE).unwrap());
        bus.write_u8(UART_BASE, b'B').unwrap();
        assert_eq!(b"B", console.0.lock().unwrap().output.as_slice());
    }

    #[test]
    fn test_bare_profile_has_no_plic() {
        let (mut board, _) = board(Config {
            ram_base: 0,
            ram_size: 4 << 20,
            with_plic: false,
        });
        assert!(board.plic().is_none());
        // The PLIC region is vacant and faults.
        assert!(board
            .core_mut()
            .system_bus_mut()
            .read_u32(PLIC_BASE + 4)
            .is_err());
        // The framebuffer is still mapped.
        assert!(board
            .core_mut()
            .system_bus_mut()
            .write_u32(FRAMEBUFFER_BASE, 0x00FF_0000)
            .is_ok());
    }

    #[test]
    fn test_plic_claim_reflected_in_meip() {
        let (mut board, _) = board(small_config());
        let plic = board.plic().unwrap().clone();
        {
            let mut plic = plic.borrow_mut();
            use crate::system_bus::MmioDevice;
            plic.store64(PLIC_BASE + 4 * 5, 2); // priority[5] = 2
            plic.store64(PLIC_BASE + 0x2000, 1 << 5); // enable[5]
            plic.raise(5);
        }
        let bus = board.core_mut().system_bus_mut();
        // Claim through the bus returns the source and clears it.
        assert_eq!(5, bus.read_u32(PLIC_BASE + 0x20_0004).unwrap());
        assert_eq!(0, bus.read_u32(PLIC_BASE + 0x20_0004).unwrap());
    }
}
