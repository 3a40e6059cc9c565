//! An 8250-compatible character device, reduced to the registers the guest actually touches.
//!
//! Resources:
//! - <https://uart16550.readthedocs.io>
//! - <https://github.com/qemu/qemu/blob/master/hw/char/serial.c>
//!
//! The device has no FIFO and no interrupt wiring; the guest discovers input by polling the line
//! status register. Bytes flow directly between the guest and a [`Console`] supplied by the
//! embedder.

use crate::system_bus::MmioDevice;
use std::fmt;

/// Offset of the receive (read) / transmit (write) data register.
pub const DATA_OFFSET: u64 = 0x0;
/// Offset of the line status register.
pub const LINE_STATUS_OFFSET: u64 = 0x5;

/// Transmitter Holding Register Empty and Transmitter Empty; the transmit path never stalls, so
/// both indicators are permanently set.
const LSR_THRE_TEMT: u64 = 0x60;

/// Host-side byte source and sink the UART talks to.
///
/// The CPU thread owns the console; implementations do not need to be thread-safe, but they must
/// never block in any of these methods.
pub trait Console {
    /// Returns `true` if at least one byte is available to read.
    fn has_input(&mut self) -> bool;

    /// Takes the next available input byte, if any.
    fn read_byte(&mut self) -> Option<u8>;

    /// Emits one byte to the host output. Implementations flush immediately.
    fn write_byte(&mut self, byte: u8);
}

pub struct Uart {
    base: u64,
    console: Box<dyn Console>,
}

impl fmt::Debug for Uart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uart").field("base", &self.base).finish_non_exhaustive()
    }
}

impl Uart {
    pub fn new(base: u64, console: Box<dyn Console>) -> Self {
        Self { base, console }
    }

    /// Returns `true` if the console has input waiting to be consumed by the guest. The external
    /// timing loop uses this to cut a WFI sleep short.
    pub fn has_input(&mut self) -> bool {
        self.console.has_input()
    }
}

impl MmioDevice for Uart {
    fn load64(&mut self, address: u64) -> u64 {
        match address - self.base {
            // Reading the data register consumes one input byte; an empty queue reads as zero.
            DATA_OFFSET => self.console.read_byte().unwrap_or(0) as u64,
            LINE_STATUS_OFFSET => LSR_THRE_TEMT | self.console.has_input() as u64,
            _ => 0,
        }
    }

    fn store64(&mut self, address: u64, value: u64) {
        if address - self.base == DATA_OFFSET {
            self.console.write_byte(value as u8);
        }
    }

    /// The data register consumes input when read, so sub-word stores must not go through the
    /// default read-modify-write.
    fn store_subword(&mut self, address: u64, value: u64, mask: u64) {
        self.store64(address, value & mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Mutex;

    const BASE: u64 = 0x1000_0000;

    #[derive(Default)]
    struct TestConsoleState {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct TestConsole(Rc<Mutex<TestConsoleState>>);

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

    fn uart_with_console() -> (Uart, TestConsole) {
        let console = TestConsole::default();
        let uart = Uart::new(BASE, Box::new(console.clone()));
        (uart, console)
    }

    #[test]
    fn test_echo() {
        let (mut uart, console) = uart_with_console();
        console.0.lock().unwrap().input.push_back(b'A');
        assert_eq!(0x61, uart.load64(BASE + LINE_STATUS_OFFSET));
        assert_eq!(0x41, uart.load64(BASE + DATA_OFFSET));
        uart.store64(BASE + DATA_OFFSET, 0x42);
        assert_eq!(b"B", console.0.lock().unwrap().output.as_slice());
    }

    #[test]
    fn test_empty_input_reads_zero() {
        let (mut uart, _console) = uart_with_console();
        assert_eq!(0x60, uart.load64(BASE + LINE_STATUS_OFFSET));
        assert_eq!(0, uart.load64(BASE + DATA_OFFSET));
    }

    #[test]
    fn test_unmodelled_offsets() {
        let (mut uart, console) = uart_with_console();
        assert_eq!(0, uart.load64(BASE + 0x1));
        uart.store64(BASE + 0x4, 0xFF);
        assert!(console.0.lock().unwrap().output.is_empty());
    }

    #[test]
    fn test_subword_store_does_not_consume_input() {
        let (mut uart, console) = uart_with_console();
        console.0.lock().unwrap().input.push_back(b'A');
        uart.store_subword(BASE + DATA_OFFSET, 0x42, 0xFF);
        // The pending input byte is still there and the output byte went out.
        assert_eq!(0x61, uart.load64(BASE + LINE_STATUS_OFFSET));
        assert_eq!(b"B", console.0.lock().unwrap().output.as_slice());
    }
}
