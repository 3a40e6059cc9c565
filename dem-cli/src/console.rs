//! Raw-mode standard I/O console for the guest UART.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use dem_core::resources::uart::Console;
use std::io::{self, Read, Stdout, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Puts the terminal into raw mode (no canonical input, no echo) for the duration of its
/// lifetime.
///
/// Keystrokes reach the guest verbatim, including control characters. Dropping the guard
/// restores the previous mode, so the terminal recovers on every exit path.
pub struct RawModeGuard {}

impl RawModeGuard {
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self {})
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // Ignore all errors on drop, resetting the terminal is on a best effort basis
        let _ = disable_raw_mode();
    }
}

/// Byte-stream console bridging standard input and output to the UART.
///
/// Reading standard input blocks, so a pump thread reads it byte by byte into a channel that the
/// CPU thread drains without blocking. The pump thread exits with the process once stdin reaches
/// end-of-file or the console is dropped.
pub struct StdioConsole {
    input: Receiver<u8>,
    pending: Option<u8>,
    stdout: Stdout,
}

impl StdioConsole {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut stdin = io::stdin();
            let mut byte = [0u8; 1];
            while let Ok(1) = stdin.read(&mut byte) {
                if sender.send(byte[0]).is_err() {
                    break;
                }
            }
        });
        Self {
            input: receiver,
            pending: None,
            stdout: io::stdout(),
        }
    }
}

impl Default for StdioConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for StdioConsole {
    fn has_input(&mut self) -> bool {
        if self.pending.is_none() {
            self.pending = match self.input.try_recv() {
                Ok(byte) => Some(byte),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            };
        }
        self.pending.is_some()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.has_input();
        self.pending.take()
    }

    fn write_byte(&mut self, byte: u8) {
        // Console output is best effort; a closed stdout should not take the guest down.
        let _ = self.stdout.write_all(&[byte]);
        let _ = self.stdout.flush();
    }
}
