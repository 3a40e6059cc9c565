mod console;
mod display;

use clap::Parser;
use console::{RawModeGuard, StdioConsole};
use dem_core::board::{Board, BoardError, Config};
use log::debug;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Boot a no-MMU RISC-V Linux against a minimal emulated SoC.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Flat kernel image, loaded at the base of guest RAM.
    kernel: PathBuf,
    /// Initial ramdisk image, placed after the device tree blob.
    #[cfg(not(feature = "bare"))]
    initrd: PathBuf,
}

#[derive(Error, Debug)]
enum MainError {
    #[error("failed to read {}: {}", .path.display(), .source)]
    ReadImage { path: PathBuf, source: io::Error },
    #[error("board setup: {0}")]
    Board(#[from] BoardError),
    #[error("terminal setup: {0}")]
    Terminal(io::Error),
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error(transparent)]
    Display(#[from] display::DisplayError),
    #[error("display thread panicked")]
    DisplayPanicked,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("dem: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), MainError> {
    env_logger::init();
    let args = Args::parse();

    let read_image = |path: &PathBuf| {
        fs::read(path).map_err(|source| MainError::ReadImage {
            path: path.clone(),
            source,
        })
    };
    let kernel = read_image(&args.kernel)?;

    #[cfg(not(feature = "bare"))]
    let (config, initrd) = (Config::linux(), Some(read_image(&args.initrd)?));
    #[cfg(feature = "bare")]
    let (config, initrd) = (Config::bare(), None::<Vec<u8>>);

    let mut board = Board::new(config, Box::new(StdioConsole::new()))?;
    board.load_images(&kernel, initrd.as_deref())?;

    let should_close = Arc::new(AtomicBool::new(false));
    {
        let should_close = Arc::clone(&should_close);
        ctrlc::set_handler(move || should_close.store(true, Ordering::Relaxed))?;
    }

    let _raw_mode = RawModeGuard::new().map_err(MainError::Terminal)?;

    let display_thread = {
        let pixels = board.framebuffer();
        let should_close = Arc::clone(&should_close);
        thread::spawn(move || display::run_display(pixels, should_close))
    };

    board.run(&should_close);
    debug!("waiting for the display thread");

    match display_thread.join() {
        Ok(result) => result.map_err(MainError::Display),
        Err(_) => Err(MainError::DisplayPanicked),
    }
}
