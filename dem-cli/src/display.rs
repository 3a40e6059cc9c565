//! Host window presenting the guest framebuffer.

use dem_core::resources::framebuffer::FramePixels;
use minifb::{Window, WindowOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Target cadence of roughly 30 frames per second.
const FRAME_TIME: Duration = Duration::from_micros(33_333);

#[derive(Error, Debug)]
#[error("framebuffer window: {0}")]
pub struct DisplayError(#[from] minifb::Error);

/// Opens the window and redraws until it is closed or `should_close` is observed.
///
/// Each frame snapshots the shared pixels into a local buffer (converting `a8r8g8b8` to the
/// window's `x8r8g8b8`) and presents it. Tearing against the CPU thread is acceptable. On return
/// `should_close` is set, so the CPU thread winds down together with the window.
pub fn run_display(
    pixels: Arc<FramePixels>,
    should_close: Arc<AtomicBool>,
) -> Result<(), DisplayError> {
    let width = pixels.width() as usize;
    let height = pixels.height() as usize;
    let result = (|| {
        let mut window = Window::new("dem", width, height, WindowOptions::default())?;
        window.limit_update_rate(Some(FRAME_TIME));
        let mut frame = vec![0u32; width * height];
        while window.is_open() && !should_close.load(Ordering::Relaxed) {
            pixels.snapshot_into(&mut frame);
            window.update_with_buffer(&frame, width, height)?;
        }
        Ok(())
    })();
    should_close.store(true, Ordering::Relaxed);
    result
}
