#![no_std]
//! Differential, vsync-synchronised driver core for ILI9488 TFT displays.
//!
//! The driver keeps one or two in-memory framebuffers mirroring the panel,
//! computes a compact run-length diff between the committed mirror and each
//! new frame, and streams only the changed runs over the serial link. Uploads
//! are synchronised to the panel's internal scan position so that partial
//! updates never visibly tear, and can run either inline or from an
//! interrupt-driven DMA pipeline that needs no CPU attention between runs.
//!
//! Hardware access goes through the [`DisplayHw`] trait, so the core is
//! portable across HALs and fully testable on the host. The interrupt side of
//! an asynchronous upload lives in an [`UploadCell`] the embedder places in a
//! `static` and routes both the DMA-completion interrupt and the one-shot
//! deadline-timer interrupt into.

#[cfg(test)]
extern crate std;

use core::error::Error as CoreError;
use core::fmt;

pub mod buffer;
pub mod bus;
pub mod diff;
pub mod hw;
pub mod ili9488;
pub mod pipeline;
pub mod rotation;
pub mod scanline;

mod log;
#[cfg(test)]
pub(crate) mod testhw;

pub use buffer::Framebuffer;
pub use bus::{DisplayBus, SpiDisplayBus};
pub use diff::{DiffBuf, DiffOp};
pub use hw::{DeadlineTimer, DisplayHw, HwParts, Ticker};
pub use ili9488::{BufferingMode, Ili9488, UploadStats};
pub use pipeline::UploadCell;
pub use rotation::Rotation;

/// Native panel width in pixels (portrait columns).
pub const PANEL_WIDTH: u16 = 320;
/// Native panel height in pixels (portrait pages).
pub const PANEL_HEIGHT: u16 = 480;
/// Total pixel count of the panel.
pub const PANEL_PIXELS: usize = PANEL_WIDTH as usize * PANEL_HEIGHT as usize;
/// Lines counted by the panel's internal timing generator per refresh.
///
/// This is independent of the 480 native pages: the generator steps 320 times
/// per sweep, so one timing line covers one and a half pages. All beam
/// arithmetic is in timing lines; see [`scanline`].
pub const SCAN_LINES: u16 = 320;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument was out of range for the operation.
    InvalidArgument,
    /// The display has not been initialised with [`Ili9488::begin`].
    Uninitialized,
    /// The display is asleep and must be woken first.
    Sleeping,
    /// The panel's status registers never matched the expected constants
    /// during bring-up. The driver refuses updates in this state.
    BringUp,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "argument out of range"),
            Error::Uninitialized => write!(f, "display not initialised"),
            Error::Sleeping => write!(f, "display is asleep"),
            Error::BringUp => write!(f, "panel bring-up failed"),
        }
    }
}

impl CoreError for Error {}
