//! The serial link to the panel.
//!
//! [`DisplayBus`] is the one seam both execution contexts talk through: the
//! caller for commands and synchronous pixel pushes, the upload interrupt for
//! window commands and DMA pixel bursts. [`SpiDisplayBus`] adapts any
//! `embedded-hal` SPI bus plus a data/command pin; HALs with a real DMA
//! channel implement the trait directly.

use core::error::Error as CoreError;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::log::trace;

/// Byte-level access to the panel's serial interface.
///
/// Command writes are short and blocking. Pixel payloads are always whole
/// 3-byte groups (one pixel per 24-bit frame, MSB first; the panel, running
/// in 18-bit mode, latches the upper six bits of each byte and discards the
/// rest of the frame).
pub trait DisplayBus {
    type Error: CoreError;

    /// Sends a command byte followed by its parameter bytes.
    fn write_command(&mut self, command: u8, args: &[u8]) -> Result<(), Self::Error>;

    /// Sends a command byte and reads `out.len()` parameter bytes back.
    fn read_command(&mut self, command: u8, out: &mut [u8]) -> Result<(), Self::Error>;

    /// Blocking pixel-data write.
    fn write_pixels(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Arms a pixel-data transfer of `len` bytes starting at `ptr` and
    /// returns immediately. Completion must raise the interrupt the embedder
    /// routes into [`crate::UploadCell::on_interrupt`].
    ///
    /// On cores with a data cache the implementation must clean the cache
    /// lines spanning the buffer before starting the channel; the bytes are
    /// never re-read by the CPU, so no invalidation is needed afterwards.
    ///
    /// # Safety
    ///
    /// The bytes must stay valid and unmodified until the completion
    /// interrupt fires (or [`DisplayBus::poll_completion`] observes the
    /// completion). The upload pipeline guarantees this by sourcing bursts
    /// from its own staging memory inside a `static`.
    unsafe fn start_pixels(&mut self, ptr: *const u8, len: usize);

    /// True while a transfer started by [`DisplayBus::start_pixels`] is
    /// still moving data.
    fn dma_busy(&self) -> bool;

    /// Returns true once per completed transfer whose interrupt has not been
    /// serviced. Lets barriers make progress when the completion interrupt
    /// is not wired (and is how host tests pump the pipeline).
    fn poll_completion(&mut self) -> bool;

    /// Drains any transmit FIFO and releases the bus after the last burst of
    /// an upload.
    fn finish(&mut self);
}

/// [`DisplayBus`] over a plain `embedded-hal` SPI bus and a data/command pin.
///
/// DC low selects command framing, DC high data framing — the usual
/// four-wire serial discipline. Without a DMA channel to hand,
/// [`DisplayBus::start_pixels`] degrades to a blocking write with an
/// immediately pending completion, so asynchronous uploads still make
/// progress wherever the driver polls for completion.
pub struct SpiDisplayBus<SPI, DC> {
    spi: SPI,
    dc: DC,
    pending: bool,
}

impl<SPI, DC> SpiDisplayBus<SPI, DC>
where
    SPI: SpiBus,
    DC: OutputPin,
{
    pub fn new(spi: SPI, dc: DC) -> Self {
        SpiDisplayBus {
            spi,
            dc,
            pending: false,
        }
    }

    pub fn release(self) -> (SPI, DC) {
        (self.spi, self.dc)
    }
}

/// Errors from the SPI bus or the DC pin.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpiBusError<S, P> {
    Spi(S),
    Pin(P),
}

impl<S: core::fmt::Debug, P: core::fmt::Debug> core::fmt::Display for SpiBusError<S, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SpiBusError::Spi(e) => write!(f, "SPI error: {:?}", e),
            SpiBusError::Pin(e) => write!(f, "DC pin error: {:?}", e),
        }
    }
}

impl<S: core::fmt::Debug, P: core::fmt::Debug> CoreError for SpiBusError<S, P> {}

impl<SPI, DC> DisplayBus for SpiDisplayBus<SPI, DC>
where
    SPI: SpiBus,
    DC: OutputPin,
{
    type Error = SpiBusError<SPI::Error, DC::Error>;

    fn write_command(&mut self, command: u8, args: &[u8]) -> Result<(), Self::Error> {
        trace!("command {} ({} args)", command, args.len());
        self.dc.set_low().map_err(SpiBusError::Pin)?;
        self.spi.write(&[command]).map_err(SpiBusError::Spi)?;
        self.spi.flush().map_err(SpiBusError::Spi)?;
        self.dc.set_high().map_err(SpiBusError::Pin)?;
        if !args.is_empty() {
            self.spi.write(args).map_err(SpiBusError::Spi)?;
            self.spi.flush().map_err(SpiBusError::Spi)?;
        }
        Ok(())
    }

    fn read_command(&mut self, command: u8, out: &mut [u8]) -> Result<(), Self::Error> {
        self.dc.set_low().map_err(SpiBusError::Pin)?;
        self.spi.write(&[command]).map_err(SpiBusError::Spi)?;
        self.spi.flush().map_err(SpiBusError::Spi)?;
        self.dc.set_high().map_err(SpiBusError::Pin)?;
        self.spi.read(out).map_err(SpiBusError::Spi)?;
        Ok(())
    }

    fn write_pixels(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(bytes).map_err(SpiBusError::Spi)
    }

    unsafe fn start_pixels(&mut self, ptr: *const u8, len: usize) {
        // No DMA channel here: transfer inline and leave the completion
        // pending for the next poll.
        let bytes = core::slice::from_raw_parts(ptr, len);
        let _ = self.spi.write(bytes);
        self.pending = true;
    }

    fn dma_busy(&self) -> bool {
        false
    }

    fn poll_completion(&mut self) -> bool {
        core::mem::take(&mut self.pending)
    }

    fn finish(&mut self) {
        let _ = self.spi.flush();
    }
}
