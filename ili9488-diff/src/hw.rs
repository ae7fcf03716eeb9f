use core::error::Error as CoreError;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};

use crate::bus::DisplayBus;

/// A free-running microsecond clock.
///
/// Handles are cloned into the upload pipeline, so implementations should be
/// cheap copies of something global (a cycle counter, a timer register). The
/// count may wrap; all driver arithmetic is wrapping.
pub trait Ticker: Clone {
    fn micros(&self) -> u32;
}

/// A one-shot timer whose expiry raises the same interrupt as the DMA
/// completion, i.e. the embedder routes it into
/// [`crate::UploadCell::on_interrupt`].
pub trait DeadlineTimer {
    /// Arms the timer to fire once, `us` microseconds from now. Re-arming
    /// replaces any armed deadline.
    fn arm_us(&mut self, us: u32);

    fn cancel(&mut self);

    /// Returns true once per expired deadline whose interrupt has not been
    /// serviced. Lets barriers make progress when the interrupt is not
    /// wired (and is how host tests pump the pipeline).
    fn poll_expired(&mut self) -> bool;
}

/// Provides access to the hardware needed to drive the display.
///
/// This bundles the associated types so the driver carries a single type
/// parameter, the same shape HAL-agnostic display drivers usually take. On
/// construction the driver splits the bundle: the bus, deadline timer and a
/// ticker clone move into the `static` [`crate::UploadCell`] where the
/// upload interrupt can reach them; reset pin and delay stay caller-side.
///
/// ```
/// use core::convert::Infallible;
///
/// use embedded_hal::delay::DelayNs;
/// use embedded_hal::digital::{ErrorType, OutputPin};
/// use embedded_hal::spi::SpiBus;
/// use ili9488_diff::bus::{SpiBusError, SpiDisplayBus};
/// use ili9488_diff::{DeadlineTimer, DisplayHw, HwParts, Ticker};
/// use thiserror::Error as ThisError;
///
/// /// An error type that can absorb the driver, bus and pin errors.
/// #[derive(Debug, ThisError)]
/// enum Error {
///     #[error("driver error: {0}")]
///     Driver(#[from] ili9488_diff::Error),
///     #[error("bus error: {0}")]
///     Bus(#[from] SpiBusError<Infallible, Infallible>),
/// }
///
/// impl From<Infallible> for Error {
///     fn from(_: Infallible) -> Self {
///         // GPIO errors are infallible, i.e. they can't occur, so this should be unreachable.
///         unreachable!()
///     }
/// }
///
/// #[derive(Clone)]
/// struct CycleTicker;
/// impl Ticker for CycleTicker {
///     fn micros(&self) -> u32 {
///         0 // read a cycle counter here
///     }
/// }
///
/// struct NoTimer;
/// impl DeadlineTimer for NoTimer {
///     fn arm_us(&mut self, _us: u32) {}
///     fn cancel(&mut self) {}
///     fn poll_expired(&mut self) -> bool {
///         true // without a hardware timer, deadlines expire when polled
///     }
/// }
///
/// struct BusyDelay;
/// impl DelayNs for BusyDelay {
///     fn delay_ns(&mut self, _ns: u32) {}
/// }
///
/// struct NoPin;
/// impl ErrorType for NoPin {
///     type Error = Infallible;
/// }
/// impl OutputPin for NoPin {
///     fn set_low(&mut self) -> Result<(), Infallible> {
///         Ok(())
///     }
///     fn set_high(&mut self) -> Result<(), Infallible> {
///         Ok(())
///     }
/// }
///
/// struct MyHw<SPI> {
///     spi: SPI,
///     dc: NoPin,
///     reset: NoPin,
/// }
///
/// impl<SPI> DisplayHw for MyHw<SPI>
/// where
///     SPI: SpiBus + embedded_hal::spi::ErrorType<Error = Infallible> + Send + 'static,
/// {
///     type Bus = SpiDisplayBus<SPI, NoPin>;
///     type Reset = NoPin;
///     type Delay = BusyDelay;
///     type Ticker = CycleTicker;
///     type Timer = NoTimer;
///     type Error = Error;
///
///     fn split(self) -> HwParts<Self> {
///         HwParts {
///             bus: SpiDisplayBus::new(self.spi, self.dc),
///             reset: self.reset,
///             delay: BusyDelay,
///             ticker: CycleTicker,
///             timer: NoTimer,
///         }
///     }
/// }
/// ```
pub trait DisplayHw {
    type Bus: DisplayBus + Send;
    type Reset: OutputPin;
    type Delay: DelayNs;
    type Ticker: Ticker + Send;
    type Timer: DeadlineTimer + Send;
    type Error: CoreError
        + From<crate::Error>
        + From<<Self::Bus as DisplayBus>::Error>
        + From<<Self::Reset as PinErrorType>::Error>;

    /// Destructures the bundle into its parts.
    fn split(self) -> HwParts<Self>;
}

/// The destructured hardware bundle.
pub struct HwParts<HW: DisplayHw + ?Sized> {
    pub bus: HW::Bus,
    pub reset: HW::Reset,
    pub delay: HW::Delay,
    pub ticker: HW::Ticker,
    pub timer: HW::Timer,
}
