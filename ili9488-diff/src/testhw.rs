//! Mock hardware for host tests: a panel RAM model behind the bus trait, a
//! fake microsecond clock, and a deadline timer that warps the clock forward
//! when polled. Everything hangs off one shared state so tests can inspect
//! what the panel received.

use std::boxed::Box;
use std::sync::{Arc, Mutex};
use std::vec;
use std::vec::Vec;

use thiserror::Error as ThisError;

use crate::bus::DisplayBus;
use crate::hw::{DeadlineTimer, DisplayHw, HwParts, Ticker};
use crate::ili9488::{Command, Ili9488};
use crate::pipeline::UploadCell;
use crate::rotation::{Rotation, ScanOrder};
use crate::{PANEL_HEIGHT, PANEL_PIXELS, PANEL_WIDTH, SCAN_LINES};

pub(crate) struct TestState {
    pub now_us: u32,
    /// Refresh period the mock panel's timing generator runs at.
    pub period_us: u32,
    /// Clock cost of a register read; makes polling loops advance.
    pub read_cost_us: u32,
    pub command_cost_us: u32,
    /// Serial cost per transmitted pixel, so the beam really moves while
    /// pixels go out and a beam/writer race shows up in the margin stats.
    pub pixel_cost_ns: u32,

    pub panel: Vec<u16>,
    window: (u16, u16, u16, u16), // sc, ec, sp, ep
    col: u16,
    page: u16,

    pub commands: Vec<(u8, Vec<u8>)>,
    pub pixels_written: u64,
    pub finished_uploads: u32,

    pub power_mode: u8,
    pub self_diag: u8,

    dma_pending: bool,
    timer_deadline: Option<u32>,
}

impl TestState {
    fn scanline(&self) -> u16 {
        ((self.now_us % self.period_us) as u64 * SCAN_LINES as u64 / self.period_us as u64) as u16
    }

    fn feed_command(&mut self, command: u8, args: &[u8]) {
        self.commands.push((command, args.to_vec()));
        if command == Command::ColumnAddressSet as u8 {
            self.window.0 = u16::from_be_bytes([args[0], args[1]]);
            self.window.1 = u16::from_be_bytes([args[2], args[3]]);
        } else if command == Command::PageAddressSet as u8 {
            self.window.2 = u16::from_be_bytes([args[0], args[1]]);
            self.window.3 = u16::from_be_bytes([args[2], args[3]]);
        } else if command == Command::MemoryWrite as u8 {
            self.col = self.window.0;
            self.page = self.window.2;
        }
    }

    fn feed_pixels(&mut self, bytes: &[u8]) {
        assert_eq!(
            bytes.len() % 3,
            0,
            "pixel payloads must be whole 24-bit frames"
        );
        let pixels = (bytes.len() / 3) as u64;
        self.now_us += (pixels * self.pixel_cost_ns as u64 / 1000) as u32;
        for px in bytes.chunks_exact(3) {
            // The panel latches the upper six bits of each byte in 18-bit
            // mode; fold back to RGB565 for inspection.
            let r5 = (px[0] >> 3) as u16;
            let g6 = (px[1] >> 2) as u16;
            let b5 = (px[2] >> 3) as u16;
            let word = (r5 << 11) | (g6 << 5) | b5;
            let idx = self.page as usize * PANEL_WIDTH as usize + self.col as usize;
            self.panel[idx] = word;
            self.pixels_written += 1;
            if self.col == self.window.1 {
                self.col = self.window.0;
                self.page = if self.page == self.window.3 {
                    self.window.2
                } else {
                    self.page + 1
                };
            } else {
                self.col += 1;
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct TestShared(Arc<Mutex<TestState>>);

impl TestShared {
    pub(crate) fn new() -> Self {
        TestShared(Arc::new(Mutex::new(TestState {
            now_us: 0,
            period_us: 16_000,
            read_cost_us: 5,
            command_cost_us: 1,
            pixel_cost_ns: 100,
            panel: vec![0u16; PANEL_PIXELS],
            window: (0, PANEL_WIDTH - 1, 0, PANEL_HEIGHT - 1),
            col: 0,
            page: 0,
            commands: Vec::new(),
            pixels_written: 0,
            finished_uploads: 0,
            power_mode: 0x9C,
            self_diag: 0xC0,
            dma_pending: false,
            timer_deadline: None,
        })))
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, TestState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn panel_pixel(&self, x: u16, y: u16) -> u16 {
        self.lock().panel[y as usize * PANEL_WIDTH as usize + x as usize]
    }

    pub(crate) fn pixels_written(&self) -> u64 {
        self.lock().pixels_written
    }

    pub(crate) fn finished_uploads(&self) -> u32 {
        self.lock().finished_uploads
    }

    /// Moves the fake clock so the beam sits at `line`.
    pub(crate) fn put_beam_at(&self, line: u16) {
        let mut s = self.lock();
        let period = s.period_us;
        let in_frame = s.now_us % period;
        let target = line as u64 * period as u64 / SCAN_LINES as u64;
        s.now_us = s.now_us - in_frame + period + target as u32;
    }

    /// Asserts the panel equals `fb` viewed through `rotation`.
    pub(crate) fn assert_panel_matches(&self, fb: &[u16], rotation: Rotation) {
        let s = self.lock();
        let order = ScanOrder::new(rotation);
        for py in 0..PANEL_HEIGHT {
            for px in 0..PANEL_WIDTH {
                assert_eq!(
                    s.panel[py as usize * PANEL_WIDTH as usize + px as usize],
                    fb[order.index(px, py)],
                    "panel mismatch at ({}, {})",
                    px,
                    py
                );
            }
        }
    }
}

#[derive(Debug, ThisError)]
pub(crate) enum MockError {
    #[error("driver: {0}")]
    Driver(#[from] crate::Error),
    #[error("bus")]
    Bus(#[from] MockBusError),
    #[error("pin")]
    Pin(#[from] core::convert::Infallible),
}

#[derive(Debug, ThisError)]
#[error("mock bus error")]
pub(crate) struct MockBusError;

pub(crate) struct MockBus(TestShared);

impl DisplayBus for MockBus {
    type Error = MockBusError;

    fn write_command(&mut self, command: u8, args: &[u8]) -> Result<(), Self::Error> {
        let mut s = self.0.lock();
        s.now_us += s.command_cost_us;
        s.feed_command(command, args);
        Ok(())
    }

    fn read_command(&mut self, command: u8, out: &mut [u8]) -> Result<(), Self::Error> {
        let mut s = self.0.lock();
        s.now_us += s.read_cost_us;
        s.commands.push((command, Vec::new()));
        if command == Command::ReadScanline as u8 {
            let line = s.scanline().to_be_bytes();
            out.copy_from_slice(&line[..out.len()]);
        } else if command == Command::ReadPowerMode as u8 {
            out[0] = s.power_mode;
        } else if command == Command::ReadSelfDiag as u8 {
            out[0] = s.self_diag;
        } else {
            out.fill(0);
        }
        Ok(())
    }

    fn write_pixels(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.0.lock().feed_pixels(bytes);
        Ok(())
    }

    unsafe fn start_pixels(&mut self, ptr: *const u8, len: usize) {
        let bytes = core::slice::from_raw_parts(ptr, len);
        let mut s = self.0.lock();
        s.feed_pixels(bytes);
        s.dma_pending = true;
    }

    fn dma_busy(&self) -> bool {
        false
    }

    fn poll_completion(&mut self) -> bool {
        core::mem::take(&mut self.0.lock().dma_pending)
    }

    fn finish(&mut self) {
        self.0.lock().finished_uploads += 1;
    }
}

#[derive(Clone)]
pub(crate) struct MockTicker(TestShared);

impl Ticker for MockTicker {
    fn micros(&self) -> u32 {
        self.0.lock().now_us
    }
}

pub(crate) struct MockTimer(TestShared);

impl DeadlineTimer for MockTimer {
    fn arm_us(&mut self, us: u32) {
        let mut s = self.0.lock();
        let deadline = s.now_us.wrapping_add(us);
        s.timer_deadline = Some(deadline);
    }

    fn cancel(&mut self) {
        self.0.lock().timer_deadline = None;
    }

    fn poll_expired(&mut self) -> bool {
        let mut s = self.0.lock();
        match s.timer_deadline.take() {
            Some(deadline) => {
                // Warp the clock to the deadline so waits terminate.
                if deadline > s.now_us {
                    s.now_us = deadline;
                }
                true
            }
            None => false,
        }
    }
}

pub(crate) struct MockDelay(TestShared);

impl embedded_hal::delay::DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.lock().now_us += ns.div_ceil(1000);
    }
}

pub(crate) struct MockPin;

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub(crate) struct MockHw(pub(crate) TestShared);

impl DisplayHw for MockHw {
    type Bus = MockBus;
    type Reset = MockPin;
    type Delay = MockDelay;
    type Ticker = MockTicker;
    type Timer = MockTimer;
    type Error = MockError;

    fn split(self) -> HwParts<Self> {
        HwParts {
            bus: MockBus(self.0.clone()),
            reset: MockPin,
            delay: MockDelay(self.0.clone()),
            ticker: MockTicker(self.0.clone()),
            timer: MockTimer(self.0),
        }
    }
}

/// A fresh driver over mock hardware, not yet brought up.
pub(crate) fn new_driver_unstarted() -> (
    Ili9488<MockHw>,
    &'static UploadCell<MockHw>,
    TestShared,
) {
    let shared = TestShared::new();
    let cell: &'static UploadCell<MockHw> = Box::leak(Box::new(UploadCell::new()));
    let driver = Ili9488::new(cell, MockHw(shared.clone()));
    (driver, cell, shared)
}

/// A fresh driver over mock hardware, already brought up.
pub(crate) fn new_driver() -> (
    Ili9488<MockHw>,
    &'static UploadCell<MockHw>,
    TestShared,
) {
    let (mut driver, cell, shared) = new_driver_unstarted();
    driver.begin().expect("mock bring-up succeeds");
    (driver, cell, shared)
}

/// Leaks a zeroed `'static` pixel buffer, the shape embedders hand to
/// [`Ili9488::bind_framebuffers`].
pub(crate) fn leak_fb() -> &'static mut [u16] {
    Vec::leak(vec![0u16; PANEL_PIXELS])
}

pub(crate) fn leak_diff_storage(len: usize) -> &'static mut [u8] {
    Vec::leak(vec![0u8; len])
}
