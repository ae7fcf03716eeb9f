//! The ILI9488 driver: bring-up, configuration and the buffering policy
//! that decides which buffers feed each upload.

use bitflags::bitflags;
use embedded_graphics::primitives::Rectangle;
use heapless::Vec;

use crate::bus::DisplayBus;
use crate::diff::{DiffBuf, DiffOp};
use crate::hw::{DisplayHw, Ticker};
use crate::log::{debug, trace, warn_log};
use crate::pipeline::{
    allowed_row_for, caset_args, emit_run_window, expand_chunk, note_margin_sample, DiffPtr,
    FbPtr, LaunchCmd, Parts, UploadCell, MIN_WAIT_US, STAGE_PIXELS,
};
use crate::rotation::{copy_rect, rotation_box, Rotation, ScanCursor};
use crate::scanline::{line_of_row, mode_for_refresh_rate, period_for_mode, REFRESH_MODES};
use crate::{Error, PANEL_HEIGHT, PANEL_PIXELS, PANEL_WIDTH, SCAN_LINES};

pub use crate::pipeline::UploadStats;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

/// Low-level commands for the ILI9488. Most operations go through the driver
/// methods; [`Ili9488::send`] is available for low-level control or
/// experimentation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop = 0x00,
    /// Software reset; parameters return to defaults.
    SoftReset = 0x01,
    /// Reads the 32-bit display status word.
    ReadDisplayStatus = 0x09,
    /// Reads the display power mode byte, see [`PowerMode`].
    ReadPowerMode = 0x0A,
    /// Reads the self-diagnostic byte, see [`SelfDiag`].
    ReadSelfDiag = 0x0F,
    /// Enters sleep; wake with [`Command::SleepOut`] plus a settle delay.
    SleepIn = 0x10,
    SleepOut = 0x11,
    NormalModeOn = 0x13,
    InvertOff = 0x20,
    InvertOn = 0x21,
    DisplayOff = 0x28,
    DisplayOn = 0x29,
    /// Sets the column window: two big-endian 16-bit values, start and end.
    ColumnAddressSet = 0x2A,
    /// Sets the page window: two big-endian 16-bit values, start and end.
    PageAddressSet = 0x2B,
    /// Starts a pixel stream into the current window; resets the write
    /// pointer to the window origin.
    MemoryWrite = 0x2C,
    /// Reads the current timing-generator scanline (two bytes).
    ReadScanline = 0x45,
    /// Tearing-effect line on (mode byte: 0 = vblank only).
    TearingEffectOn = 0x35,
    /// Memory access control, see [`MemoryAccessCtl`].
    MemoryAccessControl = 0x36,
    /// Interface pixel format; 0x66 selects 18-bit colour.
    PixelFormat = 0x3A,
    /// Interface mode control.
    InterfaceMode = 0xB0,
    /// Frame rate control (normal mode): division ratio and line period.
    FrameRateControl = 0xB1,
    DisplayInversionControl = 0xB4,
    DisplayFunctionControl = 0xB6,
    PowerControl1 = 0xC0,
    PowerControl2 = 0xC1,
    VcomControl = 0xC5,
    PositiveGamma = 0xE0,
    NegativeGamma = 0xE1,
    SetImageFunction = 0xE9,
    AdjustControl3 = 0xF7,
}

impl Command {
    /// Returns the register address for this command.
    fn register(&self) -> u8 {
        *self as u8
    }
}

bitflags! {
    /// MADCTL bits. The driver keeps the panel in native addressing and
    /// rotates at read time, so only the colour order is ever configured.
    pub struct MemoryAccessCtl: u8 {
        const ROW_ORDER       = 0b1000_0000;
        const COL_ORDER       = 0b0100_0000;
        const ROW_COL_SWAP    = 0b0010_0000;
        const VERTICAL_ORDER  = 0b0001_0000;
        const BGR             = 0b0000_1000;
        const HORIZONTAL_ORDER = 0b0000_0100;
    }
}

bitflags! {
    /// Display power mode byte ([`Command::ReadPowerMode`]).
    pub struct PowerMode: u8 {
        const BOOSTER_ON  = 0b1000_0000;
        const IDLE_OFF    = 0b0100_0000;
        const PARTIAL_OFF = 0b0010_0000;
        const SLEEP_OUT   = 0b0001_0000;
        const NORMAL_ON   = 0b0000_1000;
        const DISPLAY_ON  = 0b0000_0100;
    }
}

bitflags! {
    /// Self-diagnostic byte ([`Command::ReadSelfDiag`]).
    pub struct SelfDiag: u8 {
        const REGISTER_LOADED = 0b1000_0000;
        const FUNCTIONAL      = 0b0100_0000;
    }
}

/// The panel stays in native portrait addressing; rotation is applied at
/// framebuffer read time, never through MADCTL.
const MADCTL_INIT: u8 = MemoryAccessCtl::COL_ORDER.bits() | MemoryAccessCtl::BGR.bits();

/// Bring-up command table, executed once before the status check.
const INIT_SEQUENCE: &[(Command, &[u8])] = &[
    (
        Command::PositiveGamma,
        &[
            0x00, 0x03, 0x09, 0x08, 0x16, 0x0A, 0x3F, 0x78, 0x4C, 0x09, 0x0A, 0x08, 0x16, 0x1A,
            0x0F,
        ],
    ),
    (
        Command::NegativeGamma,
        &[
            0x00, 0x16, 0x19, 0x03, 0x0F, 0x05, 0x32, 0x45, 0x46, 0x04, 0x0E, 0x0D, 0x35, 0x37,
            0x0F,
        ],
    ),
    (Command::PowerControl1, &[0x17, 0x15]),
    (Command::PowerControl2, &[0x41]),
    (Command::VcomControl, &[0x00, 0x12, 0x80]),
    (Command::MemoryAccessControl, &[MADCTL_INIT]),
    // 18-bit pixels; the serial link still runs 24-bit frames and the panel
    // latches the upper six bits of each byte.
    (Command::PixelFormat, &[0x66]),
    (Command::InterfaceMode, &[0x00]),
    (Command::FrameRateControl, &[0x00, 0x10]),
    (Command::DisplayInversionControl, &[0x02]),
    (Command::DisplayFunctionControl, &[0x02, 0x02]),
    (Command::SetImageFunction, &[0x00]),
    (Command::AdjustControl3, &[0xA9, 0x51, 0x2C, 0x82]),
    (Command::TearingEffectOn, &[0x00]),
];

const BRINGUP_RETRIES: u8 = 3;

/// Upper bound accepted by [`Ili9488::set_vsync_spacing`].
pub const MAX_VSYNC_SPACING: i8 = 10;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferingMode {
    /// No internal framebuffer: every update is a blocking full upload.
    None,
    /// One internal framebuffer: diffed asynchronous updates.
    Double,
    /// Two internal framebuffers: a replacement frame can be staged while an
    /// upload is in flight.
    Triple,
}

#[derive(PartialEq)]
enum State {
    Uninitialized,
    Awake,
    Asleep,
}

/// Which internal buffer currently matches the panel byte-for-byte.
/// `None` forces the next update to be a full redraw.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mirror {
    None,
    Fb1,
}

/// Differential, vsync-synchronised ILI9488 driver.
///
/// `cell` is the interrupt-reachable half; the embedder keeps it in a
/// `static` and routes the upload interrupts into
/// [`UploadCell::on_interrupt`]. Framebuffers and diff buffers are bound
/// after construction with [`Ili9488::bind_framebuffers`] and
/// [`Ili9488::bind_diff_buffers`]; without them every update degrades to a
/// blocking full redraw.
pub struct Ili9488<HW: DisplayHw + 'static> {
    cell: &'static UploadCell<HW>,
    reset: HW::Reset,
    delay: HW::Delay,
    ticker: HW::Ticker,

    state: State,
    rotation: Rotation,
    refresh_mode: u8,
    period_mode0_us: u32,

    vsync_spacing: i8,
    diff_gap: u16,
    compare_mask: u16,
    late_start_ratio: f32,
    strict_start_once: bool,

    fb1: Option<&'static mut [u16]>,
    fb2: Option<&'static mut [u16]>,
    diff1: Option<DiffBuf<'static>>,
    diff2: Option<DiffBuf<'static>>,
    mirror: Mirror,
    ongoing_diff: bool,
}

impl<HW: DisplayHw + 'static> Ili9488<HW> {
    /// Builds the driver around its interrupt cell and hardware bundle.
    /// Call [`Ili9488::begin`] before anything else.
    pub fn new(cell: &'static UploadCell<HW>, hw: HW) -> Self {
        let parts = hw.split();
        let ticker = parts.ticker.clone();
        let (reset, delay) = (parts.reset, parts.delay);
        cell.with(|p| {
            p.install(Parts {
                bus: parts.bus,
                timer: parts.timer,
                ticker: parts.ticker,
            })
        });
        Ili9488 {
            cell,
            reset,
            delay,
            ticker,
            state: State::Uninitialized,
            rotation: Rotation::Deg0,
            refresh_mode: 0,
            period_mode0_us: 16_600,
            vsync_spacing: 1,
            diff_gap: 10,
            compare_mask: 0,
            late_start_ratio: 0.3,
            strict_start_once: true,
            fb1: None,
            fb2: None,
            diff1: None,
            diff2: None,
            mirror: Mirror::None,
            ongoing_diff: false,
        }
    }

    /// Hardware reset, init table, status check and refresh-period
    /// measurement. Fails with [`Error::BringUp`] when the panel's status
    /// registers never match; the driver then refuses updates.
    pub fn begin(&mut self) -> Result<(), HW::Error> {
        debug!("ILI9488 bring-up");
        self.reset.set_high()?;
        self.delay.delay_ms(5);
        self.reset.set_low()?;
        self.delay.delay_ms(20);
        self.reset.set_high()?;
        self.delay.delay_ms(150);

        for (command, args) in INIT_SEQUENCE {
            self.send(*command, args)?;
        }
        self.send(Command::SleepOut, &[])?;
        self.delay.delay_ms(120);
        self.send(Command::DisplayOn, &[])?;
        self.delay.delay_ms(20);

        let mut healthy = false;
        for _attempt in 0..BRINGUP_RETRIES {
            let power = PowerMode::from_bits_truncate(self.read_byte(Command::ReadPowerMode)?);
            let diag = SelfDiag::from_bits_truncate(self.read_byte(Command::ReadSelfDiag)?);
            if power.contains(PowerMode::SLEEP_OUT | PowerMode::DISPLAY_ON)
                && diag.contains(SelfDiag::REGISTER_LOADED | SelfDiag::FUNCTIONAL)
            {
                healthy = true;
                break;
            }
            warn_log!("bring-up status check failed (attempt {})", _attempt);
            self.delay.delay_ms(10);
        }
        if !healthy {
            return Err(Error::BringUp.into());
        }

        self.state = State::Awake;
        self.refresh_mode = 0;
        self.resync()?;
        let period = self.sample_refresh_period()?;
        self.period_mode0_us = period;
        self.cell.with(|p| p.clock.set_period(period));
        self.mirror = Mirror::None;
        self.ongoing_diff = false;
        self.strict_start_once = true;
        debug!("panel up, refresh period {} us", period);
        Ok(())
    }

    /// Send a raw command and parameters to the display. Waits for any
    /// in-flight upload first.
    pub fn send(&mut self, command: Command, args: &[u8]) -> Result<(), HW::Error> {
        self.wait_update_complete();
        self.cell
            .with(|p| p.parts_mut().bus.write_command(command.register(), args))?;
        Ok(())
    }

    fn read_byte(&mut self, command: Command) -> Result<u8, HW::Error> {
        let mut out = [0u8; 1];
        self.cell
            .with(|p| p.parts_mut().bus.read_command(command.register(), &mut out))?;
        Ok(out[0])
    }

    /// Reads the panel's self-diagnostic register and decodes it.
    pub fn self_diag_ok(&mut self) -> Result<bool, HW::Error> {
        let diag = SelfDiag::from_bits_truncate(self.read_byte(Command::ReadSelfDiag)?);
        Ok(diag.contains(SelfDiag::REGISTER_LOADED | SelfDiag::FUNCTIONAL))
    }

    /// Reads the hardware scanline and re-anchors the beam estimate.
    /// An out-of-range reading keeps the previous anchor.
    pub fn resync(&mut self) -> Result<(), HW::Error> {
        let line = self.read_scanline_raw()?;
        if line < SCAN_LINES {
            let now = self.ticker.micros();
            self.cell.with(|p| p.clock.resync(line, now));
            self.strict_start_once = true;
        } else {
            warn_log!("scanline read out of range: {}", line);
        }
        Ok(())
    }

    fn read_scanline_raw(&mut self) -> Result<u16, HW::Error> {
        let mut out = [0u8; 2];
        self.cell.with(|p| {
            p.parts_mut()
                .bus
                .read_command(Command::ReadScanline.register(), &mut out)
        })?;
        Ok(u16::from_be_bytes(out) & 0x3FF)
    }

    /// Estimated current timing line, without bus traffic.
    pub fn scanline_now(&self) -> u16 {
        let now = self.ticker.micros();
        self.cell.with(|p| p.clock.line_now(now))
    }

    /// Measures the refresh period: ten averaged line-0 crossings.
    /// Called after every refresh-rate change.
    pub fn sample_refresh_period(&mut self) -> Result<u32, HW::Error> {
        let mut samples: Vec<u32, 10> = Vec::new();
        let mut prev = self.read_scanline_raw()?;
        let mut last_cross = None;
        // Bounded so a wedged panel cannot hang the caller.
        for _ in 0..2_000_000u32 {
            if samples.len() == samples.capacity() {
                break;
            }
            let line = self.read_scanline_raw()?;
            if line < prev && line < SCAN_LINES {
                let now = self.ticker.micros();
                if let Some(t) = last_cross {
                    let _ = samples.push(now.wrapping_sub(t));
                }
                last_cross = Some(now);
            }
            if line < SCAN_LINES {
                prev = line;
            }
        }
        if samples.is_empty() {
            return Ok(self.cell.with(|p| p.clock.period_us()));
        }
        let sum: u64 = samples.iter().map(|&s| s as u64).sum();
        Ok((sum / samples.len() as u64) as u32)
    }

    /// Selects one of the 32 panel frame rates and remeasures the period.
    pub fn set_refresh_mode(&mut self, mode: u8) -> Result<(), HW::Error> {
        if mode >= REFRESH_MODES {
            return Err(Error::InvalidArgument.into());
        }
        self.verify_awake()?;
        self.wait_update_complete();
        // Division ratio in the high parameter, stretched line period in the
        // low one, per the panel's frame-rate table.
        let args = [mode / 16, 0x10 + (mode % 16)];
        self.send(Command::FrameRateControl, &args)?;
        self.refresh_mode = mode;
        self.resync()?;
        let period = self.sample_refresh_period()?;
        self.cell.with(|p| p.clock.set_period(period));
        if mode == 0 {
            self.period_mode0_us = period;
        }
        self.strict_start_once = true;
        Ok(())
    }

    pub fn refresh_mode(&self) -> u8 {
        self.refresh_mode
    }

    /// Expected refresh period for `mode`, derived from the measured mode-0
    /// period.
    pub fn period_for_mode(&self, mode: u8) -> u32 {
        period_for_mode(self.period_mode0_us, mode % REFRESH_MODES)
    }

    /// The refresh mode closest to the requested rate (millihertz).
    pub fn mode_for_refresh_rate(&self, millihz: u32) -> u8 {
        mode_for_refresh_rate(self.period_mode0_us, millihz)
    }

    /// Sets the orientation. Resets the mirror: the next update is a full
    /// redraw.
    pub fn set_rotation(&mut self, rotation: u8) -> Result<(), HW::Error> {
        let rotation = Rotation::from_index(rotation).ok_or(Error::InvalidArgument)?;
        self.wait_update_complete();
        self.rotation = rotation;
        self.mirror = Mirror::None;
        self.ongoing_diff = false;
        self.strict_start_once = true;
        Ok(())
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Puts the panel to sleep or wakes it. All update state resets.
    pub fn sleep(&mut self, enable: bool) -> Result<(), HW::Error> {
        if self.state == State::Uninitialized {
            return Err(Error::Uninitialized.into());
        }
        self.wait_update_complete();
        if enable && self.state == State::Awake {
            self.send(Command::DisplayOff, &[])?;
            self.send(Command::SleepIn, &[])?;
            self.delay.delay_ms(5);
            self.state = State::Asleep;
        } else if !enable && self.state == State::Asleep {
            self.send(Command::SleepOut, &[])?;
            self.delay.delay_ms(120);
            self.send(Command::DisplayOn, &[])?;
            self.state = State::Awake;
            self.resync()?;
        }
        self.mirror = Mirror::None;
        self.ongoing_diff = false;
        self.strict_start_once = true;
        Ok(())
    }

    pub fn invert_display(&mut self, on: bool) -> Result<(), HW::Error> {
        self.verify_awake()?;
        let command = if on {
            Command::InvertOn
        } else {
            Command::InvertOff
        };
        self.send(command, &[])
    }

    /// Rebinds the internal framebuffers. Provided buffers are zeroed and
    /// the mirror is invalidated.
    pub fn bind_framebuffers(
        &mut self,
        fb1: Option<&'static mut [u16]>,
        fb2: Option<&'static mut [u16]>,
    ) {
        self.wait_update_complete();
        for fb in [&fb1, &fb2].into_iter().flatten() {
            debug_assert_eq!(fb.len(), PANEL_PIXELS);
        }
        self.fb1 = fb1;
        self.fb2 = fb2;
        if let Some(fb) = self.fb1.as_deref_mut() {
            fb.fill(0);
        }
        if let Some(fb) = self.fb2.as_deref_mut() {
            fb.fill(0);
        }
        self.mirror = Mirror::None;
        self.ongoing_diff = false;
    }

    /// Rebinds the diff buffers; takes effect on the next update.
    pub fn bind_diff_buffers(
        &mut self,
        diff1: Option<DiffBuf<'static>>,
        diff2: Option<DiffBuf<'static>>,
    ) {
        self.wait_update_complete();
        self.diff1 = diff1;
        self.diff2 = diff2;
        self.ongoing_diff = false;
    }

    /// Target number of panel refreshes per uploaded frame. `-1` drops
    /// frames when an upload is already in flight, `0` runs unsynchronised.
    pub fn set_vsync_spacing(&mut self, spacing: i8) {
        let spacing = spacing.clamp(-1, MAX_VSYNC_SPACING);
        self.vsync_spacing = spacing;
        self.cell.with(|p| p.vsync_spacing = spacing);
    }

    pub fn vsync_spacing(&self) -> i8 {
        self.vsync_spacing
    }

    /// Maximum run of unchanged pixels absorbed into an adjacent write.
    /// Zero merges nothing.
    pub fn set_diff_gap(&mut self, gap: u16) {
        self.diff_gap = gap;
    }

    /// Bits ignored when comparing pixels; `0` compares strictly.
    pub fn set_compare_mask(&mut self, mask: u16) {
        self.compare_mask = mask;
    }

    /// How late, as a fraction of the remaining sweep, an upload may still
    /// start past its target scanline before waiting a whole refresh.
    pub fn set_late_start_ratio(&mut self, ratio: f32) {
        let ratio = ratio.clamp(0.0, 1.0);
        self.late_start_ratio = ratio;
        self.cell.with(|p| p.late_start_ratio = ratio);
    }

    /// One-shot: the next upload waits strictly for line 0. Set internally
    /// after bring-up, resync, rotation and sleep changes.
    pub fn set_late_start_ratio_override(&mut self) {
        self.strict_start_once = true;
    }

    pub fn buffering_mode(&self) -> BufferingMode {
        match (&self.fb1, &self.fb2) {
            (None, _) => BufferingMode::None,
            (Some(_), None) => BufferingMode::Double,
            (Some(_), Some(_)) => BufferingMode::Triple,
        }
    }

    /// True while an asynchronous upload is in flight.
    pub fn async_update_active(&self) -> bool {
        self.cell.active()
    }

    /// True while a deferred region diff is pending integration.
    pub fn diff_update_active(&self) -> bool {
        self.ongoing_diff
    }

    /// Timing of the last completed upload.
    pub fn last_stats(&self) -> UploadStats {
        self.cell.with(|p| p.last_stats())
    }

    /// Number of uploads during which the beam overtook the write cursor.
    pub fn teared_count(&self) -> u32 {
        self.cell.with(|p| p.teared_count())
    }

    /// Blocks until no upload is in flight. Also services completions on
    /// hardware whose interrupts are polled rather than wired.
    pub fn wait_update_complete(&mut self) {
        loop {
            if !self.cell.active() {
                break;
            }
            self.cell.service();
            core::hint::spin_loop();
        }
        self.reconcile();
    }

    /// Folds a completed staged relaunch back into the caller's view: the
    /// staged buffers became the committed ones.
    fn reconcile(&mut self) {
        if self.cell.with(|p| p.take_swapped()) {
            core::mem::swap(&mut self.fb1, &mut self.fb2);
            core::mem::swap(&mut self.diff1, &mut self.diff2);
            self.mirror = Mirror::Fb1;
        }
    }

    fn verify_awake(&self) -> Result<(), Error> {
        match self.state {
            State::Awake => Ok(()),
            State::Uninitialized => Err(Error::Uninitialized),
            State::Asleep => Err(Error::Sleeping),
        }
    }

    /// Uploads `fb`. Best-effort: once the panel is up this never fails —
    /// depending on the buffering mode and vsync settings it may block,
    /// return while the upload continues from interrupts, coalesce with a
    /// staged frame, or drop the frame entirely.
    pub fn update(&mut self, fb: &[u16], force_full: bool) {
        if self.verify_awake().is_err() {
            warn_log!("update ignored: display not ready");
            return;
        }
        debug_assert_eq!(fb.len(), PANEL_PIXELS);
        self.reconcile();

        if self.fb1.is_none() || self.diff1.is_none() {
            // No buffering: blocking full redraw through a dummy diff.
            self.wait_update_complete();
            let mut scratch = [0u8; 32];
            let mut dummy = DiffBuf::new(&mut scratch);
            dummy.make_dummy();
            if let Some(fb1) = self.fb1.as_deref_mut() {
                fb1.copy_from_slice(fb);
            }
            let strict = core::mem::take(&mut self.strict_start_once);
            self.run_sync_upload(fb, &dummy, strict);
            self.mirror = if self.fb1.is_some() {
                Mirror::Fb1
            } else {
                Mirror::None
            };
            self.ongoing_diff = false;
            return;
        }

        if self.cell.active() {
            if self.vsync_spacing == -1 {
                trace!("update dropped: upload in flight");
                return;
            }
            if self.fb2.is_some() && self.diff2.is_some() {
                self.update_staged(fb, force_full);
                return;
            }
            if self.diff2.is_some() && self.mirror == Mirror::Fb1 && !force_full {
                // Overlap the diff computation with the in-flight upload,
                // then commit once it drains.
                let diff2 = self.diff2.as_mut().unwrap();
                let fb1 = self.fb1.as_deref().unwrap();
                diff2.compute(fb1, fb, self.rotation, self.diff_gap, self.compare_mask);
                self.wait_update_complete();
                self.fb1.as_deref_mut().unwrap().copy_from_slice(fb);
                core::mem::swap(&mut self.diff1, &mut self.diff2);
                self.launch_current();
                return;
            }
            self.wait_update_complete();
        }

        self.update_idle(fb, force_full);
    }

    /// Idle-path update: compute into `diff1`, mirror `fb1`, launch.
    fn update_idle(&mut self, fb: &[u16], force_full: bool) {
        let full = force_full || self.mirror != Mirror::Fb1 || self.ongoing_diff;
        self.ongoing_diff = false;
        {
            let diff1 = self.diff1.as_mut().unwrap();
            let fb1 = self.fb1.as_deref_mut().unwrap();
            if full {
                fb1.copy_from_slice(fb);
                diff1.make_dummy();
            } else {
                diff1.compute_copy(fb1, fb, self.rotation, self.diff_gap, self.compare_mask);
            }
        }
        if self.diff1.as_ref().unwrap().is_empty() {
            // Nothing changed; the mirror already matches.
            self.mirror = Mirror::Fb1;
            return;
        }
        self.launch_current();
    }

    /// Triple-buffer path: stage the frame in `fb2`/`diff2`; the completion
    /// interrupt swaps and relaunches.
    fn update_staged(&mut self, fb: &[u16], force_full: bool) {
        if self.cell.with(|p| p.fb2_full) {
            if self.vsync_spacing >= 1 {
                // A frame is already staged: block until it launches.
                loop {
                    if !self.cell.with(|p| p.fb2_full) {
                        break;
                    }
                    self.cell.service();
                    core::hint::spin_loop();
                }
                self.reconcile();
            } else {
                // Run-as-fast-as-possible: replace the staged frame.
                self.cell.with(|p| p.cancel_pending());
                trace!("staged frame coalesced");
            }
        }
        if !self.cell.active() {
            // Drained while we waited.
            self.reconcile();
            self.update_idle(fb, force_full);
            return;
        }

        let full = force_full || self.mirror != Mirror::Fb1 || self.ongoing_diff;
        self.ongoing_diff = false;
        {
            let diff2 = self.diff2.as_mut().unwrap();
            let fb2 = self.fb2.as_deref_mut().unwrap();
            if full {
                fb2.copy_from_slice(fb);
                diff2.make_dummy();
            } else {
                let fb1 = self.fb1.as_deref().unwrap();
                diff2.compute_stage(
                    fb1,
                    fb2,
                    fb,
                    self.rotation,
                    self.diff_gap,
                    self.compare_mask,
                );
            }
        }
        let cmd = LaunchCmd {
            diff: DiffPtr::of(self.diff2.as_ref().unwrap()),
            fb: FbPtr::of(self.fb2.as_deref().unwrap()),
            rotation: self.rotation,
            strict_start: core::mem::take(&mut self.strict_start_once),
        };
        let launched_now = self.cell.with(|p| {
            if p.active() {
                p.stage_relaunch(cmd);
                false
            } else {
                let now = p.now();
                p.launch(cmd, now);
                true
            }
        });
        if launched_now {
            // We beat the completion: the staged buffers are live now.
            core::mem::swap(&mut self.fb1, &mut self.fb2);
            core::mem::swap(&mut self.diff1, &mut self.diff2);
            self.mirror = Mirror::Fb1;
        }
    }

    /// Launches `diff1` applied to `fb1` asynchronously.
    fn launch_current(&mut self) {
        let cmd = LaunchCmd {
            diff: DiffPtr::of(self.diff1.as_ref().unwrap()),
            fb: FbPtr::of(self.fb1.as_deref().unwrap()),
            rotation: self.rotation,
            strict_start: core::mem::take(&mut self.strict_start_once),
        };
        self.cell.with(|p| {
            let now = p.now();
            p.launch(cmd, now);
        });
        self.mirror = Mirror::Fb1;
    }

    /// Updates only `rect`. `fb` holds the rectangle's pixels with row
    /// stride `stride`. With `redraw_now` false the region is folded into
    /// the mirror and transmitted with the next update instead.
    pub fn update_region(&mut self, redraw_now: bool, fb: &[u16], rect: &Rectangle, stride: usize) {
        if self.verify_awake().is_err() {
            warn_log!("update_region ignored: display not ready");
            return;
        }
        let lw = self.rotation.logical_width() as i32;
        let lh = self.rotation.logical_height() as i32;
        if rect.top_left.x < 0
            || rect.top_left.y < 0
            || rect.top_left.x + rect.size.width as i32 > lw
            || rect.top_left.y + rect.size.height as i32 > lh
            || rect.size.width == 0
            || rect.size.height == 0
            || stride < rect.size.width as usize
            || fb.len() < (rect.size.height as usize - 1) * stride + rect.size.width as usize
        {
            warn_log!("update_region ignored: bad rectangle");
            return;
        }
        self.wait_update_complete();

        if self.fb1.is_none() {
            // No mirror to integrate into: blit the rectangle directly.
            self.blit_region_sync(fb, rect, stride);
            return;
        }
        let fb1 = self.fb1.as_deref_mut().unwrap();

        if self.mirror == Mirror::Fb1 && !self.ongoing_diff {
            if redraw_now {
                // Use the spare diff when bound so a pending one in diff1
                // is left alone.
                let use_diff2 = self.diff2.is_some();
                if !use_diff2 && self.diff1.is_none() {
                    copy_rect(fb1, self.rotation, rect, fb, stride);
                    self.blit_region_sync(fb, rect, stride);
                    return;
                }
                let target = if use_diff2 {
                    self.diff2.as_mut().unwrap()
                } else {
                    self.diff1.as_mut().unwrap()
                };
                target.compute_region_copy(
                    fb1,
                    fb,
                    stride,
                    rect,
                    self.rotation,
                    self.diff_gap,
                    self.compare_mask,
                );
                let strict = core::mem::take(&mut self.strict_start_once);
                let diff = if use_diff2 {
                    self.diff2.take().unwrap()
                } else {
                    self.diff1.take().unwrap()
                };
                let fb1 = self.fb1.as_deref().unwrap();
                run_sync_upload_parts(
                    self.cell,
                    &mut self.delay,
                    &self.ticker,
                    SyncParams {
                        vsync_spacing: self.vsync_spacing,
                        late_start_ratio: self.late_start_ratio,
                        strict,
                        rotation: self.rotation,
                        record: true,
                    },
                    fb1,
                    &diff,
                );
                if use_diff2 {
                    self.diff2 = Some(diff);
                } else {
                    self.diff1 = Some(diff);
                }
            } else if let Some(diff1) = self.diff1.as_mut() {
                // Defer: fold into the mirror, remember that the panel no
                // longer matches it.
                diff1.compute_region_copy(
                    fb1,
                    fb,
                    stride,
                    rect,
                    self.rotation,
                    self.diff_gap,
                    self.compare_mask,
                );
                self.ongoing_diff = true;
                self.mirror = Mirror::None;
            } else {
                copy_rect(fb1, self.rotation, rect, fb, stride);
                self.ongoing_diff = true;
                self.mirror = Mirror::None;
            }
            return;
        }

        // Mirror unknown (or a deferred region is already pending): fold the
        // rectangle in and, when asked to redraw, conservatively upload the
        // whole mirror. This is where a pending deferred diff is dropped.
        copy_rect(fb1, self.rotation, rect, fb, stride);
        if redraw_now {
            self.ongoing_diff = false;
            let mut scratch = [0u8; 32];
            let mut dummy = DiffBuf::new(&mut scratch);
            dummy.make_dummy();
            let strict = core::mem::take(&mut self.strict_start_once);
            let fb1 = self.fb1.as_deref().unwrap();
            run_sync_upload_parts(
                self.cell,
                &mut self.delay,
                &self.ticker,
                SyncParams {
                    vsync_spacing: self.vsync_spacing,
                    late_start_ratio: self.late_start_ratio,
                    strict,
                    rotation: self.rotation,
                    record: true,
                },
                fb1,
                &dummy,
            );
            self.mirror = Mirror::Fb1;
        } else {
            self.ongoing_diff = true;
            self.mirror = Mirror::None;
        }
    }

    /// Fills the panel with a solid colour, synchronously. Fills `fb1` too
    /// when bound so it stays the mirror.
    pub fn clear(&mut self, color: u16) {
        if self.verify_awake().is_err() {
            warn_log!("clear ignored: display not ready");
            return;
        }
        self.wait_update_complete();
        self.ongoing_diff = false;
        if self.fb1.is_some() {
            self.fb1.as_deref_mut().unwrap().fill(color);
            let strict = core::mem::take(&mut self.strict_start_once);
            let mut scratch = [0u8; 32];
            let mut dummy = DiffBuf::new(&mut scratch);
            dummy.make_dummy();
            let fb1 = self.fb1.as_deref().unwrap();
            run_sync_upload_parts(
                self.cell,
                &mut self.delay,
                &self.ticker,
                SyncParams {
                    vsync_spacing: self.vsync_spacing,
                    late_start_ratio: self.late_start_ratio,
                    strict,
                    rotation: self.rotation,
                    record: true,
                },
                fb1,
                &dummy,
            );
            self.mirror = Mirror::Fb1;
            return;
        }
        // No framebuffer bound: stream the colour row by row.
        self.cell.with(|p| {
            let bus = &mut p.parts_mut().bus;
            let _ = bus.write_command(
                Command::ColumnAddressSet.register(),
                &caset_args(0, PANEL_WIDTH - 1),
            );
            let _ = bus.write_command(
                Command::PageAddressSet.register(),
                &caset_args(0, PANEL_HEIGHT - 1),
            );
            let _ = bus.write_command(Command::MemoryWrite.register(), &[]);
        });
        let row = [color; PANEL_WIDTH as usize];
        let mut staging = [0u8; STAGE_PIXELS * 3];
        let mut cursor = ScanCursor::new(Rotation::Deg0, 0);
        let bytes = expand_chunk(&row, &mut cursor, PANEL_WIDTH as usize, &mut staging);
        for _ in 0..PANEL_HEIGHT {
            self.cell
                .with(|p| p.parts_mut().bus.write_pixels(&staging[..bytes]).ok());
        }
        self.cell.with(|p| p.parts_mut().bus.finish());
        self.mirror = Mirror::None;
    }

    /// Synchronous full upload of `fb` through `diff`.
    fn run_sync_upload(&mut self, fb: &[u16], diff: &DiffBuf<'_>, strict: bool) {
        run_sync_upload_parts(
            self.cell,
            &mut self.delay,
            &self.ticker,
            SyncParams {
                vsync_spacing: self.vsync_spacing,
                late_start_ratio: self.late_start_ratio,
                strict,
                rotation: self.rotation,
                record: true,
            },
            fb,
            diff,
        );
    }

    /// Blocking upload of a bare rectangle straight from the caller's
    /// buffer (no mirror bound).
    fn blit_region_sync(&mut self, fb: &[u16], rect: &Rectangle, stride: usize) {
        let panel = rotation_box(self.rotation, rect);
        let bx0 = panel.top_left.x as u16;
        let by0 = panel.top_left.y as u16;
        let bw = panel.size.width as u16;
        let bh = panel.size.height as u16;
        let rotation = self.rotation;
        let mut staging = [0u8; STAGE_PIXELS * 3];
        self.cell.with(|p| {
            let bus = &mut p.parts_mut().bus;
            let _ = bus.write_command(
                Command::ColumnAddressSet.register(),
                &caset_args(bx0, bx0 + bw - 1),
            );
            let _ = bus.write_command(
                Command::PageAddressSet.register(),
                &caset_args(by0, by0 + bh - 1),
            );
            let _ = bus.write_command(Command::MemoryWrite.register(), &[]);
        });
        for py in by0..by0 + bh {
            let mut n = 0usize;
            for px in bx0..bx0 + bw {
                let logical = rotation
                    .logical_point(embedded_graphics::prelude::Point::new(px as i32, py as i32));
                let rel_x = (logical.x - rect.top_left.x) as usize;
                let rel_y = (logical.y - rect.top_left.y) as usize;
                let c = fb[rel_y * stride + rel_x];
                let r5 = (c >> 11) & 0x1F;
                let g6 = (c >> 5) & 0x3F;
                let b5 = c & 0x1F;
                staging[n] = (r5 * 255 / 31) as u8;
                staging[n + 1] = (g6 * 255 / 63) as u8;
                staging[n + 2] = (b5 * 255 / 31) as u8;
                n += 3;
            }
            self.cell
                .with(|p| p.parts_mut().bus.write_pixels(&staging[..n]).ok());
        }
        self.cell.with(|p| p.parts_mut().bus.finish());
    }
}

struct SyncParams {
    vsync_spacing: i8,
    late_start_ratio: f32,
    strict: bool,
    rotation: Rotation,
    record: bool,
}

/// The synchronous upload strategy: the same window/run/wait sequence as the
/// interrupt pipeline, driven inline with blocking waits. The cell lock is
/// taken per chunk so interrupts stay live between bursts.
fn run_sync_upload_parts<HW: DisplayHw>(
    cell: &'static UploadCell<HW>,
    delay: &mut HW::Delay,
    ticker: &HW::Ticker,
    params: SyncParams,
    fb: &[u16],
    diff: &DiffBuf<'_>,
) {
    let mut reader = diff.reader();
    let period = cell.with(|p| p.clock.period_us());

    // Frame pacing from the end of the previous frame's beam slot.
    if params.vsync_spacing >= 1 {
        let last = cell.with(|p| p.last_stats());
        let spacing =
            (last.refreshes.max(1) + params.vsync_spacing as u32 - 1).saturating_mul(period);
        let target = last.frame_start_us.wrapping_add(spacing);
        let now = ticker.micros();
        let remaining = target.wrapping_sub(now);
        if remaining > 0 && remaining <= period.saturating_mul(32) {
            delay.delay_us(remaining);
        }
    }

    let first_row = match reader.peek_row() {
        Some(row) => row,
        None => return,
    };

    // Start-line gate.
    let mut now = ticker.micros();
    if params.vsync_spacing >= 1 {
        let sc1 = line_of_row(first_row);
        let wait = cell.with(|p| {
            let line = p.clock.line_now(now);
            if params.strict {
                p.clock.micros_to_reach(0, now)
            } else {
                let span = ((SCAN_LINES - sc1) as f32 * params.late_start_ratio) as u16;
                let dist = (line + SCAN_LINES - sc1) % SCAN_LINES;
                if dist <= span {
                    0
                } else {
                    p.clock.micros_to_reach(sc1, now)
                }
            }
        });
        if wait > MIN_WAIT_US {
            delay.delay_us(wait);
        }
        now = ticker.micros();
    }

    let start_line = cell.with(|p| p.clock.line_now(now));
    let mut stats = UploadStats {
        frame_start_us: now,
        refreshes: 1,
        min_margin: i32::MAX,
        start_line,
        duration_us: 0,
        teared: false,
    };

    let mut window = (u16::MAX, u16::MAX);
    let mut staging = [0u8; STAGE_PIXELS * 3];
    loop {
        let now = ticker.micros();
        let beam = stats.start_line as u32
            + cell.with(|p| p.clock.lines_during(now.wrapping_sub(stats.frame_start_us)));
        let allowed = if params.vsync_spacing >= 1 {
            allowed_row_for(beam)
        } else {
            PANEL_HEIGHT - 1
        };
        match reader.next(allowed) {
            DiffOp::Run { x, y, len } => {
                cell.with(|p| {
                    let mut w = window;
                    let _ = emit_run_window(&mut p.parts_mut().bus, &mut w, x, y);
                    window = w;
                });
                let linear = y as usize * PANEL_WIDTH as usize + x as usize;
                let mut cursor = ScanCursor::new(params.rotation, linear);
                let mut left = len as usize;
                while left > 0 {
                    let in_row = PANEL_WIDTH as usize - cursor.col() as usize;
                    let chunk = left.min(in_row).min(STAGE_PIXELS);
                    let bytes = expand_chunk(fb, &mut cursor, chunk, &mut staging);
                    cell.with(|p| p.parts_mut().bus.write_pixels(&staging[..bytes]).ok());
                    left -= chunk;

                    let now = ticker.micros();
                    let beam = stats.start_line as u32
                        + cell.with(|p| {
                            p.clock.lines_during(now.wrapping_sub(stats.frame_start_us))
                        });
                    note_margin_sample(&mut stats, cursor.row(), beam);
                }
            }
            DiffOp::Wait { row } => {
                let line = line_of_row(row) as u32;
                let wait_lines = (line + 1).saturating_sub(beam).max(1);
                let us = cell
                    .with(|p| p.clock.time_for_scanlines(wait_lines))
                    .max(MIN_WAIT_US);
                delay.delay_us(us);
            }
            DiffOp::Done => break,
        }
    }

    let now = ticker.micros();
    stats.duration_us = now.wrapping_sub(stats.frame_start_us);
    let swept = cell.with(|p| p.clock.lines_during(stats.duration_us));
    stats.refreshes = swept.div_ceil(SCAN_LINES as u32).max(1);
    if stats.min_margin == i32::MAX {
        stats.min_margin = SCAN_LINES as i32;
    }
    cell.with(|p| {
        p.parts_mut().bus.finish();
        if params.record {
            p.record_sync_stats(stats);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhw::{leak_diff_storage, leak_fb, new_driver, new_driver_unstarted, MockHw};
    use crate::UploadCell;
    use embedded_graphics::prelude::{Point, Size};
    use std::vec;
    use std::vec::Vec;

    fn frame(fill: u16) -> Vec<u16> {
        vec![fill; PANEL_PIXELS]
    }

    fn bind_double(driver: &mut Ili9488<MockHw>) {
        driver.bind_framebuffers(Some(leak_fb()), None);
        driver.bind_diff_buffers(
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
            None,
        );
    }

    fn bind_triple(driver: &mut Ili9488<MockHw>) {
        driver.bind_framebuffers(Some(leak_fb()), Some(leak_fb()));
        driver.bind_diff_buffers(
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
        );
    }

    #[test]
    fn bring_up_fails_on_bad_status() {
        let (mut driver, _cell, shared) = new_driver_unstarted();
        shared.lock().self_diag = 0x00;
        assert!(driver.begin().is_err());
        // Updates are refused until bring-up succeeds.
        let f = frame(0xFFFF);
        driver.update(&f, false);
        assert_eq!(shared.pixels_written(), 0);
    }

    #[test]
    fn full_redraw_at_vsync_two_is_clean() {
        // Scenario: black frame, vsync 2, full redraw.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        let black = frame(0x0000);
        driver.update(&black, false);
        driver.wait_update_complete();

        assert!(driver.self_diag_ok().unwrap());
        let stats = driver.last_stats();
        assert!(stats.min_margin >= 0, "margin was {}", stats.min_margin);
        assert_eq!(driver.teared_count(), 0);
        assert_eq!(shared.pixels_written(), PANEL_PIXELS as u64);
        shared.assert_panel_matches(&black, Rotation::Deg0);
    }

    #[test]
    fn single_pixel_update_stays_tiny() {
        // Scenario: one pixel changes; the upload carries at most 1 + gap.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        driver.set_diff_gap(4);
        let base = frame(0x0000);
        driver.update(&base, false);
        driver.wait_update_complete();

        let before = shared.pixels_written();
        let mut next = base.clone();
        next[200 * PANEL_WIDTH as usize + 100] = 0xF800;
        driver.update(&next, false);
        driver.wait_update_complete();

        let delta = shared.pixels_written() - before;
        assert!(delta >= 1 && delta <= 1 + 4, "uploaded {} pixels", delta);
        assert_eq!(shared.panel_pixel(100, 200), 0xF800);
    }

    #[test]
    fn half_frame_fill_is_one_run_per_scanline() {
        // Scenario: top half changes; gap 4 gives 240 full-width runs.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        driver.set_diff_gap(4);
        let base = frame(0x0000);
        driver.update(&base, false);
        driver.wait_update_complete();

        let before = shared.pixels_written();
        let mut next = base.clone();
        for i in 0..240 * PANEL_WIDTH as usize {
            next[i] = 0xFFFF;
        }
        driver.update(&next, false);
        driver.wait_update_complete();

        assert_eq!(
            shared.pixels_written() - before,
            240 * PANEL_WIDTH as u64
        );
        shared.assert_panel_matches(&next, Rotation::Deg0);
    }

    #[test]
    fn triple_buffering_stages_and_relaunches() {
        // Scenario: three frames back to back; the second is staged while
        // the first uploads, the third waits for the stage slot, and the
        // panel ends on the third frame after exactly three uploads.
        let (mut driver, cell, shared) = new_driver();
        bind_triple(&mut driver);
        driver.set_vsync_spacing(2);
        let f1 = frame(0x0101);
        let f2 = frame(0x0202);
        let f3 = frame(0x0303);

        driver.update(&f1, false);
        assert!(driver.async_update_active());
        driver.update(&f2, false);
        assert!(cell.with(|p| p.fb2_full), "second frame staged");
        driver.update(&f3, false);
        driver.wait_update_complete();

        assert_eq!(shared.finished_uploads(), 3);
        shared.assert_panel_matches(&f3, Rotation::Deg0);
    }

    #[test]
    fn rotated_pixel_lands_on_rotated_panel_address() {
        // Scenario: the single-pixel update under rotation 1.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        driver.set_rotation(1).unwrap();
        let base = frame(0x0000);
        driver.update(&base, false);
        driver.wait_update_complete();

        let mut next = base.clone();
        // Logical (100, 200) in the 480x320 landscape framebuffer.
        next[200 * 480 + 100] = 0xF800;
        driver.update(&next, false);
        driver.wait_update_complete();

        // Deg90 maps logical (100, 200) to panel (119, 100).
        assert_eq!(shared.panel_pixel(119, 100), 0xF800);
        shared.assert_panel_matches(&next, Rotation::Deg90);

        // The address window covered the rotated coordinates.
        let caset_starts: Vec<u16> = shared
            .lock()
            .commands
            .iter()
            .filter(|(c, a)| *c == Command::ColumnAddressSet as u8 && a.len() == 4)
            .map(|(_, a)| u16::from_be_bytes([a[0], a[1]]))
            .collect();
        assert!(caset_starts.contains(&119), "no window at column 119");
    }

    #[test]
    fn masked_bits_produce_no_upload() {
        // Scenario: blue-only changes under a blue compare mask.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        let base = frame(0x1234);
        driver.update(&base, false);
        driver.wait_update_complete();

        driver.set_compare_mask(0x001F);
        let before = shared.pixels_written();
        let uploads = shared.finished_uploads();
        let next: Vec<u16> = base.iter().map(|p| p ^ 0x0015).collect();
        driver.update(&next, false);

        assert!(!driver.async_update_active());
        assert_eq!(shared.pixels_written(), before);
        assert_eq!(shared.finished_uploads(), uploads);
    }

    #[test]
    fn vsync_pacing_spaces_frames() {
        let (mut driver, cell, _shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        let f = frame(0x0F0F);
        let mut starts = Vec::new();
        for _ in 0..4 {
            driver.update(&f, true);
            driver.wait_update_complete();
            starts.push(driver.last_stats().frame_start_us);
        }
        let period = cell.with(|p| p.clock.period_us()) as i64;
        for pair in starts.windows(2).skip(1) {
            let dt = pair[1].wrapping_sub(pair[0]) as i64;
            assert!(
                (dt - 2 * period).abs() <= period / 3,
                "interval {} vs period {}",
                dt,
                period
            );
        }
    }

    #[test]
    fn zero_late_start_ratio_waits_for_line_zero() {
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(1);
        driver.set_late_start_ratio(0.0);
        let f = frame(0x00FF);
        // Consume the one-shot strict start from bring-up.
        driver.update(&f, true);
        driver.wait_update_complete();

        // Park the beam mid-sweep; the upload must still start at line 0.
        shared.put_beam_at(150);
        driver.update(&f, true);
        driver.wait_update_complete();
        let stats = driver.last_stats();
        assert!(stats.start_line <= 1, "started at line {}", stats.start_line);
    }

    #[test]
    fn gated_diff_upload_chases_the_beam_cleanly() {
        // Many gated runs with real transmission time: the writer is
        // released row by row behind the beam and the frame never tears.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(2);
        let base = frame(0x0000);
        driver.update(&base, false);
        driver.wait_update_complete();

        let mut next = base.clone();
        for (i, px) in next.iter_mut().enumerate() {
            if (i / PANEL_WIDTH as usize) % 2 == 0 {
                *px = 0xFFFF;
            }
        }
        driver.update(&next, false);
        driver.wait_update_complete();

        let stats = driver.last_stats();
        assert!(stats.min_margin >= 0, "margin was {}", stats.min_margin);
        assert!(!stats.teared);
        assert_eq!(driver.teared_count(), 0);
        shared.assert_panel_matches(&next, Rotation::Deg0);
    }

    #[test]
    fn slow_link_marks_the_frame_teared() {
        // A link slower than the refresh cannot outrun the beam: the beam
        // laps the write cursor and the frame is accounted as teared.
        let (mut driver, _cell, shared) = new_driver();
        shared.lock().pixel_cost_ns = 2_000;
        bind_double(&mut driver);
        driver.set_vsync_spacing(1);
        let f = frame(0x0000);
        driver.update(&f, false);
        driver.wait_update_complete();

        let stats = driver.last_stats();
        assert!(stats.min_margin < 0, "margin was {}", stats.min_margin);
        assert!(stats.teared);
        assert!(driver.teared_count() >= 1);
    }

    #[test]
    fn drop_mode_returns_without_touching_buffers() {
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(-1);
        let f1 = frame(0x1111);
        driver.update(&f1, false);
        assert!(driver.async_update_active());

        let before = shared.pixels_written();
        let f2 = frame(0x2222);
        driver.update(&f2, false);
        assert_eq!(shared.pixels_written(), before, "dropped frame wrote pixels");

        driver.wait_update_complete();
        shared.assert_panel_matches(&f1, Rotation::Deg0);
    }

    #[test]
    fn spare_diff_overlaps_with_inflight_upload() {
        let (mut driver, _cell, shared) = new_driver();
        driver.bind_framebuffers(Some(leak_fb()), None);
        driver.bind_diff_buffers(
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
        );
        driver.set_vsync_spacing(0);
        let f1 = frame(0x4444);
        driver.update(&f1, false);
        assert!(driver.async_update_active());

        let f2 = frame(0x5555);
        driver.update(&f2, false);
        driver.wait_update_complete();
        assert_eq!(shared.finished_uploads(), 2);
        shared.assert_panel_matches(&f2, Rotation::Deg0);
    }

    #[test]
    fn deferred_region_is_integrated_by_next_update() {
        // The documented ongoing-diff handoff: a deferred region folds into
        // the mirror, is not uploaded yet, and the next update redraws in
        // full, which subsumes it.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(0);
        let base = frame(0x0005);
        driver.update(&base, false);
        driver.wait_update_complete();

        let src = vec![0x0007u16; 8];
        let rect = Rectangle::new(Point::new(10, 20), Size::new(4, 2));
        driver.update_region(false, &src, &rect, 4);
        assert!(driver.diff_update_active());
        // Nothing transmitted yet.
        assert_eq!(shared.panel_pixel(10, 20), 0x0005);

        driver.update(&base, false);
        driver.wait_update_complete();
        assert!(!driver.diff_update_active());
        // The deferred region was superseded by the full redraw of `base`.
        shared.assert_panel_matches(&base, Rotation::Deg0);
    }

    #[test]
    fn immediate_region_update_transmits_only_the_rect() {
        let (mut driver, _cell, shared) = new_driver();
        driver.bind_framebuffers(Some(leak_fb()), None);
        driver.bind_diff_buffers(
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
            Some(DiffBuf::new(leak_diff_storage(128 * 1024))),
        );
        driver.set_vsync_spacing(0);
        driver.set_diff_gap(1);
        let base = frame(0x0005);
        driver.update(&base, false);
        driver.wait_update_complete();

        let before = shared.pixels_written();
        let src = vec![0x0007u16; 8];
        let rect = Rectangle::new(Point::new(10, 20), Size::new(4, 2));
        driver.update_region(true, &src, &rect, 4);
        assert_eq!(shared.pixels_written() - before, 8);
        assert_eq!(shared.panel_pixel(10, 20), 0x0007);
        assert_eq!(shared.panel_pixel(13, 21), 0x0007);
        assert_eq!(shared.panel_pixel(14, 21), 0x0005);
    }

    #[test]
    fn clear_without_buffers_streams_solid_colour() {
        let (mut driver, _cell, shared) = new_driver();
        driver.clear(0xF800);
        let red = frame(0xF800);
        shared.assert_panel_matches(&red, Rotation::Deg0);
        // A plain update still works without any buffers bound.
        let f = frame(0x07E0);
        driver.update(&f, false);
        shared.assert_panel_matches(&f, Rotation::Deg0);
    }

    #[test]
    fn pixel_expansion_matches_panel_rgb() {
        // Every pixel goes out as a whole 24-bit frame whose upper 18 bits
        // carry the colour; the mock panel folds them back to RGB565.
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(0);
        let mut f = frame(0);
        for (i, px) in f.iter_mut().enumerate() {
            *px = (i as u16).wrapping_mul(2654435761u32 as u16) | (i as u16 >> 3);
        }
        driver.update(&f, false);
        driver.wait_update_complete();
        shared.assert_panel_matches(&f, Rotation::Deg0);
    }

    #[test]
    fn rotation_change_forces_full_redraw() {
        let (mut driver, _cell, shared) = new_driver();
        bind_double(&mut driver);
        driver.set_vsync_spacing(0);
        let f = frame(0x2222);
        driver.update(&f, false);
        driver.wait_update_complete();

        driver.set_rotation(2).unwrap();
        let before = shared.pixels_written();
        driver.update(&f, false);
        driver.wait_update_complete();
        assert_eq!(
            shared.pixels_written() - before,
            PANEL_PIXELS as u64,
            "redraw after rotation must be full"
        );
        shared.assert_panel_matches(&f, Rotation::Deg180);
    }

    #[test]
    fn buffering_mode_tracks_bindings() {
        let (mut driver, _cell, _shared) = new_driver();
        assert_eq!(driver.buffering_mode(), BufferingMode::None);
        driver.bind_framebuffers(Some(leak_fb()), None);
        assert_eq!(driver.buffering_mode(), BufferingMode::Double);
        driver.bind_framebuffers(Some(leak_fb()), Some(leak_fb()));
        assert_eq!(driver.buffering_mode(), BufferingMode::Triple);
    }

    #[test]
    fn refresh_mode_changes_remeasure_the_period() {
        let (mut driver, cell, shared) = new_driver();
        let base_period = cell.with(|p| p.clock.period_us());
        // Slow the mock panel down as mode 8 would.
        let slowed = period_for_mode(shared.lock().period_us, 8);
        shared.lock().period_us = slowed;
        driver.set_refresh_mode(8).unwrap();
        let measured = cell.with(|p| p.clock.period_us());
        assert!(
            measured > base_period,
            "period {} should exceed {}",
            measured,
            base_period
        );
        let diff = (measured as i64 - slowed as i64).abs();
        assert!(diff < 200, "measured {} vs expected {}", measured, slowed);

        assert!(driver.set_refresh_mode(REFRESH_MODES).is_err());
    }

    #[test]
    fn cell_static_is_sync() {
        // The cell must be placeable in a `static` for interrupt access.
        fn assert_sync<T: Sync>() {}
        assert_sync::<UploadCell<MockHw>>();
    }
}
