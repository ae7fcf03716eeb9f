//! The interrupt-driven upload pipeline.
//!
//! An asynchronous upload is a small state machine stepped from interrupt
//! context: read the next diff instruction; if the beam has not passed its
//! scanline yet, arm the deadline timer; if the stream is done, finish up;
//! otherwise move the write window and burst the run's pixels out in
//! scanline-sized chunks. Both the DMA-completion interrupt and the timer
//! interrupt resume the same machine through [`UploadCell::on_interrupt`].
//!
//! The cell lives in a `static` supplied by the embedder, which is what lets
//! interrupt context reach it. Everything the interrupt touches sits behind
//! one `critical-section` mutex; caller-context code takes the same lock for
//! short windows only.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::bus::DisplayBus;
use crate::diff::{DiffOp, DiffReader};
use crate::hw::{DeadlineTimer, DisplayHw, Ticker};
use crate::ili9488::Command;
use crate::log::trace;
use crate::rotation::{Rotation, ScanCursor};
use crate::scanline::{line_of_row, row_of_line, ScanlineClock};
use crate::{PANEL_HEIGHT, PANEL_WIDTH, SCAN_LINES};

/// Pixels staged per DMA burst: at most one native scanline.
pub(crate) const STAGE_PIXELS: usize = PANEL_WIDTH as usize;
const STAGE_BYTES: usize = STAGE_PIXELS * 3;

/// Never arm the deadline timer for less than this.
pub(crate) const MIN_WAIT_US: u32 = 25;

/// Expands RGB565 words to the panel's 3-byte pixel format, walking `fb`
/// in panel scan order from `cursor`. Returns the byte count written.
pub(crate) fn expand_chunk(
    fb: &[u16],
    cursor: &mut ScanCursor,
    pixels: usize,
    out: &mut [u8],
) -> usize {
    for i in 0..pixels {
        let c = fb[cursor.logical()];
        let r5 = (c >> 11) & 0x1F;
        let g6 = (c >> 5) & 0x3F;
        let b5 = c & 0x1F;
        out[i * 3] = (r5 * 255 / 31) as u8;
        out[i * 3 + 1] = (g6 * 255 / 63) as u8;
        out[i * 3 + 2] = (b5 * 255 / 31) as u8;
        cursor.step();
    }
    pixels * 3
}

/// Moves the write window for a run and issues RAMWR. Only the start
/// coordinate that changed is resent; RAMWR resets the panel's write pointer
/// to the window origin.
pub(crate) fn emit_run_window<B: DisplayBus>(
    bus: &mut B,
    window: &mut (u16, u16),
    x: u16,
    y: u16,
) -> Result<(), B::Error> {
    if window.0 != x {
        bus.write_command(
            Command::ColumnAddressSet as u8,
            &caset_args(x, PANEL_WIDTH - 1),
        )?;
        window.0 = x;
    }
    if window.1 != y {
        bus.write_command(
            Command::PageAddressSet as u8,
            &caset_args(y, PANEL_HEIGHT - 1),
        )?;
        window.1 = y;
    }
    bus.write_command(Command::MemoryWrite as u8, &[])?;
    Ok(())
}

/// Window arguments: two big-endian 16-bit values, start then end.
pub(crate) fn caset_args(start: u16, end: u16) -> [u8; 4] {
    let s = start.to_be_bytes();
    let e = end.to_be_bytes();
    [s[0], s[1], e[0], e[1]]
}

/// The last panel row the beam at timing line `beam_lines` has fully swept.
///
/// `row_of_line(beam)` is the row the sweep is currently inside, so the row
/// before it is the newest one safe to write behind the beam. Row 0 is
/// released at the very start of the sweep, where the start gate has
/// already aligned the writer with the beam.
pub(crate) fn allowed_row_for(beam_lines: u32) -> u16 {
    if beam_lines >= SCAN_LINES as u32 {
        return PANEL_HEIGHT - 1;
    }
    row_of_line(beam_lines as u16).saturating_sub(1)
}

/// Folds one margin sample into `stats`: the slack, in timing lines, before
/// the beam's next pass would catch a write cursor sitting on `cursor_row`.
/// Negative slack means the beam lapped the cursor and the frame teared.
pub(crate) fn note_margin_sample(stats: &mut UploadStats, cursor_row: u16, beam_lines: u32) {
    let writer = line_of_row(cursor_row.min(PANEL_HEIGHT - 1)) as i32;
    let margin = writer + SCAN_LINES as i32 - beam_lines as i32;
    if margin < stats.min_margin {
        stats.min_margin = margin;
        if margin < 0 {
            stats.teared = true;
        }
    }
}

/// Timing of the last (or in-flight) frame upload.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default)]
pub struct UploadStats {
    /// Timestamp of the upload's first emission.
    pub frame_start_us: u32,
    /// Panel refreshes the upload spanned.
    pub refreshes: u32,
    /// Minimum slack, in timing lines, before the beam would have caught the
    /// write cursor. Negative means it did.
    pub min_margin: i32,
    /// Timing line at the first emission.
    pub start_line: u16,
    /// Total emission time in microseconds.
    pub duration_us: u32,
    /// True when the beam overtook the write cursor at least once.
    pub teared: bool,
}

/// Raw view of a framebuffer handed to the pipeline.
///
/// Wrapped raw pointers so the pipeline state can live behind the
/// critical-section mutex. The buffering policy guarantees the memory stays
/// valid and unwritten while the upload is in flight.
#[derive(Copy, Clone)]
pub(crate) struct FbPtr {
    ptr: *const u16,
    len: usize,
}

unsafe impl Send for FbPtr {}

impl FbPtr {
    pub(crate) fn of(fb: &[u16]) -> Self {
        FbPtr {
            ptr: fb.as_ptr(),
            len: fb.len(),
        }
    }

    /// # Safety
    ///
    /// Only while the exclusivity invariant above holds.
    unsafe fn as_slice(&self) -> &[u16] {
        core::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// Raw view of an encoded diff handed to the pipeline. Same invariant as
/// [`FbPtr`].
#[derive(Copy, Clone)]
pub(crate) struct DiffPtr {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for DiffPtr {}

impl DiffPtr {
    pub(crate) fn of(diff: &crate::diff::DiffBuf<'_>) -> Self {
        let (ptr, len) = diff.as_raw();
        DiffPtr { ptr, len }
    }
}

/// Everything needed to start one asynchronous upload.
pub(crate) struct LaunchCmd {
    pub diff: DiffPtr,
    pub fb: FbPtr,
    pub rotation: Rotation,
    /// One-shot strict wait-for-line-0 (first frame after bring-up/resync).
    pub strict_start: bool,
}

/// The ISR-side hardware: serial bus, deadline timer and a clock handle.
pub(crate) struct Parts<HW: DisplayHw> {
    pub bus: HW::Bus,
    pub timer: HW::Timer,
    pub ticker: HW::Ticker,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Waiting out the vsync spacing before this frame may begin.
    PacingDelay,
    /// Waiting for the beam to reach the start scanline.
    StartLineWait { strict: bool },
    /// Waiting for the beam to pass the next run's scanline.
    RunWait,
    /// A pixel burst is in flight.
    Burst,
}

pub(crate) struct Pipeline<HW: DisplayHw> {
    parts: Option<Parts<HW>>,

    phase: Phase,
    reader: Option<DiffReader<'static>>,
    fb: FbPtr,
    rotation: Rotation,
    staging: [u8; STAGE_BYTES],
    cursor: Option<ScanCursor>,
    run_left: u32,
    window: (u16, u16),

    /// Beam snapshot for predictions; refreshed by the driver on every
    /// hardware resync and period change.
    pub(crate) clock: ScanlineClock,
    pub(crate) vsync_spacing: i8,
    pub(crate) late_start_ratio: f32,

    stats: UploadStats,
    last: UploadStats,
    teared_count: u32,

    /// Strictness carried across a pacing delay.
    pending_strict: bool,
    /// Staged relaunch executed by the completion interrupt
    /// (triple-buffering).
    pending: Option<LaunchCmd>,
    pub(crate) fb2_full: bool,
    /// Set when a staged relaunch consumed the spare buffers; the caller
    /// swaps its buffer roles when it next looks.
    pub(crate) swapped: bool,

    active: bool,
}

impl<HW: DisplayHw> Pipeline<HW> {
    const fn empty() -> Self {
        Pipeline {
            parts: None,
            phase: Phase::Idle,
            reader: None,
            fb: FbPtr {
                ptr: core::ptr::null(),
                len: 0,
            },
            rotation: Rotation::Deg0,
            staging: [0; STAGE_BYTES],
            cursor: None,
            run_left: 0,
            window: (u16::MAX, u16::MAX),
            clock: ScanlineClock::new(16_600),
            vsync_spacing: 1,
            late_start_ratio: 0.3,
            stats: UploadStats {
                frame_start_us: 0,
                refreshes: 0,
                min_margin: 0,
                start_line: 0,
                duration_us: 0,
                teared: false,
            },
            last: UploadStats {
                frame_start_us: 0,
                refreshes: 0,
                min_margin: 0,
                start_line: 0,
                duration_us: 0,
                teared: false,
            },
            teared_count: 0,
            pending_strict: false,
            pending: None,
            fb2_full: false,
            swapped: false,
            active: false,
        }
    }

    pub(crate) fn install(&mut self, parts: Parts<HW>) {
        self.parts = Some(parts);
    }

    pub(crate) fn parts_mut(&mut self) -> &mut Parts<HW> {
        self.parts.as_mut().expect("hardware installed at new()")
    }

    pub(crate) fn active(&self) -> bool {
        self.active
    }

    pub(crate) fn last_stats(&self) -> UploadStats {
        self.last
    }

    pub(crate) fn teared_count(&self) -> u32 {
        self.teared_count
    }

    pub(crate) fn now(&self) -> u32 {
        self.parts
            .as_ref()
            .map(|p| p.ticker.micros())
            .unwrap_or(0)
    }

    pub(crate) fn stage_relaunch(&mut self, cmd: LaunchCmd) {
        self.pending = Some(cmd);
        self.fb2_full = true;
    }

    /// Withdraws a staged relaunch so its buffers may be rewritten.
    pub(crate) fn cancel_pending(&mut self) {
        self.pending = None;
        self.fb2_full = false;
    }

    /// Records the final stats of a synchronous upload so the reporting
    /// surface is the same for both strategies.
    pub(crate) fn record_sync_stats(&mut self, stats: UploadStats) {
        self.last = stats;
        if stats.teared {
            self.teared_count += 1;
        }
    }

    /// Starts an asynchronous upload. Never blocks: any waiting is done by
    /// arming the deadline timer.
    pub(crate) fn launch(&mut self, cmd: LaunchCmd, now: u32) {
        debug_assert!(!self.active);
        self.active = true;
        // Safety: the policy layer keeps the diff and framebuffer untouched
        // until this upload completes.
        self.reader = Some(unsafe { DiffReader::from_raw(cmd.diff.ptr, cmd.diff.len) });
        self.fb = cmd.fb;
        self.rotation = cmd.rotation;
        self.window = (u16::MAX, u16::MAX);
        self.cursor = None;
        self.run_left = 0;
        self.stats = UploadStats {
            frame_start_us: now,
            refreshes: 1,
            min_margin: i32::MAX,
            start_line: 0,
            duration_us: 0,
            teared: false,
        };

        if self.vsync_spacing >= 1 {
            // Pace from the end of the previous frame's beam slot: its start
            // plus the refreshes it occupied, plus the configured spacing.
            let occupied = self.last.refreshes.max(1);
            let spacing = (occupied + self.vsync_spacing as u32 - 1)
                .saturating_mul(self.clock.period_us());
            let target = self.last.frame_start_us.wrapping_add(spacing);
            let remaining = target.wrapping_sub(now);
            // A huge "remaining" means the target is already behind us.
            if remaining > 0 && remaining <= self.clock.period_us().saturating_mul(32) {
                self.phase = Phase::PacingDelay;
                self.pending_strict = cmd.strict_start;
                self.parts_mut().timer.arm_us(remaining.max(MIN_WAIT_US));
                trace!("pacing delay {} us", remaining);
                return;
            }
        }
        self.gate_start(cmd.strict_start, now);
    }

    /// Decides when emission may begin relative to the beam.
    fn gate_start(&mut self, strict: bool, now: u32) {
        let peeked = self.reader.as_mut().unwrap().peek_row();
        let first_row = match peeked {
            Some(row) => row,
            None => {
                // Empty diff: nothing to transmit.
                self.finalize(now);
                return;
            }
        };
        if self.vsync_spacing < 1 {
            self.begin_emission(now);
            return;
        }
        let sc1 = line_of_row(first_row);
        let line = self.clock.line_now(now);
        if strict {
            let wait = self.clock.micros_to_reach(0, now);
            if wait > MIN_WAIT_US {
                self.phase = Phase::StartLineWait { strict: false };
                self.parts_mut().timer.arm_us(wait);
                return;
            }
            self.begin_emission(now);
            return;
        }
        // The frame may still start inside the late window
        // [sc1, sc1 + (SCAN_LINES - sc1) * late_start_ratio]. Anywhere else,
        // wait for the beam to come back to the start line.
        let span = ((SCAN_LINES - sc1) as f32 * self.late_start_ratio) as u16;
        let dist = (line + SCAN_LINES - sc1) % SCAN_LINES;
        if dist <= span {
            self.begin_emission(now);
            return;
        }
        let wait = self.clock.micros_to_reach(sc1, now);
        if wait <= MIN_WAIT_US {
            self.begin_emission(now);
            return;
        }
        self.phase = Phase::StartLineWait { strict: false };
        self.parts_mut().timer.arm_us(wait);
    }

    fn begin_emission(&mut self, now: u32) {
        self.stats.frame_start_us = now;
        self.stats.start_line = self.clock.line_now(now);
        trace!("upload starts at line {}", self.stats.start_line);
        self.advance(now);
    }

    /// Beam position in timing lines since emission start, unwrapped.
    fn beam_lines(&self, now: u32) -> u32 {
        self.stats.start_line as u32
            + self
                .clock
                .lines_during(now.wrapping_sub(self.stats.frame_start_us))
    }

    fn note_margin(&mut self, now: u32) {
        let Some(cursor) = self.cursor.as_ref() else {
            return;
        };
        let row = cursor.row();
        let beam = self.beam_lines(now);
        note_margin_sample(&mut self.stats, row, beam);
    }

    /// Consumes diff instructions until a burst is in flight, a wait is
    /// armed, or the stream ends.
    fn advance(&mut self, now: u32) {
        loop {
            if self.run_left > 0 {
                self.stage_burst();
                return;
            }
            let allowed = if self.vsync_spacing >= 1 {
                allowed_row_for(self.beam_lines(now))
            } else {
                PANEL_HEIGHT - 1
            };
            let op = self.reader.as_mut().unwrap().next(allowed);
            match op {
                DiffOp::Run { x, y, len } => {
                    let linear = y as usize * PANEL_WIDTH as usize + x as usize;
                    self.cursor = Some(ScanCursor::new(self.rotation, linear));
                    self.run_left = len;
                    let mut window = self.window;
                    let bus = &mut self.parts_mut().bus;
                    let _ = emit_run_window(bus, &mut window, x, y);
                    self.window = window;
                }
                DiffOp::Wait { row } => {
                    let line = line_of_row(row) as u32;
                    let beam = self.beam_lines(now);
                    let wait_lines = (line + 1).saturating_sub(beam).max(1);
                    let us = self.clock.time_for_scanlines(wait_lines).max(MIN_WAIT_US);
                    self.phase = Phase::RunWait;
                    self.parts_mut().timer.arm_us(us);
                    return;
                }
                DiffOp::Done => {
                    self.finalize(now);
                    return;
                }
            }
        }
    }

    fn stage_burst(&mut self) {
        let cursor = self.cursor.as_mut().unwrap();
        let in_row = PANEL_WIDTH as usize - cursor.col() as usize;
        let chunk = (self.run_left as usize).min(in_row).min(STAGE_PIXELS);
        // Safety: exclusivity invariant of `FbPtr`.
        let fb = unsafe { self.fb.as_slice() };
        let mut local = *cursor;
        let bytes = expand_chunk(fb, &mut local, chunk, &mut self.staging);
        *cursor = local;
        self.run_left -= chunk as u32;
        self.phase = Phase::Burst;
        let staging = self.staging.as_ptr();
        // Safety: the staging buffer lives inside the static cell and is not
        // touched again before the completion interrupt.
        unsafe { self.parts_mut().bus.start_pixels(staging, bytes) };
    }

    fn finalize(&mut self, now: u32) {
        self.parts_mut().bus.finish();
        let swept = self
            .clock
            .lines_during(now.wrapping_sub(self.stats.frame_start_us));
        self.stats.refreshes = swept.div_ceil(SCAN_LINES as u32).max(1);
        self.stats.duration_us = now.wrapping_sub(self.stats.frame_start_us);
        if self.stats.min_margin == i32::MAX {
            self.stats.min_margin = SCAN_LINES as i32;
        }
        self.last = self.stats;
        if self.stats.teared {
            self.teared_count += 1;
        }
        self.reader = None;
        self.cursor = None;
        self.phase = Phase::Idle;
        self.active = false;
        trace!("upload done in {} us", self.last.duration_us);
        if let Some(cmd) = self.pending.take() {
            self.fb2_full = false;
            self.swapped = true;
            self.launch(cmd, now);
        }
    }

    /// One step of the state machine; entered from interrupt context or from
    /// a completion/deadline poll.
    pub(crate) fn step(&mut self, now: u32) {
        match self.phase {
            Phase::Idle => {}
            Phase::PacingDelay => {
                let strict = self.pending_strict;
                self.gate_start(strict, now);
            }
            Phase::StartLineWait { strict } => {
                if strict {
                    self.gate_start(true, now);
                } else {
                    self.begin_emission(now);
                }
            }
            Phase::RunWait => self.advance(now),
            Phase::Burst => {
                if self.parts_mut().bus.dma_busy() {
                    // Spurious wakeup; the completion will re-enter.
                    return;
                }
                self.note_margin(now);
                self.advance(now);
            }
        }
    }

    /// True when a completion or deadline is pending but its interrupt has
    /// not run; used by barriers to make progress on polled hardware.
    fn service_poll(&mut self) -> bool {
        let fired = match self.phase {
            Phase::Burst => self.parts_mut().bus.poll_completion(),
            Phase::PacingDelay | Phase::StartLineWait { .. } | Phase::RunWait => {
                self.parts_mut().timer.poll_expired()
            }
            Phase::Idle => false,
        };
        if fired {
            let now = self.now();
            self.step(now);
        }
        fired
    }

    pub(crate) fn take_swapped(&mut self) -> bool {
        core::mem::take(&mut self.swapped)
    }
}

/// The shared, interrupt-reachable half of the driver.
///
/// The embedder places one cell per display in a `static` and routes the
/// serial peripheral's DMA-completion interrupt and the deadline timer's
/// interrupt into [`UploadCell::on_interrupt`]:
///
/// ```ignore
/// static UPLOAD: UploadCell<MyHw> = UploadCell::new();
///
/// #[interrupt]
/// fn DMA_CH0() {
///     UPLOAD.on_interrupt();
/// }
/// ```
pub struct UploadCell<HW: DisplayHw> {
    inner: Mutex<RefCell<Pipeline<HW>>>,
}

impl<HW: DisplayHw> UploadCell<HW> {
    pub const fn new() -> Self {
        UploadCell {
            inner: Mutex::new(RefCell::new(Pipeline::empty())),
        }
    }

    /// Resumes the upload state machine. Call from the DMA-completion
    /// interrupt and from the deadline-timer interrupt. Spurious calls are
    /// harmless.
    pub fn on_interrupt(&self) {
        critical_section::with(|cs| {
            let mut p = self.inner.borrow_ref_mut(cs);
            if p.active() {
                let now = p.now();
                p.step(now);
            }
        });
    }

    /// True while an asynchronous upload is in flight.
    pub fn active(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).active())
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Pipeline<HW>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Services a pending completion or expired deadline whose interrupt has
    /// not run. Returns true if the state machine advanced.
    pub(crate) fn service(&self) -> bool {
        critical_section::with(|cs| {
            let mut p = self.inner.borrow_ref_mut(cs);
            if p.active() {
                p.service_poll()
            } else {
                false
            }
        })
    }
}

impl<HW: DisplayHw> Default for UploadCell<HW> {
    fn default() -> Self {
        Self::new()
    }
}
