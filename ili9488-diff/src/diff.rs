//! Run-length diff between two framebuffers.
//!
//! A [`DiffBuf`] holds an ordered stream of (skip, write) pairs over the
//! panel's native scan order: skip `n` unchanged pixels, then transmit `n`
//! changed ones. Counts are variable-length encoded so that typical deltas
//! cost one byte each; a write length of zero terminates the stream.
//!
//! Ordinary write runs never cross a scanline, so each one can be addressed
//! with a window whose start column is the run's `x`. The dummy diff and the
//! overflow fallback are the two exceptions: they emit a full-width run
//! starting at column zero, which wraps safely because the write window then
//! spans the whole panel.

use crate::rotation::{rotation_box, Rotation, ScanOrder};
use crate::{PANEL_HEIGHT, PANEL_PIXELS, PANEL_WIDTH};
use embedded_graphics::primitives::Rectangle;

/// Smallest usable diff buffer: headroom for the overflow fallback plus the
/// terminator.
pub const MIN_DIFF_BUF_LEN: usize = 32;

/// Space kept free at the tail of the buffer so that the overflow fallback
/// (two maximal pairs and a terminator) always fits.
const TAIL_RESERVE: usize = 22;

/// One decoded instruction from a diff stream.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiffOp {
    /// Transmit `len` pixels starting at panel position `(x, y)`.
    Run { x: u16, y: u16, len: u32 },
    /// The next run starts on panel row `row`, which is beyond the allowed
    /// row; nothing was consumed.
    Wait { row: u16 },
    /// End of stream.
    Done,
}

/// A compact, embedder-allocated encoding of the pixels that differ between
/// two framebuffers under a rotation, merge gap and compare mask.
pub struct DiffBuf<'b> {
    buf: &'b mut [u8],
    len: usize,
    overflow: bool,
}

impl<'b> DiffBuf<'b> {
    /// Wraps `storage` as a diff buffer. Larger buffers hold finer diffs;
    /// when a diff does not fit, the remainder is replaced by a conservative
    /// full-tail write (see [`DiffBuf::overflowed`]).
    ///
    /// Panics if `storage` is smaller than [`MIN_DIFF_BUF_LEN`].
    pub fn new(storage: &'b mut [u8]) -> Self {
        assert!(
            storage.len() >= MIN_DIFF_BUF_LEN,
            "diff buffer must hold at least {} bytes",
            MIN_DIFF_BUF_LEN
        );
        DiffBuf {
            buf: storage,
            len: 0,
            overflow: false,
        }
    }

    /// Encoded length of the current stream in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 || matches!(self.reader().next(NO_GATE), DiffOp::Done)
    }

    /// True when the last computation did not fit and the tail of the frame
    /// was replaced by a single conservative write.
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Starts reading the stream from the beginning.
    pub fn reader(&self) -> DiffReader<'_> {
        DiffReader::over(&self.buf[..self.len])
    }

    pub(crate) fn as_raw(&self) -> (*const u8, usize) {
        (self.buf.as_ptr(), self.len)
    }

    /// Encodes a full-frame write: a single run covering the whole panel.
    /// Used to drive a full redraw through the same upload machinery.
    pub fn make_dummy(&mut self) {
        let mut enc = Encoder::over(self.buf);
        enc.pair_unchecked(0, PANEL_PIXELS as u32);
        enc.terminate();
        self.len = enc.pos;
        self.overflow = false;
    }

    /// Computes the diff of `new` against `old` without touching either.
    pub fn compute(
        &mut self,
        old: &[u16],
        new: &[u16],
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) {
        self.compute_core(|i, _| old[i], new, rotation, gap, mask, false);
    }

    /// Computes the diff of `new` against `old`, updating `old` in place so
    /// that it equals `new` afterwards and can serve as the next mirror.
    pub fn compute_copy(
        &mut self,
        old: &mut [u16],
        new: &[u16],
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) {
        self.compute_core(
            |i, n| {
                let o = old[i];
                old[i] = n;
                o
            },
            new,
            rotation,
            gap,
            mask,
            true,
        );
    }

    /// Computes the diff of `new` against `old` while copying `new` into a
    /// third buffer `stage`. Used to stage a frame while `old` is still being
    /// transmitted.
    pub fn compute_stage(
        &mut self,
        old: &[u16],
        stage: &mut [u16],
        new: &[u16],
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) {
        self.compute_core(
            |i, n| {
                stage[i] = n;
                old[i]
            },
            new,
            rotation,
            gap,
            mask,
            true,
        );
    }

    fn compute_core<F>(
        &mut self,
        mut old_at: F,
        new: &[u16],
        rotation: Rotation,
        gap: u16,
        mask: u16,
        copying: bool,
    ) where
        F: FnMut(usize, u16) -> u16,
    {
        debug_assert_eq!(new.len(), PANEL_PIXELS);
        let order = ScanOrder::new(rotation);
        let keep = !mask;
        let gap = gap as u32;

        let mut enc = Encoder::over(self.buf);
        let mut st = RunState::new();
        let mut done = false;

        'rows: for py in 0..PANEL_HEIGHT {
            let mut idx = order.row_start(py);
            for px in 0..PANEL_WIDTH {
                let linear = py as u32 * PANEL_WIDTH as u32 + px as u32;
                let n = new[idx as usize];
                let o = old_at(idx as usize, n);
                let changed = (o ^ n) & keep != 0;
                if !st.pixel(&mut enc, linear, changed, gap) {
                    // Out of space: the tail of the frame becomes one
                    // conservative write. Finish the copy if one is underway.
                    emit_overflow_tail(&mut enc, st.run_start);
                    self.overflow = true;
                    if copying {
                        finish_copy(&mut old_at, new, &order, px, py);
                    }
                    done = true;
                    break 'rows;
                }
                idx += order.col_step();
            }
            if !st.row_end(&mut enc) {
                emit_overflow_tail(&mut enc, st.run_start);
                self.overflow = true;
                if copying && py + 1 < PANEL_HEIGHT {
                    finish_copy(&mut old_at, new, &order, 0, py + 1);
                }
                done = true;
                break;
            }
        }
        if !done {
            enc.terminate();
            self.overflow = false;
        }
        self.len = enc.pos;
    }

    /// Computes a diff restricted to `rect` (logical coordinates): pixels
    /// outside the rectangle are treated as unchanged. `new` holds only the
    /// rectangle, row stride `stride`, first pixel at the rectangle origin.
    pub fn compute_region(
        &mut self,
        old: &[u16],
        new: &[u16],
        stride: usize,
        rect: &Rectangle,
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) {
        self.region_core(|i, _| old[i], new, stride, rect, rotation, gap, mask);
    }

    /// Region variant of [`DiffBuf::compute_copy`].
    pub fn compute_region_copy(
        &mut self,
        old: &mut [u16],
        new: &[u16],
        stride: usize,
        rect: &Rectangle,
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) {
        self.region_core(
            |i, n| {
                let o = old[i];
                old[i] = n;
                o
            },
            new,
            stride,
            rect,
            rotation,
            gap,
            mask,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn region_core<F>(
        &mut self,
        mut old_at: F,
        new: &[u16],
        stride: usize,
        rect: &Rectangle,
        rotation: Rotation,
        gap: u16,
        mask: u16,
    ) where
        F: FnMut(usize, u16) -> u16,
    {
        let panel = rotation_box(rotation, rect);
        let keep = !mask;
        let gap = gap as u32;
        let lw = rotation.logical_width() as i32;

        let mut enc = Encoder::over(self.buf);
        let mut st = RunState::new();
        let mut overflowed = false;

        let bx0 = panel.top_left.x as u16;
        let by0 = panel.top_left.y as u16;
        let bx1 = bx0 + panel.size.width as u16;
        let by1 = by0 + panel.size.height as u16;

        'rows: for py in by0..by1 {
            for px in bx0..bx1 {
                let logical = rotation.logical_point(
                    embedded_graphics::prelude::Point::new(px as i32, py as i32),
                );
                let rel_x = logical.x - rect.top_left.x;
                let rel_y = logical.y - rect.top_left.y;
                let n = new[rel_y as usize * stride + rel_x as usize];
                let old_idx = (logical.y * lw + logical.x) as usize;
                let o = old_at(old_idx, n);
                let changed = (o ^ n) & keep != 0;
                let linear = py as u32 * PANEL_WIDTH as u32 + px as u32;
                if !st.pixel_at(&mut enc, linear, changed, gap) {
                    emit_overflow_tail(&mut enc, st.run_start);
                    overflowed = true;
                    break 'rows;
                }
            }
            if !st.row_end(&mut enc) {
                emit_overflow_tail(&mut enc, st.run_start);
                overflowed = true;
                break;
            }
        }
        if !overflowed {
            enc.terminate();
        }
        self.overflow = overflowed;
        self.len = enc.pos;
    }
}

/// Shared encoder state machine for the pixel walks.
struct RunState {
    /// Panel-linear position one past the last pixel accounted for.
    cursor: u32,
    /// Unchanged pixels since the last emitted run.
    pending_skip: u32,
    writing: bool,
    run_start: u32,
    run_len: u32,
    /// Unchanged pixels accumulated inside an open run.
    run_gap: u32,
}

impl RunState {
    fn new() -> Self {
        RunState {
            cursor: 0,
            pending_skip: 0,
            writing: false,
            run_start: 0,
            run_len: 0,
            run_gap: 0,
        }
    }

    /// Feeds the next pixel in strictly increasing linear order.
    fn pixel(&mut self, enc: &mut Encoder<'_>, linear: u32, changed: bool, gap: u32) -> bool {
        debug_assert_eq!(linear, self.cursor);
        self.pixel_at(enc, linear, changed, gap)
    }

    /// Feeds a pixel at an arbitrary linear position; intervening pixels are
    /// treated as unchanged (region walks).
    fn pixel_at(&mut self, enc: &mut Encoder<'_>, linear: u32, changed: bool, gap: u32) -> bool {
        let jumped = linear - self.cursor;
        if jumped > 0 {
            if !self.unchanged_by(enc, jumped, gap) {
                return false;
            }
        }
        self.cursor = linear + 1;
        if changed {
            if self.writing {
                self.run_len += self.run_gap + 1;
                self.run_gap = 0;
            } else {
                self.writing = true;
                self.run_start = linear;
                self.run_len = 1;
                self.run_gap = 0;
            }
            true
        } else {
            self.unchanged_by(enc, 1, gap)
        }
    }

    fn unchanged_by(&mut self, enc: &mut Encoder<'_>, count: u32, gap: u32) -> bool {
        if self.writing {
            self.run_gap += count;
            if self.run_gap > gap {
                if !enc.try_pair(self.pending_skip, self.run_len) {
                    return false;
                }
                self.pending_skip = self.run_gap;
                self.writing = false;
                self.run_gap = 0;
            }
        } else {
            self.pending_skip += count;
        }
        true
    }

    /// Closes any open run at a scanline boundary.
    fn row_end(&mut self, enc: &mut Encoder<'_>) -> bool {
        if self.writing {
            if !enc.try_pair(self.pending_skip, self.run_len) {
                return false;
            }
            self.pending_skip = self.run_gap;
            self.writing = false;
            self.run_gap = 0;
        }
        true
    }
}

/// Emits the conservative overflow tail: everything from `start` to the end
/// of the frame as at most two wrap-safe writes. Space for this is reserved
/// by [`Encoder::try_pair`].
fn emit_overflow_tail(enc: &mut Encoder<'_>, start: u32) {
    let sx = start % PANEL_WIDTH as u32;
    let sy = start / PANEL_WIDTH as u32;
    // Skip from wherever the encoder's stream currently ends up to `start`.
    let emitted: u32 = enc.emitted_pixels;
    let skip = start - emitted;
    if sx == 0 {
        enc.pair_unchecked(skip, (PANEL_HEIGHT as u32 - sy) * PANEL_WIDTH as u32);
    } else {
        enc.pair_unchecked(skip, PANEL_WIDTH as u32 - sx);
        if sy + 1 < PANEL_HEIGHT as u32 {
            enc.pair_unchecked(0, (PANEL_HEIGHT as u32 - sy - 1) * PANEL_WIDTH as u32);
        }
    }
    enc.terminate();
}

/// Completes the copy side of a copying computation after an overflow, from
/// panel position `(px, py)` inclusive to the end of the frame.
fn finish_copy<F>(old_at: &mut F, new: &[u16], order: &ScanOrder, px: u16, py: u16)
where
    F: FnMut(usize, u16) -> u16,
{
    let mut py = py;
    let mut px = px;
    while py < PANEL_HEIGHT {
        let mut idx = order.row_start(py) + px as isize * order.col_step();
        while px < PANEL_WIDTH {
            let i = idx as usize;
            old_at(i, new[i]);
            idx += order.col_step();
            px += 1;
        }
        px = 0;
        py += 1;
    }
}

struct Encoder<'a> {
    out: &'a mut [u8],
    pos: usize,
    /// Pixels covered by pairs emitted so far (skips plus writes).
    emitted_pixels: u32,
}

impl<'a> Encoder<'a> {
    fn over(out: &'a mut [u8]) -> Self {
        Encoder {
            out,
            pos: 0,
            emitted_pixels: 0,
        }
    }

    fn varint_len(n: u32) -> usize {
        if n < 0xFE {
            1
        } else if n <= 0xFFFF {
            3
        } else {
            5
        }
    }

    fn put_varint(&mut self, n: u32) {
        if n < 0xFE {
            self.out[self.pos] = n as u8;
            self.pos += 1;
        } else if n <= 0xFFFF {
            self.out[self.pos] = 0xFE;
            self.out[self.pos + 1..self.pos + 3].copy_from_slice(&(n as u16).to_le_bytes());
            self.pos += 3;
        } else {
            self.out[self.pos] = 0xFF;
            self.out[self.pos + 1..self.pos + 5].copy_from_slice(&n.to_le_bytes());
            self.pos += 5;
        }
    }

    /// Appends a (skip, write) pair if it fits outside the reserved tail.
    fn try_pair(&mut self, skip: u32, write: u32) -> bool {
        let need = Self::varint_len(skip) + Self::varint_len(write);
        if self.pos + need + TAIL_RESERVE > self.out.len() {
            return false;
        }
        self.pair_unchecked(skip, write);
        true
    }

    fn pair_unchecked(&mut self, skip: u32, write: u32) {
        self.put_varint(skip);
        self.put_varint(write);
        self.emitted_pixels += skip + write;
    }

    fn terminate(&mut self) {
        self.put_varint(0);
        self.put_varint(0);
    }
}

/// Allowed-row value that never gates a run.
pub(crate) const NO_GATE: u16 = PANEL_HEIGHT - 1;

/// Linear reader over an encoded diff stream.
#[derive(Debug, Clone)]
pub struct DiffReader<'r> {
    data: &'r [u8],
    pos: usize,
    linear: u32,
    pending: Option<(u32, u32)>,
    done: bool,
}

impl<'r> DiffReader<'r> {
    pub(crate) fn over(data: &'r [u8]) -> Self {
        DiffReader {
            data,
            pos: 0,
            linear: 0,
            pending: None,
            done: false,
        }
    }

    /// Reconstructs a reader over raw parts handed to the upload pipeline.
    ///
    /// # Safety
    ///
    /// The bytes must stay valid and unmodified for the reader's lifetime;
    /// the buffering policy guarantees this while an upload is in flight.
    pub(crate) unsafe fn from_raw(ptr: *const u8, len: usize) -> DiffReader<'static> {
        DiffReader::over(core::slice::from_raw_parts(ptr, len))
    }

    fn take_varint(&mut self) -> u32 {
        let b = self.data[self.pos];
        if b < 0xFE {
            self.pos += 1;
            b as u32
        } else if b == 0xFE {
            let v = u16::from_le_bytes([self.data[self.pos + 1], self.data[self.pos + 2]]);
            self.pos += 3;
            v as u32
        } else {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.data[self.pos + 1..self.pos + 5]);
            self.pos += 5;
            u32::from_le_bytes(raw)
        }
    }

    /// Panel row of the next run without consuming it, or `None` at the end
    /// of the stream. The scheduler uses this to pick the start scanline.
    pub(crate) fn peek_row(&mut self) -> Option<u16> {
        match self.next(0) {
            DiffOp::Run { y: 0, x, len } => {
                // A row-0 run is consumed by the probe; put it back.
                self.pending = Some((x as u32, len));
                Some(0)
            }
            DiffOp::Wait { row } => Some(row),
            DiffOp::Done => None,
            DiffOp::Run { .. } => unreachable!("next(0) only yields row-0 runs"),
        }
    }

    /// Yields the next run, but only once its starting panel row is at or
    /// before `allowed_row`; otherwise reports the required row and consumes
    /// nothing.
    pub fn next(&mut self, allowed_row: u16) -> DiffOp {
        if self.done {
            return DiffOp::Done;
        }
        if self.pending.is_none() {
            if self.pos >= self.data.len() {
                self.done = true;
                return DiffOp::Done;
            }
            let skip = self.take_varint();
            let write = self.take_varint();
            if write == 0 {
                self.done = true;
                return DiffOp::Done;
            }
            self.linear += skip;
            self.pending = Some((self.linear, write));
            self.linear += write;
        }
        let (start, len) = self.pending.unwrap();
        let y = (start / PANEL_WIDTH as u32) as u16;
        if y > allowed_row {
            return DiffOp::Wait { row: y };
        }
        self.pending = None;
        DiffOp::Run {
            x: (start % PANEL_WIDTH as u32) as u16,
            y,
            len,
        }
    }
}
