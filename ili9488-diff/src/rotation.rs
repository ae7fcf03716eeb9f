//! Rotation as a view over the logical framebuffer.
//!
//! The framebuffer is never re-laid-out and the panel is never switched out
//! of its native 320x480 addressing. Instead, each rotation is a scan-order
//! mapping from native panel positions to logical pixel indices, used by both
//! the diff builder and the pixel pusher. Keeping the panel in native
//! addressing means the scanline/tearing arithmetic is identical in all four
//! orientations.

use embedded_graphics::{
    prelude::{Point, Size},
    primitives::Rectangle,
};

use crate::{PANEL_HEIGHT, PANEL_PIXELS, PANEL_WIDTH};

/// Display orientation.
///
/// `Deg0`/`Deg180` are portrait (logical 320x480), `Deg90`/`Deg270` landscape
/// (logical 480x320).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Rotation {
    #[default]
    Deg0 = 0,
    Deg90 = 1,
    Deg180 = 2,
    Deg270 = 3,
}

impl Rotation {
    /// Maps `0..=3` to a rotation, anything else to `None`.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Rotation::Deg0),
            1 => Some(Rotation::Deg90),
            2 => Some(Rotation::Deg180),
            3 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Width of the logical framebuffer in this orientation.
    pub fn logical_width(self) -> u16 {
        match self {
            Rotation::Deg0 | Rotation::Deg180 => PANEL_WIDTH,
            Rotation::Deg90 | Rotation::Deg270 => PANEL_HEIGHT,
        }
    }

    /// Height of the logical framebuffer in this orientation.
    pub fn logical_height(self) -> u16 {
        match self {
            Rotation::Deg0 | Rotation::Deg180 => PANEL_HEIGHT,
            Rotation::Deg90 | Rotation::Deg270 => PANEL_WIDTH,
        }
    }

    /// Maps a logical pixel coordinate to its native panel coordinate.
    pub fn panel_point(self, p: Point) -> Point {
        let (lx, ly) = (p.x, p.y);
        match self {
            Rotation::Deg0 => Point::new(lx, ly),
            Rotation::Deg90 => Point::new(PANEL_WIDTH as i32 - 1 - ly, lx),
            Rotation::Deg180 => {
                Point::new(PANEL_WIDTH as i32 - 1 - lx, PANEL_HEIGHT as i32 - 1 - ly)
            }
            Rotation::Deg270 => Point::new(ly, PANEL_HEIGHT as i32 - 1 - lx),
        }
    }

    /// Maps a native panel coordinate back to the logical pixel coordinate.
    pub fn logical_point(self, p: Point) -> Point {
        let (px, py) = (p.x, p.y);
        match self {
            Rotation::Deg0 => Point::new(px, py),
            Rotation::Deg90 => Point::new(py, PANEL_WIDTH as i32 - 1 - px),
            Rotation::Deg180 => {
                Point::new(PANEL_WIDTH as i32 - 1 - px, PANEL_HEIGHT as i32 - 1 - py)
            }
            Rotation::Deg270 => Point::new(PANEL_HEIGHT as i32 - 1 - py, px),
        }
    }
}

/// Maps a rectangle in logical coordinates to the panel's native coordinate
/// system under the given rotation.
pub fn rotation_box(rotation: Rotation, rect: &Rectangle) -> Rectangle {
    if rect.size.width == 0 || rect.size.height == 0 {
        return Rectangle::zero();
    }
    let far = Point::new(
        rect.top_left.x + rect.size.width as i32 - 1,
        rect.top_left.y + rect.size.height as i32 - 1,
    );
    let a = rotation.panel_point(rect.top_left);
    let b = rotation.panel_point(far);
    let top_left = Point::new(a.x.min(b.x), a.y.min(b.y));
    let size = Size::new((a.x - b.x).unsigned_abs() + 1, (a.y - b.y).unsigned_abs() + 1);
    Rectangle::new(top_left, size)
}

/// Incremental walk of the logical framebuffer in native panel scan order.
///
/// For panel position `(px, py)` the logical linear index is
/// `base + py * row_step + px * col_step`; stepping a column or wrapping a
/// row is a single add.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ScanOrder {
    base: isize,
    row_step: isize,
    col_step: isize,
}

impl ScanOrder {
    pub(crate) fn new(rotation: Rotation) -> Self {
        let w = PANEL_WIDTH as isize;
        let h = PANEL_HEIGHT as isize;
        match rotation {
            Rotation::Deg0 => ScanOrder {
                base: 0,
                row_step: w,
                col_step: 1,
            },
            Rotation::Deg90 => ScanOrder {
                base: (w - 1) * h,
                row_step: 1,
                col_step: -h,
            },
            Rotation::Deg180 => ScanOrder {
                base: w * h - 1,
                row_step: -w,
                col_step: -1,
            },
            Rotation::Deg270 => ScanOrder {
                base: h - 1,
                row_step: -1,
                col_step: h,
            },
        }
    }

    /// Logical index of the first pixel of panel row `py`.
    pub(crate) fn row_start(&self, py: u16) -> isize {
        self.base + py as isize * self.row_step
    }

    pub(crate) fn col_step(&self) -> isize {
        self.col_step
    }

    /// Logical index for an absolute panel position.
    pub(crate) fn index(&self, px: u16, py: u16) -> usize {
        debug_assert!(px < PANEL_WIDTH && py < PANEL_HEIGHT);
        (self.row_start(py) + px as isize * self.col_step) as usize
    }
}

/// Cursor over the logical framebuffer following native panel scan order,
/// starting from an arbitrary panel-linear position.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ScanCursor {
    order: ScanOrder,
    px: u16,
    py: u16,
    idx: isize,
}

impl ScanCursor {
    pub(crate) fn new(rotation: Rotation, panel_linear: usize) -> Self {
        debug_assert!(panel_linear < PANEL_PIXELS);
        let order = ScanOrder::new(rotation);
        let px = (panel_linear % PANEL_WIDTH as usize) as u16;
        let py = (panel_linear / PANEL_WIDTH as usize) as u16;
        ScanCursor {
            order,
            px,
            py,
            idx: order.row_start(py) + px as isize * order.col_step(),
        }
    }

    pub(crate) fn logical(&self) -> usize {
        self.idx as usize
    }

    /// Panel row currently under the cursor.
    pub(crate) fn row(&self) -> u16 {
        self.py
    }

    /// Panel column currently under the cursor.
    pub(crate) fn col(&self) -> u16 {
        self.px
    }

    pub(crate) fn step(&mut self) {
        self.px += 1;
        if self.px == PANEL_WIDTH {
            self.px = 0;
            self.py += 1;
            if self.py == PANEL_HEIGHT {
                // One past the frame; only valid to drop from here.
                return;
            }
            self.idx = self.order.row_start(self.py);
        } else {
            self.idx += self.order.col_step();
        }
    }
}

/// Copies a rectangle of `src` (row stride `stride`, first pixel at the
/// rectangle's origin) into the logical framebuffer `dst`.
///
/// This writes exactly the pixels that a copying diff computation over the
/// same rectangle would write.
pub fn copy_rect(
    dst: &mut [u16],
    rotation: Rotation,
    rect: &Rectangle,
    src: &[u16],
    stride: usize,
) {
    let w = rotation.logical_width() as usize;
    let x0 = rect.top_left.x.max(0) as usize;
    let y0 = rect.top_left.y.max(0) as usize;
    let rw = rect.size.width as usize;
    let rh = rect.size.height as usize;
    for row in 0..rh {
        let d = (y0 + row) * w + x0;
        let s = row * stride;
        dst[d..d + rw].copy_from_slice(&src[s..s + rw]);
    }
}
