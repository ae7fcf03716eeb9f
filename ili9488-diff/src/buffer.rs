use core::convert::Infallible;

use embedded_graphics::{
    pixelcolor::{raw::RawU16, Rgb565},
    prelude::{Dimensions, DrawTarget, Point, RawData, Size},
    primitives::Rectangle,
    Pixel,
};

use crate::rotation::Rotation;

/// A caller-owned RGB565 framebuffer in the logical orientation.
///
/// This is a drawing convenience over the plain `&mut [u16]` the driver
/// consumes: it implements [`DrawTarget`] so frames can be produced with
/// `embedded-graphics`, and hands the raw words back out for
/// [`crate::Ili9488::update`].
pub struct Framebuffer<'a> {
    size: Size,
    data: &'a mut [u16],
}

impl<'a> Framebuffer<'a> {
    /// Wraps `data` as a framebuffer with the logical dimensions of
    /// `rotation`.
    ///
    /// Panics if `data` does not hold exactly one full frame.
    pub fn new(data: &'a mut [u16], rotation: Rotation) -> Self {
        let size = Size::new(
            rotation.logical_width() as u32,
            rotation.logical_height() as u32,
        );
        assert_eq!(
            data.len(),
            (size.width * size.height) as usize,
            "framebuffer length must match the logical dimensions"
        );
        Framebuffer { size, data }
    }

    /// The raw pixel words, scanline-major in the logical orientation.
    pub fn data(&self) -> &[u16] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u16] {
        self.data
    }

    /// Sets every pixel to `color`.
    pub fn fill(&mut self, color: Rgb565) {
        let raw = RawU16::from(color).into_inner();
        self.data.fill(raw);
    }
}

impl Dimensions for Framebuffer<'_> {
    fn bounding_box(&self) -> Rectangle {
        Rectangle::new(Point::zero(), self.size)
    }
}

impl DrawTarget for Framebuffer<'_> {
    type Color = Rgb565;

    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let width = self.size.width as i32;
        for Pixel(point, color) in pixels.into_iter() {
            if point.x < 0
                || point.x >= width
                || point.y < 0
                || point.y >= self.size.height as i32
            {
                continue; // Skip out-of-bounds pixels
            }
            self.data[(point.y * width + point.x) as usize] = RawU16::from(color).into_inner();
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Rgb565) -> Result<(), Self::Error> {
        let drawable = self.bounding_box().intersection(area);
        if drawable.size.width == 0 || drawable.size.height == 0 {
            return Ok(()); // Nothing to fill
        }
        let raw = RawU16::from(color).into_inner();
        let width = self.size.width as usize;
        let x0 = drawable.top_left.x as usize;
        let y0 = drawable.top_left.y as usize;
        for row in 0..drawable.size.height as usize {
            let start = (y0 + row) * width + x0;
            self.data[start..start + drawable.size.width as usize].fill(raw);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::pixelcolor::RgbColor;
    use std::vec;

    #[test]
    fn draw_iter_sets_words() {
        let mut data = vec![0u16; 320 * 480];
        let mut fb = Framebuffer::new(&mut data, Rotation::Deg0);
        fb.draw_iter([
            Pixel(Point::new(0, 0), Rgb565::RED),
            Pixel(Point::new(100, 200), Rgb565::WHITE),
        ])
        .unwrap();
        assert_eq!(fb.data()[0], 0xF800);
        assert_eq!(fb.data()[200 * 320 + 100], 0xFFFF);
    }

    #[test]
    fn draw_iter_skips_out_of_bounds() {
        let mut data = vec![0u16; 480 * 320];
        let mut fb = Framebuffer::new(&mut data, Rotation::Deg90);
        let before = fb.data().to_vec();
        fb.draw_iter([
            Pixel(Point::new(-1, 0), Rgb565::RED),
            Pixel(Point::new(480, 0), Rgb565::RED),
            Pixel(Point::new(0, 320), Rgb565::RED),
        ])
        .unwrap();
        assert_eq!(fb.data(), &before[..]);
    }

    #[test]
    fn fill_solid_clips_to_bounds() {
        let mut data = vec![0u16; 320 * 480];
        let mut fb = Framebuffer::new(&mut data, Rotation::Deg0);
        fb.fill_solid(
            &Rectangle::new(Point::new(318, 478), Size::new(8, 8)),
            Rgb565::BLUE,
        )
        .unwrap();
        assert_eq!(fb.data()[478 * 320 + 318], 0x001F);
        assert_eq!(fb.data()[479 * 320 + 319], 0x001F);
        assert_eq!(fb.data()[478 * 320 + 317], 0);
    }

    #[test]
    #[should_panic]
    fn wrong_length_is_rejected() {
        let mut data = vec![0u16; 16];
        let _ = Framebuffer::new(&mut data, Rotation::Deg0);
    }
}
