//! Matrix display surface
//!
//! The hardware driver (DMA, row scanning) is supplied by the board. The
//! core only needs to push a decoded RGB888 frame, blank the panel and
//! set the brightness, all of which are expected to return promptly.

use embedded_graphics_core::draw_target::DrawTarget;
use embedded_graphics_core::geometry::{Point, Size};
use embedded_graphics_core::pixelcolor::Rgb888;
use embedded_graphics_core::primitives::Rectangle;
use log::warn;

/// Display collaborator driven by the playback engine
pub trait MatrixDisplay {
    /// Draw a packed RGB888 frame of `width` x `height` pixels
    fn draw_frame(&mut self, rgb: &[u8], width: u32, height: u32);

    /// Blank the panel
    fn clear(&mut self);

    /// Brightness percentage (0-100)
    fn set_brightness(&mut self, percent: u8);
}

/// Scale a colour channel by a brightness percentage
#[inline]
pub fn scale_channel(value: u8, percent: u8) -> u8 {
    (value as u16 * percent.min(100) as u16 / 100) as u8
}

/// Placement of a `width` x `height` frame on a `size` panel: centred, cropped to fit
pub(crate) fn placement(size: Size, width: u32, height: u32) -> (Point, Size) {
    let w = width.min(size.width);
    let h = height.min(size.height);
    let origin = Point::new(((size.width - w) / 2) as i32, ((size.height - h) / 2) as i32);
    (origin, Size::new(w, h))
}

/// [`MatrixDisplay`] over any embedded-graphics RGB888 draw target
pub struct DrawTargetDisplay<D> {
    target: D,
    brightness: u8,
}

impl<D> DrawTargetDisplay<D>
where
    D: DrawTarget<Color = Rgb888>,
{
    pub fn new(target: D) -> Self {
        Self {
            target,
            brightness: 100,
        }
    }

    pub fn target(&self) -> &D {
        &self.target
    }

    pub fn into_inner(self) -> D {
        self.target
    }
}

impl<D> MatrixDisplay for DrawTargetDisplay<D>
where
    D: DrawTarget<Color = Rgb888>,
{
    fn draw_frame(&mut self, rgb: &[u8], width: u32, height: u32) {
        if rgb.len() < (width * height * 3) as usize {
            warn!("Frame buffer too short for {}x{}", width, height);
            return;
        }

        let bounds = self.target.bounding_box();
        let (origin, size) = placement(bounds.size, width, height);
        let area = Rectangle::new(bounds.top_left + origin, size);
        let brightness = self.brightness;

        let colors = (0..size.height).flat_map(move |y| {
            (0..size.width).map(move |x| {
                let i = ((y * width + x) * 3) as usize;
                Rgb888::new(
                    scale_channel(rgb[i], brightness),
                    scale_channel(rgb[i + 1], brightness),
                    scale_channel(rgb[i + 2], brightness),
                )
            })
        });

        if self.target.fill_contiguous(&area, colors).is_err() {
            warn!("Matrix draw failed");
        }
    }

    fn clear(&mut self) {
        if self.target.clear(Rgb888::new(0, 0, 0)).is_err() {
            warn!("Matrix clear failed");
        }
    }

    fn set_brightness(&mut self, percent: u8) {
        self.brightness = percent.min(100);
    }
}
