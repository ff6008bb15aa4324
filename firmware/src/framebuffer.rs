//! RGB888 framebuffer for the LED matrix
//!
//! Holds the panel image as packed RGB888 (3 bytes per pixel, row-major).
//! Boards whose matrix driver scans out of a memory buffer can hand
//! [`Framebuffer::as_slice`] straight to the DMA engine.

use embedded_graphics_core::geometry::Size;

use crate::display::{placement, scale_channel, MatrixDisplay};

/// Default panel width (HUB75 64x32)
pub const WIDTH: u32 = 64;
/// Default panel height
pub const HEIGHT: u32 = 32;

/// In-memory matrix image
pub struct Framebuffer {
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    brightness: u8,
    frames_drawn: u32,
}

impl Framebuffer {
    /// Create a framebuffer initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0; (width * height * 3) as usize],
            brightness: 100,
            frames_drawn: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Get the raw buffer slice for sending to the panel
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Colour at (x, y), black outside the panel
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0; 3];
        }
        let i = ((y * self.width + x) * 3) as usize;
        [self.buffer[i], self.buffer[i + 1], self.buffer[i + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = ((y * self.width + x) * 3) as usize;
        self.buffer[i..i + 3].copy_from_slice(&rgb);
    }

    /// Whether every pixel is black
    pub fn is_blank(&self) -> bool {
        self.buffer.iter().all(|b| *b == 0)
    }

    /// Number of frames drawn since creation
    pub fn frames_drawn(&self) -> u32 {
        self.frames_drawn
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new(WIDTH, HEIGHT)
    }
}

impl MatrixDisplay for Framebuffer {
    fn draw_frame(&mut self, rgb: &[u8], width: u32, height: u32) {
        if rgb.len() < (width * height * 3) as usize {
            return;
        }

        self.buffer.fill(0);
        let (origin, size) = placement(Size::new(self.width, self.height), width, height);
        for y in 0..size.height {
            for x in 0..size.width {
                let i = ((y * width + x) * 3) as usize;
                let px = [
                    scale_channel(rgb[i], self.brightness),
                    scale_channel(rgb[i + 1], self.brightness),
                    scale_channel(rgb[i + 2], self.brightness),
                ];
                self.set_pixel(origin.x as u32 + x, origin.y as u32 + y, px);
            }
        }
        self.frames_drawn += 1;
    }

    fn clear(&mut self) {
        self.buffer.fill(0);
    }

    fn set_brightness(&mut self, percent: u8) {
        self.brightness = percent.min(100);
    }
}
