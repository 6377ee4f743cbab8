//! Minimal owned RGB raster; the unit exchanged with frame sources and sinks.

use crate::palette::Rgb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width:  u32,
    height: u32,
    /// Packed RGB, row-major.
    pixels: Vec<u8>,
}

impl Raster {
    /// A black raster.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, pixels: vec![0u8; width as usize * height as usize * 3] }
    }

    /// Wrap packed RGB data.  Returns `None` if the length does not match.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self { width, height, pixels })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_rgb(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_rgb(self) -> Vec<u8> {
        self.pixels
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Rgb {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, c: Rgb) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.pixels[i..i + 3].copy_from_slice(&c);
    }

    /// Fill the rectangle `[x0, x1) × [y0, y1)`, clipped to the raster.
    pub fn fill_rect(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, c: Rgb) {
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        for y in y0..y1 {
            for x in x0..x1 {
                self.set_pixel(x, y, c);
            }
        }
    }

    /// Channel-wise mean over `[x0, x1) × [y0, y1)`.
    pub fn mean(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Rgb {
        let x1 = x1.min(self.width).max(x0 + 1).min(self.width);
        let y1 = y1.min(self.height).max(y0 + 1).min(self.height);
        let mut sum = [0u64; 3];
        let mut n = 0u64;
        for y in y0..y1 {
            for x in x0..x1 {
                let p = self.pixel(x, y);
                sum[0] += p[0] as u64;
                sum[1] += p[1] as u64;
                sum[2] += p[2] as u64;
                n += 1;
            }
        }
        if n == 0 {
            return self.pixel(x0.min(self.width - 1), y0.min(self.height - 1));
        }
        [
            ((sum[0] + n / 2) / n) as u8,
            ((sum[1] + n / 2) / n) as u8,
            ((sum[2] + n / 2) / n) as u8,
        ]
    }
}
