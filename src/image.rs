use crate::frame::{Frame, HEIGHT, WIDTH};
use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    /// Fill from the luma channel of a frame, reusing the allocation.
    pub fn fill_from_luma(&mut self, frame: &Frame) {
        self.data.clear();
        self.data.extend(frame.pixels.iter().map(|p| p.luma));
        self.width = WIDTH;
        self.height = HEIGHT;
    }

    pub fn from_luma(frame: &Frame) -> Image {
        let mut image = Image::empty();
        image.fill_from_luma(frame);
        image
    }

    pub fn contains(&self, p: Vector2d) -> bool {
        p.x >= 0. && p.y >= 0. && p.x <= (self.width - 1) as f64 && p.y <= (self.height - 1) as f64
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Pixel value with coordinates clamped into the image.
    #[inline(always)]
    pub fn value_clamped(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1);
        let y = y.clamp(0, self.height as i32 - 1);
        self.data[y as usize * self.width + x as usize]
    }
}

/// Bilinear interpolation, clamping at the borders.
pub fn bilinear(image: &Image, p: Vector2d) -> f64 {
    let x0 = p.x.floor();
    let y0 = p.y.floor();
    let ax = p.x - x0;
    let ay = p.y - y0;
    let (x0, y0) = (x0 as i32, y0 as i32);
    let v = |x, y| image.value_clamped(x, y) as f64;
    (1. - ay) * ((1. - ax) * v(x0, y0) + ax * v(x0 + 1, y0))
        + ay * ((1. - ax) * v(x0, y0 + 1) + ax * v(x0 + 1, y0 + 1))
}
