use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::feature::Point;

pub const WIDTH: usize = 320;
pub const HEIGHT: usize = 240;
pub const FPS: u32 = 187;
pub const PIXEL_COUNT: usize = WIDTH * HEIGHT;

pub const MAX_TRACKING_POINTS: usize = 4 * 1024;

/// Luminance + RGB, laid out as `r, g, b, luma`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Pixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub luma: u8,
}

impl Pixel {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        // BT.601 weights in 8 bit fixed point
        let luma = (77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8;
        Pixel {
            r,
            g,
            b,
            luma: luma as u8,
        }
    }

    pub fn gray(value: u8) -> Self {
        Pixel {
            r: value,
            g: value,
            b: value,
            luma: value,
        }
    }

    /// Squared RGB distance between two pixels.
    pub fn distance2(&self, other: &Pixel) -> u32 {
        let d = |a: u8, b: u8| (a as i32 - b as i32).pow(2) as u32;
        d(self.r, other.r) + d(self.g, other.g) + d(self.b, other.b)
    }
}

/// One ring slot: a captured image and the points tracked on it.
///
/// Size: 405520 bytes
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Frame {
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub num_points: u32,
    _reserved: u32,
    pub pixels: [Pixel; PIXEL_COUNT],
    pub points: [Point; MAX_TRACKING_POINTS],
}

impl Frame {
    /// A zeroed frame on the heap; frames are too large for the stack.
    pub fn boxed() -> Box<Frame> {
        bytemuck::allocation::zeroed_box()
    }

    /// Prepare the slot for a new capture. Pixels are left for the
    /// capture device to overwrite.
    pub fn reset(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
        self.num_points = 0;
    }

    /// The live points, clamped to capacity for corrupted counts.
    pub fn points(&self) -> &[Point] {
        let n = usize::min(self.num_points as usize, MAX_TRACKING_POINTS);
        &self.points[..n]
    }

    pub fn is_full(&self) -> bool {
        self.num_points as usize >= MAX_TRACKING_POINTS
    }

    /// Append a point, returning false when the frame is at capacity.
    pub fn push_point(&mut self, point: Point) -> bool {
        if self.is_full() {
            return false;
        }
        self.points[self.num_points as usize] = point;
        self.num_points += 1;
        true
    }

    #[inline(always)]
    pub fn pixel(&self, x: usize, y: usize) -> Pixel {
        self.pixels[y * WIDTH + x]
    }

    pub fn mean_luma(&self) -> f64 {
        let sum: u64 = self.pixels.iter().map(|p| p.luma as u64).sum();
        sum as f64 / PIXEL_COUNT as f64
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("num_points", &self.num_points)
            .finish_non_exhaustive()
    }
}
