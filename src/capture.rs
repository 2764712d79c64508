use log::{info, warn};
use ndarray as nd;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{Error, Result};
use crate::frame::{Pixel, HEIGHT, PIXEL_COUNT, WIDTH};
use crate::params::{CameraParam, PARAM_COUNT};

/// A source of frames with adjustable registers.
pub trait CaptureDevice {
    /// Block until the next frame is available and write it, row-major,
    /// into `pixels` (exactly `WIDTH * HEIGHT` entries).
    fn read_frame(&mut self, pixels: &mut [Pixel]) -> Result<()>;

    /// The live value of a register.
    fn param(&self, param: CameraParam) -> Result<u8>;

    /// Request a register value. Returns the value the device accepted,
    /// which may differ from the request.
    fn set_param(&mut self, param: CameraParam, value: u8) -> Result<u8>;

    fn is_alive(&self) -> bool;
}

pub(crate) fn check_geometry(pixels: &[Pixel]) -> Result<()> {
    if pixels.len() != PIXEL_COUNT {
        return Err(Error::precondition(format!(
            "capture buffer holds {} pixels, expected {}",
            pixels.len(),
            PIXEL_COUNT
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct Square {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
    size: usize,
    color: Pixel,
}

/// Generated scene: a fixed noisy background with checkered squares
/// drifting over it at constant velocity.
///
/// Registers start at zero and are clamped to each parameter's range. The
/// flip registers mirror the output.
pub struct SyntheticCamera {
    registers: [u8; PARAM_COUNT],
    background: Vec<Pixel>,
    squares: Vec<Square>,
    frame_index: u64,
    lifetime: Option<u64>,
}

impl SyntheticCamera {
    pub fn new(seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let background = (0..PIXEL_COUNT)
            .map(|i| {
                // low contrast gradient plus noise
                let (x, y) = (i % WIDTH, i / WIDTH);
                let base = 40 + (x / 8 + y / 8) as u8 % 24;
                let noise: u8 = rng.gen_range(0..12);
                Pixel::gray(base + noise)
            })
            .collect();
        let mut speed = |min: f32, max: f32| {
            let sign = if rng.gen::<bool>() { 1. } else { -1. };
            sign * rng.gen_range(min..max)
        };
        // at least a pixel per frame horizontally, so every frame differs
        let velocities: Vec<(f32, f32)> = (0..4).map(|_| (speed(1.0, 3.0), speed(0.0, 2.0))).collect();
        let squares = velocities
            .into_iter()
            .map(|(vx, vy)| Square {
                x: rng.gen_range(0. ..WIDTH as f32),
                y: rng.gen_range(0. ..HEIGHT as f32),
                vx,
                vy,
                size: rng.gen_range(24..48),
                color: Pixel::from_rgb(rng.gen_range(150..=255), rng.gen(), rng.gen()),
            })
            .collect();
        info!("synthetic camera, seed {}", seed);
        SyntheticCamera {
            registers: [0; PARAM_COUNT],
            background,
            squares,
            frame_index: 0,
            lifetime: None,
        }
    }

    /// Report device loss after `frames` frames have been delivered.
    pub fn with_lifetime(mut self, frames: u64) -> Self {
        self.lifetime = Some(frames);
        self
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Draw the scene in logical coordinates; flips are applied by
    /// mirroring the view before anything is written.
    fn render(&self, mut image: nd::ArrayViewMut2<'_, Pixel>) {
        if self.registers[CameraParam::FlipH.index()] != 0 {
            image.invert_axis(nd::Axis(1));
        }
        if self.registers[CameraParam::FlipV.index()] != 0 {
            image.invert_axis(nd::Axis(0));
        }
        nd::Zip::indexed(&mut image).for_each(|(y, x), dst| *dst = self.background[y * WIDTH + x]);

        let t = self.frame_index as f32;
        for square in &self.squares {
            let span_x = (WIDTH + square.size) as f32;
            let span_y = (HEIGHT + square.size) as f32;
            // wrap around, entering again from the opposite border
            let x0 = (square.x + square.vx * t).rem_euclid(span_x) as i64 - square.size as i64;
            let y0 = (square.y + square.vy * t).rem_euclid(span_y) as i64 - square.size as i64;
            for sy in 0..square.size as i64 {
                for sx in 0..square.size as i64 {
                    let (x, y) = (x0 + sx, y0 + sy);
                    if x < 0 || y < 0 || x >= WIDTH as i64 || y >= HEIGHT as i64 {
                        continue;
                    }
                    let checker = ((sx / 6) + (sy / 6)) % 2 == 0;
                    image[(y as usize, x as usize)] = if checker {
                        square.color
                    } else {
                        Pixel::gray(10)
                    };
                }
            }
        }
    }
}

impl CaptureDevice for SyntheticCamera {
    fn read_frame(&mut self, pixels: &mut [Pixel]) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::DeviceLost(format!(
                "synthetic camera expired after {} frames",
                self.frame_index
            )));
        }
        check_geometry(pixels)?;
        let view = nd::ArrayViewMut2::from_shape((HEIGHT, WIDTH), pixels)
            .map_err(|e| Error::precondition(e.to_string()))?;
        self.render(view);
        self.frame_index += 1;
        Ok(())
    }

    fn param(&self, param: CameraParam) -> Result<u8> {
        Ok(self.registers[param.index()])
    }

    fn set_param(&mut self, param: CameraParam, value: u8) -> Result<u8> {
        let accepted = param.spec().clamp(value);
        if accepted != value {
            warn!("synthetic camera: {:?} {} out of range", param, value);
        }
        self.registers[param.index()] = accepted;
        Ok(accepted)
    }

    fn is_alive(&self) -> bool {
        self.lifetime.map_or(true, |n| self.frame_index < n)
    }
}
