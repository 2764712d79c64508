use log::debug;
use rand::Rng;

use crate::error::{Error, Result};
use crate::feature::Point;
use crate::frame::{Frame, HEIGHT, WIDTH};
use crate::image::Image;
use crate::my_types::*;
use crate::refine::CornerRefiner;

#[derive(Clone, Copy, Debug)]
pub struct DiscoverySettings {
    /// Sampling grid spacing in pixels.
    pub grid_spacing: usize,
    /// Sample jitter as a fraction of the grid spacing, in each direction.
    pub jitter: f32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            grid_spacing: 5,
            jitter: 0.4,
        }
    }
}

/// Adds at most one point per frame where the image changed and nothing is
/// tracked yet.
///
/// Saliency is the squared color distance between the two frames at one
/// jittered sample per uncovered grid cell: a cheap stand-in for "motion
/// that is not being followed".
pub struct FeatureDiscovery<C> {
    settings: DiscoverySettings,
    refiner: C,
    cols: usize,
    rows: usize,
    /// `true` = a current point falls inside the cell
    covered: Vec<bool>,
    luma: Image,
}

impl<C: CornerRefiner> FeatureDiscovery<C> {
    pub fn new(settings: DiscoverySettings, refiner: C) -> Result<Self> {
        let g = settings.grid_spacing;
        if g == 0 || WIDTH / g < 3 || HEIGHT / g < 3 {
            return Err(Error::precondition(format!(
                "grid spacing {} leaves no interior cells",
                g
            )));
        }
        if !(0.0..0.5).contains(&settings.jitter) {
            return Err(Error::precondition(format!(
                "jitter {} must stay inside the cell",
                settings.jitter
            )));
        }
        let cols = WIDTH / g;
        let rows = HEIGHT / g;
        Ok(FeatureDiscovery {
            settings,
            refiner,
            cols,
            rows,
            covered: vec![false; cols * rows],
            luma: Image::empty(),
        })
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    fn mark_covered(&mut self, points: &[Point]) {
        self.covered.fill(false);
        let g = self.settings.grid_spacing as f32;
        for point in points {
            if point.x < 0. || point.y < 0. {
                continue;
            }
            let col = (point.x / g) as usize;
            let row = (point.y / g) as usize;
            if col < self.cols && row < self.rows {
                self.covered[row * self.cols + col] = true;
            }
        }
    }

    /// Try to add one new point to `current`. Returns whether a point was
    /// inserted.
    pub fn try_insert_point<R: Rng + ?Sized>(
        &mut self,
        previous: &Frame,
        current: &mut Frame,
        rng: &mut R,
    ) -> Result<bool> {
        if current.is_full() {
            return Ok(false);
        }
        self.mark_covered(current.points());

        let g = self.settings.grid_spacing as f32;
        let jitter = self.settings.jitter * g;
        let mut best_saliency = 0;
        let mut best = None;
        for row in 1..self.rows - 1 {
            for col in 1..self.cols - 1 {
                if self.covered[row * self.cols + col] {
                    continue;
                }
                let x = (col as f32 + 0.5) * g + rng.gen_range(-jitter..=jitter);
                let y = (row as f32 + 0.5) * g + rng.gen_range(-jitter..=jitter);
                let x = usize::min(x as usize, WIDTH - 1);
                let y = usize::min(y as usize, HEIGHT - 1);
                let saliency = current.pixel(x, y).distance2(&previous.pixel(x, y));
                // strictly greater: ties keep the first cell in scan order
                if saliency > best_saliency {
                    best_saliency = saliency;
                    best = Some((x, y));
                }
            }
        }

        let (x, y) = match best {
            Some(best) => best,
            None => return Ok(false),
        };
        self.luma.fill_from_luma(current);
        let corner = self
            .refiner
            .refine(&self.luma, Vector2d::new(x as f64, y as f64));
        let cx = corner.x.clamp(0., (WIDTH - 1) as f64) as f32;
        let cy = corner.y.clamp(0., (HEIGHT - 1) as f64) as f32;
        debug!(
            "new point ({:.1}, {:.1}) from sample ({}, {}) saliency {}",
            cx, cy, x, y, best_saliency
        );
        Ok(current.push_point(Point::new(cx, cy)))
    }
}
