use nalgebra as na;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::image::*;
use crate::my_types::*;
use crate::params::DEFAULT_MIN_POINT_QUALITY;
use crate::pyramid::Pyramid;

/// Where one query point went, as reported by a motion engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    pub position: Vector2d,
    /// Matching residual; lower is better.
    pub error: f64,
    /// False if the point could not be followed (left the frame, lost texture).
    pub valid: bool,
}

impl Correspondence {
    pub fn lost() -> Self {
        Correspondence {
            position: Vector2d::zeros(),
            error: 0.,
            valid: false,
        }
    }
}

/// Sparse correspondence between two frames.
pub trait MotionEngine {
    /// Push exactly one correspondence per entry of `points` (positions in
    /// `previous`) into `out`, in order.
    fn track(
        &mut self,
        previous: &Frame,
        current: &Frame,
        points: &[Vector2d],
        out: &mut Vec<Correspondence>,
    ) -> Result<()>;

    /// Texture threshold below which a point is reported invalid.
    fn set_min_quality(&mut self, _quality: f32) {}
}

#[derive(Clone, Copy, Debug)]
struct LkParams {
    iters: usize,
    levels: usize,
    win_size: usize,
    term: f64,
    /// smallest structure tensor eigenvalue per window pixel
    min_quality: f64,
}

#[derive(Debug)]
struct Workspace {
    ix: Matrixd,
    iy: Matrixd,
    it: Matrixd,
    /// window samples plus a one pixel border
    patch: Matrixd,
}

/// Pyramidal Lucas-Kanade on the luma channel.
///
/// ref http://robots.stanford.edu/cs223b04/algo_tracking.pdf
#[derive(Debug)]
pub struct LucasKanade {
    params: LkParams,
    pyramid0: Pyramid,
    pyramid1: Pyramid,
    workspace: Workspace,
}

impl LucasKanade {
    pub fn new() -> LucasKanade {
        let lk_win_size = 7;
        LucasKanade {
            params: LkParams {
                iters: 5,
                levels: 3,
                win_size: lk_win_size,
                term: 0.1,
                min_quality: DEFAULT_MIN_POINT_QUALITY as f64,
            },
            pyramid0: Pyramid::empty(),
            pyramid1: Pyramid::empty(),
            workspace: Workspace {
                ix: na::DMatrix::zeros(lk_win_size, lk_win_size),
                iy: na::DMatrix::zeros(lk_win_size, lk_win_size),
                it: na::DMatrix::zeros(lk_win_size, lk_win_size),
                patch: na::DMatrix::zeros(lk_win_size + 2, lk_win_size + 2),
            },
        }
    }
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionEngine for LucasKanade {
    fn track(
        &mut self,
        previous: &Frame,
        current: &Frame,
        points: &[Vector2d],
        out: &mut Vec<Correspondence>,
    ) -> Result<()> {
        out.clear();
        if points.is_empty() {
            return Ok(());
        }
        self.pyramid0.compute(previous, self.params.levels)?;
        self.pyramid1.compute(current, self.params.levels)?;
        for point0 in points {
            let tracked = process_feature(
                &self.params,
                &self.pyramid0,
                &self.pyramid1,
                &mut self.workspace,
                *point0,
            );
            out.push(match tracked {
                Some((position, error)) => Correspondence {
                    position,
                    error,
                    valid: true,
                },
                None => Correspondence::lost(),
            });
        }
        Ok(())
    }

    fn set_min_quality(&mut self, quality: f32) {
        self.params.min_quality = quality as f64;
    }
}

fn process_feature(
    params: &LkParams,
    pyramid0: &Pyramid,
    pyramid1: &Pyramid,
    ws: &mut Workspace,
    point0: Vector2d,
) -> Option<(Vector2d, f64)> {
    let lk_term2 = params.term.powi(2);
    let r = (params.win_size - 1) / 2;
    if pyramid0.depth() < params.levels || pyramid1.depth() < params.levels {
        return None;
    }

    let mut g = Vector2d::zeros();
    let mut d = Vector2d::zeros();
    for level in (0..params.levels + 1).rev() {
        let level0 = pyramid0.level(level);
        let level1 = pyramid1.level(level);
        let u = point0 / u32::pow(2, level as u32) as f64;
        let window = Window::around(level0, u, r, 1)?;
        scharr(level0, u, window, &mut ws.ix, &mut ws.iy, &mut ws.patch);
        let tensor = structure_tensor(&ws.ix, &ws.iy);
        let quality = tensor.symmetric_eigenvalues().min() / ws.ix.len() as f64;
        if quality < params.min_quality {
            return None;
        }
        let mut converged = false;
        let mut nu = Vector2d::zeros();
        for _ in 0..params.iters {
            residual(level1, u + g + nu, window, r, &ws.patch, &mut ws.it)?;
            let eta = flow_step(&tensor, &ws.ix, &ws.iy, &ws.it)?;
            nu += eta;
            if eta.norm_squared() < lk_term2 {
                converged = true;
                break;
            }
        }

        d = nu;
        if !converged {
            return None;
        }
        if level > 0 {
            g = 2. * (g + d)
        }
    }

    let point1 = point0 + g + d;
    if !pyramid1.level(0).contains(point1) {
        return None;
    }
    let error = ws.it.iter().map(|v| v.abs()).sum::<f64>() / ws.it.len() as f64;
    Some((point1, error))
}

/// Integer offsets around a subpixel center, inclusive on both ends, for
/// which every bilinear sample stays inside a level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    x: (i16, i16),
    y: (i16, i16),
}

impl Window {
    /// Offsets up to `radius`, keeping `margin` pixels to the border. `None`
    /// if the center lies outside the level or nothing fits.
    fn around(level: &Image, center: Vector2d, radius: usize, margin: i16) -> Option<Window> {
        let radius = radius as i16;
        let axis = |c: f64, size: usize| {
            if c < 0. || c > (size - 1) as f64 {
                return None;
            }
            let whole = c as i16;
            // a fractional center also reads the next pixel over
            let spill = (c.fract() > 0.) as i16;
            let lo = i16::max(-radius, margin - whole);
            let hi = i16::min(radius, size as i16 - 1 - whole - margin - spill);
            (lo <= hi).then_some((lo, hi))
        };
        Some(Window {
            x: axis(center.x, level.width)?,
            y: axis(center.y, level.height)?,
        })
    }

    fn grown(self, by: i16) -> Window {
        Window {
            x: (self.x.0 - by, self.x.1 + by),
            y: (self.y.0 - by, self.y.1 + by),
        }
    }

    /// (rows, cols)
    fn shape(&self) -> (usize, usize) {
        (
            (self.y.1 - self.y.0 + 1) as usize,
            (self.x.1 - self.x.0 + 1) as usize,
        )
    }

    fn sample(&self, level: &Image, center: Vector2d, out: &mut Matrixd) {
        let (rows, cols) = self.shape();
        *out = Matrixd::from_fn(rows, cols, |row, col| {
            let offset = Vector2d::new(
                (self.x.0 + col as i16) as f64,
                (self.y.0 + row as i16) as f64,
            );
            bilinear(level, center + offset)
        });
    }
}

const SCHARR_SMOOTHING: [f64; 3] = [3., 10., 3.];

/// Scharr derivatives over `window`. `patch` receives the samples of the
/// window grown by the kernel radius; its interior is the tracking template.
///
/// ref https://theailearner.com/tag/scharr-operator/
fn scharr(
    level: &Image,
    center: Vector2d,
    window: Window,
    ix: &mut Matrixd,
    iy: &mut Matrixd,
    patch: &mut Matrixd,
) {
    window.grown(1).sample(level, center, patch);
    let p = &*patch;
    let (rows, cols) = window.shape();
    let dx = |row: usize, col: usize| {
        (0..3)
            .map(|k| SCHARR_SMOOTHING[k] * (p[(row + k, col + 2)] - p[(row + k, col)]))
            .sum::<f64>()
            / 32.
    };
    let dy = |row: usize, col: usize| {
        (0..3)
            .map(|k| SCHARR_SMOOTHING[k] * (p[(row + 2, col + k)] - p[(row, col + k)]))
            .sum::<f64>()
            / 32.
    };
    *ix = Matrixd::from_fn(rows, cols, dx);
    *iy = Matrixd::from_fn(rows, cols, dy);
}

/// Sum of `grad grad^T` over the window.
fn structure_tensor(ix: &Matrixd, iy: &Matrixd) -> Matrix2d {
    debug_assert_eq!(ix.shape(), iy.shape());
    ix.iter()
        .zip(iy.iter())
        .fold(Matrix2d::zeros(), |acc, (&gx, &gy)| {
            acc + Matrix2d::new(gx * gx, gx * gy, gx * gy, gy * gy)
        })
}

/// One Newton step towards the residual minimum.
fn flow_step(tensor: &Matrix2d, ix: &Matrixd, iy: &Matrixd, it: &Matrixd) -> Option<Vector2d> {
    let b = ix
        .iter()
        .zip(iy.iter())
        .zip(it.iter())
        .fold(Vector2d::zeros(), |acc, ((&gx, &gy), &t)| {
            acc + t * Vector2d::new(gx, gy)
        });
    tensor.try_inverse().map(|inv| inv * b)
}

/// Template minus `level` sampled around `center`. Fails when the window
/// would have to shrink to stay inside `level`.
fn residual(
    level: &Image,
    center: Vector2d,
    window: Window,
    radius: usize,
    patch: &Matrixd,
    it: &mut Matrixd,
) -> Option<()> {
    if Window::around(level, center, radius, 0)? != window {
        return None;
    }
    window.sample(level, center, it);
    *it = &patch.view((1, 1), it.shape()) - &*it;
    Some(())
}

/// An engine has to answer every query point, in order.
pub(crate) fn check_points(points: &[Vector2d], out: &[Correspondence]) -> Result<()> {
    if points.len() != out.len() {
        return Err(Error::precondition(format!(
            "motion engine returned {} correspondences for {} points",
            out.len(),
            points.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Pixel, HEIGHT, WIDTH};

    fn blob_image(width: usize, height: usize, center: Vector2d) -> Image {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let r2 = (Vector2d::new(x as f64, y as f64) - center).norm_squared();
                data.push((20. + 200. * (-r2 / (2. * 4.0f64.powi(2))).exp()) as u8);
            }
        }
        Image {
            data,
            width,
            height,
        }
    }

    fn blob_frame(center: Vector2d) -> Box<Frame> {
        let image = blob_image(WIDTH, HEIGHT, center);
        let mut frame = Frame::boxed();
        for (pixel, value) in frame.pixels.iter_mut().zip(image.data) {
            *pixel = Pixel::gray(value);
        }
        frame
    }

    #[test]
    fn test_flow() {
        let lk_levels = 3;
        let center0 = Vector2d::new(60., 60.);
        let motion = Vector2d::new(2.5, -1.5);
        let pyramid0 = Pyramid::from_image(blob_image(128, 128, center0), lk_levels).unwrap();
        let pyramid1 =
            Pyramid::from_image(blob_image(128, 128, center0 + motion), lk_levels).unwrap();

        let mut flow = LucasKanade::new();
        // track a point on the blob's flank where the texture is strong
        let point0 = center0 + Vector2d::new(3., 3.);
        let (point1, error) = process_feature(
            &flow.params,
            &pyramid0,
            &pyramid1,
            &mut flow.workspace,
            point0,
        )
        .unwrap();
        let err = (point1 - point0) - motion;
        assert!(err.norm() < 0.5, "optical flow err {}", err.norm());
        assert!(error >= 0.);
    }

    #[test]
    fn test_engine_on_frames() {
        let previous = blob_frame(Vector2d::new(100., 80.));
        let current = blob_frame(Vector2d::new(102., 81.));
        let mut engine = LucasKanade::new();
        let points = vec![
            Vector2d::new(103., 83.),
            // flat background: no texture to follow
            Vector2d::new(250., 200.),
        ];
        let mut out = vec![];
        engine.track(&previous, &current, &points, &mut out).unwrap();
        check_points(&points, &out).unwrap();
        assert!(out[0].valid);
        assert!((out[0].position - Vector2d::new(105., 84.)).norm() < 0.5);
        assert!(!out[1].valid);
    }

    #[test]
    fn test_engine_without_points() {
        let frame = Frame::boxed();
        let mut engine = LucasKanade::new();
        let mut out = vec![Correspondence::lost()];
        engine.track(&frame, &frame, &[], &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_scharr() {
        let mut image = Image {
            data: vec![0; 25],
            width: 5,
            height: 5,
        };
        let mut ix = na::dmatrix!();
        let mut iy = na::dmatrix!();
        let mut patch = na::dmatrix!();

        let center = Vector2d::new(2.0, 2.0);
        let window = Window::around(&image, center, 1, 1).unwrap();
        scharr(&image, center, window, &mut ix, &mut iy, &mut patch);
        assert_eq!(ix, na::DMatrix::zeros(3, 3));
        assert_eq!(iy, na::DMatrix::zeros(3, 3));
        assert_eq!(patch.shape(), (5, 5));

        // horizontal ramp
        image.data = (0..25).map(|i| (i % 5) as u8).collect();
        scharr(&image, center, window, &mut ix, &mut iy, &mut patch);
        assert_eq!(ix, na::DMatrix::repeat(3, 3, 1.));
        assert_eq!(iy, na::DMatrix::zeros(3, 3));

        // vertical line through the middle column
        image.data = (0..25).map(|i| if i % 5 == 2 { 5 } else { 0 }).collect();
        scharr(&image, center, window, &mut ix, &mut iy, &mut patch);
        let answer_x = na::dmatrix!(
            2.5, 0., -2.5;
            2.5, 0., -2.5;
            2.5, 0., -2.5;
        );
        assert_eq!(ix, answer_x);
        assert_eq!(iy, na::DMatrix::zeros(3, 3));

        // transposed: the derivative moves to the other axis
        image.data = (0..25).map(|i| if i / 5 == 2 { 5 } else { 0 }).collect();
        scharr(&image, center, window, &mut ix, &mut iy, &mut patch);
        assert_eq!(iy, answer_x.transpose());
        assert_eq!(ix, na::DMatrix::zeros(3, 3));
    }

    #[test]
    fn test_window_around() {
        // Coordinate (0, 0) means center of top-left pixel. Thus (9, 9) is
        // the center of the bottom-right pixel for a 10x10 image.
        let image = Image {
            data: vec![],
            width: 10,
            height: 10,
        };
        let window = |x, y| Some(Window { x, y });
        let around = |x, y, margin| Window::around(&image, Vector2d::new(x, y), 3, margin);
        assert_eq!(around(4.5, 4.5, 0), window((-3, 3), (-3, 3)));
        assert_eq!(around(1.5, 2.5, 0), window((-1, 3), (-2, 3)));
        assert_eq!(around(1.0, 2.0, 0), window((-1, 3), (-2, 3)));
        assert_eq!(around(0.9, 1.9, 0), window((0, 3), (-1, 3)));
        assert_eq!(around(0.9, 1.9, 1), window((1, 3), (0, 3)));
        assert_eq!(around(8.5, 2.0, 0), window((-3, 0), (-2, 3)));
        assert_eq!(around(9.5, 2.0, 0), None);

        let grown = around(4.5, 4.5, 1).unwrap().grown(1);
        assert_eq!(grown, Window { x: (-4, 4), y: (-4, 4) });
        assert_eq!(grown.shape(), (9, 9));
    }

    #[test]
    fn test_residual_needs_same_window() {
        let image = blob_image(32, 32, Vector2d::new(16., 16.));
        let center = Vector2d::new(16., 16.);
        let window = Window::around(&image, center, 3, 1).unwrap();
        let (mut ix, mut iy, mut patch, mut it) =
            (na::dmatrix!(), na::dmatrix!(), na::dmatrix!(), na::dmatrix!());
        scharr(&image, center, window, &mut ix, &mut iy, &mut patch);

        // same image, same place: nothing left to explain
        residual(&image, center, window, 3, &patch, &mut it).unwrap();
        assert_eq!(it, na::DMatrix::zeros(7, 7));
        let tensor = structure_tensor(&ix, &iy);
        assert_eq!(flow_step(&tensor, &ix, &iy, &it), Some(Vector2d::zeros()));

        // near the border the window would be clipped
        assert_eq!(
            residual(&image, Vector2d::new(1.5, 16.), window, 3, &patch, &mut it),
            None
        );
    }
}
