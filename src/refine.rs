use crate::image::{bilinear, Image};
use crate::my_types::*;

/// Moves an approximate location onto the nearest strong corner.
pub trait CornerRefiner {
    fn refine(&mut self, image: &Image, approx: Vector2d) -> Vector2d;
}

/// Iterative sub-pixel corner refinement.
///
/// Every image gradient near a corner is orthogonal to the vector from the
/// corner to where the gradient was sampled, so the corner is the least
/// squares solution of `sum(g g^T) q = sum(g g^T p)` over a window.
#[derive(Clone, Debug)]
pub struct SubPixelRefiner {
    half_window: i32,
    max_iters: usize,
    epsilon: f64,
}

impl SubPixelRefiner {
    pub fn new() -> Self {
        SubPixelRefiner {
            half_window: 3,
            max_iters: 10,
            epsilon: 0.03,
        }
    }
}

impl Default for SubPixelRefiner {
    fn default() -> Self {
        Self::new()
    }
}

impl CornerRefiner for SubPixelRefiner {
    fn refine(&mut self, image: &Image, approx: Vector2d) -> Vector2d {
        let hw = self.half_window;
        let sigma2 = (hw * hw) as f64;
        let ex = Vector2d::new(1., 0.);
        let ey = Vector2d::new(0., 1.);

        let mut q = approx;
        for _ in 0..self.max_iters {
            let mut g = Matrix2d::zeros();
            let mut b = Vector2d::zeros();
            for dy in -hw..=hw {
                for dx in -hw..=hw {
                    let offset = Vector2d::new(dx as f64, dy as f64);
                    let p = q + offset;
                    let grad = 0.5
                        * Vector2d::new(
                            bilinear(image, p + ex) - bilinear(image, p - ex),
                            bilinear(image, p + ey) - bilinear(image, p - ey),
                        );
                    let weight = (-offset.norm_squared() / sigma2).exp();
                    let ggt = weight * grad * grad.transpose();
                    g += ggt;
                    b += ggt * p;
                }
            }
            let next = match g.try_inverse() {
                Some(inv_g) => inv_g * b,
                None => break,
            };
            let step = next - q;
            q = next;
            if step.norm_squared() < self.epsilon.powi(2) {
                break;
            }
        }

        // wandered off: keep the starting estimate
        if (q - approx).amax() > hw as f64 || !q.iter().all(|v| v.is_finite()) {
            approx
        } else {
            q
        }
    }
}
