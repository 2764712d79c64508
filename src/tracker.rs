use log::trace;
use rand::Rng;

use crate::error::{Error, Result};
use crate::feature::Point;
use crate::frame::{Frame, MAX_TRACKING_POINTS};
use crate::my_types::*;
use crate::optical_flow::{check_points, Correspondence, MotionEngine};

/// Frames a point must survive before it contributes to aggregate motion.
pub const POINT_TRIAL_PERIOD: u32 = 8;

/// Chance that a successfully tracked point is dropped anyway, so the
/// tracked set keeps getting refreshed.
pub const DEATH_PROBABILITY: f32 = 0.001;

/// Lower bound on the matching error used as a weight denominator.
pub const MIN_MATCH_ERROR: f64 = 1e-3;

#[derive(Clone, Copy, Debug)]
pub struct TrackerSettings {
    pub death_probability: f32,
    pub trial_period: u32,
    pub min_error: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        TrackerSettings {
            death_probability: DEATH_PROBABILITY,
            trial_period: POINT_TRIAL_PERIOD,
            min_error: MIN_MATCH_ERROR,
        }
    }
}

/// Carries the points of one frame over to the next.
pub struct PointTracker<E> {
    settings: TrackerSettings,
    engine: E,
    queries: Vec<Vector2d>,
    matches: Vec<Correspondence>,
}

impl<E: MotionEngine> PointTracker<E> {
    pub fn new(settings: TrackerSettings, engine: E) -> Self {
        PointTracker {
            settings,
            engine,
            queries: Vec::with_capacity(MAX_TRACKING_POINTS),
            matches: Vec::with_capacity(MAX_TRACKING_POINTS),
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn set_min_quality(&mut self, quality: f32) {
        self.engine.set_min_quality(quality);
    }

    /// Follow the points of `previous` into `current`, which must not hold
    /// any points yet. Returns the aggregate motion of the frame.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        previous: &Frame,
        current: &mut Frame,
        rng: &mut R,
    ) -> Result<Vector2d> {
        if current.num_points != 0 {
            return Err(Error::precondition(format!(
                "current frame already holds {} points",
                current.num_points
            )));
        }
        if previous.num_points as usize > MAX_TRACKING_POINTS {
            return Err(Error::precondition(format!(
                "previous frame claims {} points, capacity is {}",
                previous.num_points, MAX_TRACKING_POINTS
            )));
        }
        let points = previous.points();
        if points.is_empty() {
            return Ok(Vector2d::zeros());
        }

        self.queries.clear();
        self.queries
            .extend(points.iter().map(|p| Vector2d::new(p.x as f64, p.y as f64)));
        self.engine
            .track(previous, current, &self.queries, &mut self.matches)?;
        check_points(&self.queries, &self.matches)?;

        let mut weighted = Vector2d::zeros();
        let mut total_weight = 0.;
        for (index, (point, found)) in points.iter().zip(&self.matches).enumerate() {
            if !found.valid || current.is_full() {
                continue;
            }
            // one draw per valid point, before anything else can reject it
            if rng.gen::<f32>() <= self.settings.death_probability {
                trace!("culled point {}", index);
                continue;
            }
            let position = Vector2f::new(found.position.x as f32, found.position.y as f32);
            let survivor = Point::tracked(point, index, position);
            current.push_point(survivor);

            if survivor.age > self.settings.trial_period {
                let weight = (survivor.age - self.settings.trial_period) as f64
                    / found.error.max(self.settings.min_error);
                let d = survivor.displacement();
                weighted += weight * Vector2d::new(d.x as f64, d.y as f64);
                total_weight += weight;
            }
        }

        trace!(
            "tracked {} of {} points, weight {:.3}",
            current.num_points,
            points.len(),
            total_weight
        );
        if total_weight > 0. {
            Ok(weighted / total_weight)
        } else {
            Ok(Vector2d::zeros())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    /// Moves every point by a fixed offset and reports scripted errors.
    struct ScriptedEngine {
        offset: Vector2d,
        errors: Vec<f64>,
        invalid: Vec<usize>,
        drop_last: bool,
    }

    impl ScriptedEngine {
        fn new(offset: Vector2d, errors: Vec<f64>) -> Self {
            ScriptedEngine {
                offset,
                errors,
                invalid: vec![],
                drop_last: false,
            }
        }
    }

    impl MotionEngine for ScriptedEngine {
        fn track(
            &mut self,
            _previous: &Frame,
            _current: &Frame,
            points: &[Vector2d],
            out: &mut Vec<Correspondence>,
        ) -> Result<()> {
            out.clear();
            for (i, p) in points.iter().enumerate() {
                out.push(Correspondence {
                    position: p + self.offset,
                    error: self.errors[i],
                    valid: !self.invalid.contains(&i),
                });
            }
            if self.drop_last {
                out.pop();
            }
            Ok(())
        }
    }

    /// Never culls: every draw is close to 1.
    fn keep_all() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    /// Always culls: every draw is 0.
    fn kill_all() -> StepRng {
        StepRng::new(0, 0)
    }

    fn previous_with(points: &[(f32, f32, u32)]) -> Box<Frame> {
        let mut frame = Frame::boxed();
        for &(x, y, age) in points {
            let mut point = Point::new(x, y);
            point.age = age;
            frame.push_point(point);
        }
        frame
    }

    #[test]
    fn test_empty_previous() {
        let previous = Frame::boxed();
        let mut current = Frame::boxed();
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::zeros(), vec![]),
        );
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert_eq!(motion, Vector2d::zeros());
        assert_eq!(current.num_points, 0);
    }

    #[test]
    fn test_equal_weights() {
        let previous = previous_with(&[(10., 10., 8), (50., 20., 12), (100., 90., 30)]);
        let mut current = Frame::boxed();
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::new(1., 0.), vec![2., 2., 2.]),
        );
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert_eq!(motion, Vector2d::new(1., 0.));

        assert_eq!(current.num_points, 3);
        for (i, point) in current.points().iter().enumerate() {
            assert_eq!(point.predecessor(), Some(i));
            assert_eq!(point.age, previous.points[i].age + 1);
            assert_eq!(point.displacement(), Vector2f::new(1., 0.));
        }
    }

    #[test]
    fn test_weighting() {
        // ages 10 and 18 give weights 2 / 1 and 10 / 1 once aged by one frame
        let previous = previous_with(&[(10., 10., 9), (50., 20., 17)]);
        let mut current = Frame::boxed();
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::new(1.2, 0.), vec![1., 1.]),
        );
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert!((motion.x - 1.2).abs() < 1e-5);

        // a point matched with zero error does not blow up the average
        let mut current = Frame::boxed();
        tracker.engine_mut().errors = vec![0., 1.];
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert!(motion.iter().all(|v| v.is_finite()));
        assert!((motion.x - 1.2).abs() < 1e-5);
    }

    #[test]
    fn test_young_points_have_no_weight() {
        let previous = previous_with(&[(10., 10., 0), (20., 20., POINT_TRIAL_PERIOD - 1)]);
        let mut current = Frame::boxed();
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::new(3., 4.), vec![0.5, 0.5]),
        );
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert_eq!(motion, Vector2d::zeros());
        // still tracked, just not trusted yet
        assert_eq!(current.num_points, 2);
        assert_eq!(current.points()[1].age, POINT_TRIAL_PERIOD);
    }

    #[test]
    fn test_culling() {
        let previous = previous_with(&[(10., 10., 20), (20., 20., 20)]);
        let mut current = Frame::boxed();
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::new(1., 1.), vec![1., 1.]),
        );
        let motion = tracker.update(&previous, &mut current, &mut kill_all()).unwrap();
        assert_eq!(current.num_points, 0);
        assert_eq!(motion, Vector2d::zeros());
    }

    #[test]
    fn test_invalid_points_dropped() {
        let previous = previous_with(&[(10., 10., 20), (20., 20., 20), (30., 30., 20)]);
        let mut current = Frame::boxed();
        let mut engine = ScriptedEngine::new(Vector2d::new(0., -2.), vec![1., 1., 1.]);
        engine.invalid = vec![1];
        let mut tracker = PointTracker::new(TrackerSettings::default(), engine);
        let motion = tracker.update(&previous, &mut current, &mut keep_all()).unwrap();
        assert_eq!(motion, Vector2d::new(0., -2.));
        assert_eq!(current.num_points, 2);
        // links point back past the gap
        assert_eq!(current.points()[1].predecessor(), Some(2));
    }

    #[test]
    fn test_preconditions() {
        let previous = previous_with(&[(10., 10., 20)]);
        let mut tracker = PointTracker::new(
            TrackerSettings::default(),
            ScriptedEngine::new(Vector2d::zeros(), vec![1.]),
        );

        let mut current = previous_with(&[(1., 1., 0)]);
        let err = tracker.update(&previous, &mut current, &mut keep_all());
        assert!(matches!(err, Err(Error::TrackingPrecondition(_))));

        let mut corrupted = previous_with(&[(10., 10., 20)]);
        corrupted.num_points = MAX_TRACKING_POINTS as u32 + 1;
        let mut current = Frame::boxed();
        let err = tracker.update(&corrupted, &mut current, &mut keep_all());
        assert!(matches!(err, Err(Error::TrackingPrecondition(_))));

        tracker.engine_mut().drop_last = true;
        let mut current = Frame::boxed();
        let err = tracker.update(&previous, &mut current, &mut keep_all());
        assert!(matches!(err, Err(Error::TrackingPrecondition(_))));
    }
}
