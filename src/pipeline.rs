use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::capture::CaptureDevice;
use crate::config::Config;
use crate::discovery::FeatureDiscovery;
use crate::error::{Error, Result};
use crate::frame::{FPS, MAX_TRACKING_POINTS};
use crate::my_types::*;
use crate::optical_flow::{LucasKanade, MotionEngine};
use crate::params::sync_camera_params;
use crate::refine::{CornerRefiner, SubPixelRefiner};
use crate::store::TrackingStore;
use crate::tracker::PointTracker;

/// What happened to one published frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameReport {
    pub sequence: u64,
    pub num_points: u32,
    pub motion: Vector2d,
    pub discovered: bool,
    /// Time from capture to just before publishing
    pub elapsed: Duration,
}

/// Seconds between two frames beyond which the older one is not tracked
/// against, e.g. the last frame left in a reused store.
pub const MAX_TRACKING_GAP: f64 = 1.0;

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

/// The single writer: capture, track, discover, publish.
pub struct Producer<E, C> {
    store: TrackingStore,
    device: Box<dyn CaptureDevice>,
    tracker: PointTracker<E>,
    discovery: FeatureDiscovery<C>,
    rng: Xoshiro256PlusPlus,
    /// Fraction of the frame period after which discovery is skipped
    discovery_budget: f64,
}

impl Producer<LucasKanade, SubPixelRefiner> {
    pub fn new(store: TrackingStore, device: Box<dyn CaptureDevice>, config: &Config) -> Result<Self> {
        let tracker = PointTracker::new(config.tracker_settings(), LucasKanade::new());
        let discovery = FeatureDiscovery::new(config.discovery_settings(), SubPixelRefiner::new())?;
        Ok(Producer::with_components(
            store,
            device,
            tracker,
            discovery,
            config.seed,
            config.discovery_budget,
        ))
    }
}

impl<E: MotionEngine, C: CornerRefiner> Producer<E, C> {
    pub fn with_components(
        store: TrackingStore,
        device: Box<dyn CaptureDevice>,
        tracker: PointTracker<E>,
        discovery: FeatureDiscovery<C>,
        seed: u64,
        discovery_budget: f64,
    ) -> Self {
        Producer {
            store,
            device,
            tracker,
            discovery,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            discovery_budget,
        }
    }

    pub fn store(&self) -> &TrackingStore {
        &self.store
    }

    /// Produce and publish one frame. On error nothing is published.
    pub fn step(&mut self) -> Result<FrameReport> {
        if !self.device.is_alive() {
            return Err(Error::DeviceLost("device stopped delivering frames".into()));
        }
        let header = self.store.header();
        sync_camera_params(header, self.device.as_mut())?;
        self.tracker.set_min_quality(header.min_point_quality());
        let point_limit = usize::min(header.tracking_point_limit() as usize, MAX_TRACKING_POINTS);
        let budget = Duration::from_secs_f64(self.discovery_budget / FPS as f64);

        let (previous, current) = self.store.frame_pair();
        current.reset(unix_time());
        let previous = previous.filter(|previous| {
            let gap = current.timestamp - previous.timestamp;
            if gap.abs() > MAX_TRACKING_GAP {
                info!("previous frame is {:.3} s away, not tracking against it", gap);
                return false;
            }
            true
        });
        self.device.read_frame(&mut current.pixels)?;
        let started = Instant::now();

        let mut motion = Vector2d::zeros();
        let mut discovered = false;
        if let Some(previous) = previous {
            motion = self.tracker.update(previous, current, &mut self.rng)?;
            if started.elapsed() < budget && (current.num_points as usize) < point_limit {
                discovered = self
                    .discovery
                    .try_insert_point(previous, current, &mut self.rng)?;
            }
        }
        let num_points = current.num_points;
        let elapsed = started.elapsed();

        self.store.header().add_total_motion(motion);
        let sequence = self.store.publish() - 1;
        Span::current().pb_inc(1);
        debug!(
            "frame {}: {} points, motion ({:.3}, {:.3}), {:?}",
            sequence, num_points, motion.x, motion.y, elapsed
        );
        Ok(FrameReport {
            sequence,
            num_points,
            motion,
            discovered,
            elapsed,
        })
    }

    /// Step until `stop` is raised, `max_frames` frames were produced or a
    /// fatal error occurs. Returns the number of frames produced.
    pub fn run(&mut self, stop: &AtomicBool, max_frames: Option<u64>) -> Result<u64> {
        let mut produced = 0;
        while !stop.load(Ordering::Relaxed) && max_frames.map_or(true, |n| produced < n) {
            if let Err(e) = self.step() {
                error!("producer stopped after {} frames: {}", produced, e);
                return Err(e);
            }
            produced += 1;
        }
        info!(
            "producer finished after {} frames, counter at {}",
            produced,
            self.store.frame_counter()
        );
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCamera;
    use crate::params::CameraParam;
    use crate::reader::StoreReader;
    use crate::ring::slot_index;
    use crate::store::SettingsStore;

    fn producer(path: &std::path::Path, camera: SyntheticCamera) -> Producer<LucasKanade, SubPixelRefiner> {
        let store = TrackingStore::open(path).unwrap();
        // no time pressure in tests, so discovery always runs
        let config = Config {
            discovery_budget: 1e6,
            ..Config::default()
        };
        Producer::new(store, Box::new(camera), &config).unwrap()
    }

    #[test]
    fn test_frames_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut producer = producer(&path, SyntheticCamera::new(1));
        let stop = AtomicBool::new(false);
        assert_eq!(producer.run(&stop, Some(6)).unwrap(), 6);

        let reader = StoreReader::open(&path).unwrap();
        let snapshot = reader.snapshot();
        assert_eq!(snapshot.frame_counter(), 6);
        let first = snapshot.frame(0).unwrap();
        assert_eq!(first.num_points, 0);
        assert!(first.timestamp > 0.);

        for sequence in 1..6 {
            let previous = snapshot.frame(sequence - 1).unwrap();
            let frame = snapshot.frame(sequence).unwrap();
            assert!(frame.num_points >= 1);
            assert!(frame.timestamp >= previous.timestamp);
            for point in frame.points() {
                if let Some(index) = point.predecessor() {
                    assert!(index < previous.num_points as usize);
                    assert_eq!(point.age, previous.points[index].age + 1);
                } else {
                    assert_eq!(point.age, 0);
                }
            }
        }
    }

    #[test]
    fn test_device_loss_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut producer = producer(&path, SyntheticCamera::new(0).with_lifetime(3));
        let stop = AtomicBool::new(false);
        let result = producer.run(&stop, None);
        assert!(matches!(result, Err(Error::DeviceLost(_))));
        // only fully processed frames were published
        assert_eq!(producer.store().frame_counter(), 3);
        assert!(matches!(producer.step(), Err(Error::DeviceLost(_))));
        assert_eq!(producer.store().frame_counter(), 3);
    }

    #[test]
    fn test_stop_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut producer = producer(&dir.path().join("store"), SyntheticCamera::new(0));
        let stop = AtomicBool::new(true);
        assert_eq!(producer.run(&stop, None).unwrap(), 0);
        assert_eq!(producer.store().frame_counter(), 0);
    }

    #[test]
    fn test_settings_reach_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut producer = producer(&path, SyntheticCamera::new(0));
        let settings = SettingsStore::open(&path).unwrap();

        producer.step().unwrap();
        assert_eq!(producer.store().header().camera_param(CameraParam::Gain), 20);

        // the raw header value is what the UI asked for; the device clamps it
        settings.header().set_camera_param(CameraParam::Gain, 250);
        producer.step().unwrap();
        assert_eq!(settings.header().camera_param(CameraParam::Gain), 63);
    }

    #[test]
    fn test_point_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut producer = producer(&path, SyntheticCamera::new(5));
        SettingsStore::open(&path).unwrap().set_tracking_point_limit(2);
        for _ in 0..8 {
            let report = producer.step().unwrap();
            assert!(report.num_points <= 2);
        }
    }

    #[test]
    fn test_old_frame_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut first = producer(&path, SyntheticCamera::new(2));
        for _ in 0..3 {
            first.step().unwrap();
        }
        std::mem::drop(first);

        // the last frame of an earlier run, long gone
        let mut store = TrackingStore::open(&path).unwrap();
        let last = slot_index(store.frame_counter() - 1);
        store.data_mut().frames[last].timestamp -= 10.;
        assert!(store.data().frames[last].num_points > 0);
        std::mem::drop(store);

        let mut second = producer(&path, SyntheticCamera::new(2));
        let report = second.step().unwrap();
        assert_eq!(report.sequence, 3);
        assert_eq!(report.num_points, 0);
        assert_eq!(report.motion, Vector2d::zeros());
        assert!(!report.discovered);

        // frames from this run are tracked again
        let report = second.step().unwrap();
        assert!(report.num_points >= 1);
    }
}
