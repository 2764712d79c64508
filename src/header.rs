use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::my_types::*;
use crate::params::*;

/// "SEYE"
pub const STORE_MAGIC: u32 = u32::from_le_bytes(*b"SEYE");
pub const LAYOUT_VERSION: u32 = 1;

/// Process-wide header at the start of the shared mapping.
///
/// Every field is an atomic of machine-word size or less, so a settings
/// process writing a tunable never tears a value seen by the producer.
/// Only the crate's writer handles can reach the setters.
///
/// Size: 56 bytes
#[repr(C)]
#[derive(Debug, Default)]
pub struct Header {
    magic: AtomicU32,
    layout_version: AtomicU32,
    /// Number of frames ever published
    frame_counter: AtomicU64,
    /// f64 bit patterns
    total_motion_x: AtomicU64,
    total_motion_y: AtomicU64,
    /// f32 bit pattern
    min_point_quality: AtomicU32,
    tracking_point_limit: AtomicU32,
    camera: [AtomicU8; PARAM_COUNT],
    _reserved: [u8; 4],
}

impl Header {
    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == STORE_MAGIC
            && self.layout_version.load(Ordering::Relaxed) == LAYOUT_VERSION
    }

    /// Default tunables, zero counters. Magic is written last.
    pub(crate) fn install_defaults(&self) {
        self.frame_counter.store(0, Ordering::Relaxed);
        self.total_motion_x.store(0f64.to_bits(), Ordering::Relaxed);
        self.total_motion_y.store(0f64.to_bits(), Ordering::Relaxed);
        self.apply_settings(&CameraSettings::default());
        self.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.magic.store(STORE_MAGIC, Ordering::Release);
    }

    /// Frames published so far. Load this before deciding which slots to read.
    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    /// The publish fence: every slot write before this call is visible to a
    /// reader that observes the new counter.
    #[inline]
    pub(crate) fn publish(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::Release) + 1
    }

    /// Sum of per-frame aggregate motion since the store was created.
    pub fn total_motion(&self) -> Vector2d {
        Vector2d::new(
            f64::from_bits(self.total_motion_x.load(Ordering::Relaxed)),
            f64::from_bits(self.total_motion_y.load(Ordering::Relaxed)),
        )
    }

    // single writer, so load + store is enough
    pub(crate) fn add_total_motion(&self, motion: Vector2d) {
        let total = self.total_motion() + motion;
        self.total_motion_x
            .store(total.x.to_bits(), Ordering::Relaxed);
        self.total_motion_y
            .store(total.y.to_bits(), Ordering::Relaxed);
    }

    pub fn min_point_quality(&self) -> f32 {
        f32::from_bits(self.min_point_quality.load(Ordering::Relaxed))
    }

    pub(crate) fn set_min_point_quality(&self, quality: f32) {
        self.min_point_quality
            .store(quality.to_bits(), Ordering::Relaxed);
    }

    /// Soft cap on points before discovery stops adding more.
    pub fn tracking_point_limit(&self) -> u32 {
        self.tracking_point_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tracking_point_limit(&self, limit: u32) {
        self.tracking_point_limit.store(limit, Ordering::Relaxed);
    }

    pub fn camera_param(&self, param: CameraParam) -> u8 {
        self.camera[param.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn set_camera_param(&self, param: CameraParam, value: u8) {
        self.camera[param.index()].store(value, Ordering::Relaxed);
    }

    pub fn settings(&self) -> CameraSettings {
        CameraSettings {
            min_point_quality: self.min_point_quality(),
            tracking_point_limit: self.tracking_point_limit(),
            camera: CAMERA_PARAMS
                .iter()
                .map(|spec| (spec.param, self.camera_param(spec.param)))
                .collect(),
        }
    }

    /// Write a settings snapshot. Camera values are clamped to their
    /// register ranges; registers missing from the snapshot are untouched.
    pub(crate) fn apply_settings(&self, settings: &CameraSettings) {
        self.set_min_point_quality(settings.min_point_quality);
        self.set_tracking_point_limit(settings.tracking_point_limit);
        for (param, value) in settings.camera.iter() {
            self.set_camera_param(*param, param.spec().clamp(*value));
        }
    }
}
