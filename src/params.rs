use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureDevice;
use crate::error::Result;
use crate::header::Header;

/// Camera registers mirrored in the shared header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraParam {
    Autogain,
    Gain,
    Exposure,
    Sharpness,
    Hue,
    Awb,
    Brightness,
    Contrast,
    BlueBalance,
    RedBalance,
    FlipH,
    FlipV,
}

pub const PARAM_COUNT: usize = 12;

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub param: CameraParam,
    pub name: &'static str,
    pub default: u8,
    pub min: u8,
    pub max: u8,
}

impl ParamSpec {
    const fn new(param: CameraParam, name: &'static str, default: u8, min: u8, max: u8) -> Self {
        ParamSpec {
            param,
            name,
            default,
            min,
            max,
        }
    }

    pub fn clamp(&self, value: u8) -> u8 {
        value.clamp(self.min, self.max)
    }

    /// Convert a property value reported by a capture backend to a register
    /// value. Backends report `f64`; unusable readings fall back to `min`.
    pub fn from_device(&self, raw: f64) -> u8 {
        if !raw.is_finite() {
            return self.min;
        }
        raw.round().clamp(self.min as f64, self.max as f64) as u8
    }
}

/// Every tunable register, in header storage order.
pub const CAMERA_PARAMS: [ParamSpec; PARAM_COUNT] = [
    ParamSpec::new(CameraParam::Autogain, "autogain", 1, 0, 1),
    ParamSpec::new(CameraParam::Gain, "gain", 20, 0, 63),
    ParamSpec::new(CameraParam::Exposure, "exposure", 120, 0, 255),
    ParamSpec::new(CameraParam::Sharpness, "sharpness", 0, 0, 63),
    ParamSpec::new(CameraParam::Hue, "hue", 143, 0, 255),
    ParamSpec::new(CameraParam::Awb, "awb", 1, 0, 1),
    ParamSpec::new(CameraParam::Brightness, "brightness", 20, 0, 255),
    ParamSpec::new(CameraParam::Contrast, "contrast", 37, 0, 255),
    ParamSpec::new(CameraParam::BlueBalance, "blue_balance", 128, 0, 255),
    ParamSpec::new(CameraParam::RedBalance, "red_balance", 128, 0, 255),
    ParamSpec::new(CameraParam::FlipH, "flip_h", 0, 0, 1),
    ParamSpec::new(CameraParam::FlipV, "flip_v", 0, 0, 1),
];

pub const DEFAULT_MIN_POINT_QUALITY: f32 = 0.1;
pub const DEFAULT_TRACKING_POINT_LIMIT: u32 = 200;

impl CameraParam {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn spec(self) -> &'static ParamSpec {
        &CAMERA_PARAMS[self.index()]
    }

    pub fn from_name(name: &str) -> Option<CameraParam> {
        CAMERA_PARAMS
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.param)
    }
}

/// Snapshot of all header tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub min_point_quality: f32,
    pub tracking_point_limit: u32,
    pub camera: BTreeMap<CameraParam, u8>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        CameraSettings {
            min_point_quality: DEFAULT_MIN_POINT_QUALITY,
            tracking_point_limit: DEFAULT_TRACKING_POINT_LIMIT,
            camera: CAMERA_PARAMS
                .iter()
                .map(|spec| (spec.param, spec.default))
                .collect(),
        }
    }
}

/// Push header values that differ from the device's live settings, and
/// record what the device actually accepted. Returns the number of
/// registers written.
pub fn sync_camera_params(header: &Header, device: &mut dyn CaptureDevice) -> Result<usize> {
    let mut written = 0;
    for spec in CAMERA_PARAMS.iter() {
        let desired = header.camera_param(spec.param);
        let live = device.param(spec.param)?;
        if desired == live {
            continue;
        }
        let accepted = device.set_param(spec.param, spec.clamp(desired))?;
        if accepted != desired {
            warn!("{} = {} clamped to {}", spec.name, desired, accepted);
        } else {
            debug!("{}: {} -> {}", spec.name, live, accepted);
        }
        header.set_camera_param(spec.param, accepted);
        written += 1;
    }
    Ok(written)
}
