use std::path::Path;

use cv2::prelude::*;
use log::{debug, info, warn};
use ndarray as nd;
use opencv as cv2;

use crate::capture::{check_geometry, CaptureDevice};
use crate::error::{Error, Result};
use crate::frame::{Pixel, HEIGHT, WIDTH};
use crate::params::CameraParam;

fn lost(e: cv2::Error) -> Error {
    Error::DeviceLost(e.to_string())
}

trait AsArray {
    fn try_as_array(&self) -> Result<nd::ArrayView3<'_, u8>>;
}

impl AsArray for cv2::core::Mat {
    fn try_as_array(&self) -> Result<nd::ArrayView3<'_, u8>> {
        let bytes = self.data_bytes().map_err(lost)?;
        let size = self.size().map_err(lost)?;
        nd::ArrayView3::from_shape((size.height as usize, size.width as usize, 3), bytes)
            .map_err(|e| Error::DeviceLost(format!("unexpected frame layout: {}", e)))
    }
}

/// OpenCV capture property backing a register, if the backend has one.
/// Flips are done on the decoded image instead.
fn capture_property(param: CameraParam) -> Option<i32> {
    use cv2::videoio::*;
    match param {
        CameraParam::Autogain => Some(CAP_PROP_AUTO_EXPOSURE),
        CameraParam::Gain => Some(CAP_PROP_GAIN),
        CameraParam::Exposure => Some(CAP_PROP_EXPOSURE),
        CameraParam::Sharpness => Some(CAP_PROP_SHARPNESS),
        CameraParam::Hue => Some(CAP_PROP_HUE),
        CameraParam::Awb => Some(CAP_PROP_AUTO_WB),
        CameraParam::Brightness => Some(CAP_PROP_BRIGHTNESS),
        CameraParam::Contrast => Some(CAP_PROP_CONTRAST),
        CameraParam::BlueBalance => Some(CAP_PROP_WHITE_BALANCE_BLUE_U),
        CameraParam::RedBalance => Some(CAP_PROP_WHITE_BALANCE_RED_V),
        CameraParam::FlipH | CameraParam::FlipV => None,
    }
}

/// A camera or video file read through OpenCV, resized to the frame
/// geometry.
pub struct VideoInput {
    capture: cv2::videoio::VideoCapture,
    raw: cv2::core::Mat,
    resized: cv2::core::Mat,
    flipped: cv2::core::Mat,
    /// Flips have no backend property; everything else is read live.
    flip_h: bool,
    flip_v: bool,
    alive: bool,
}

impl VideoInput {
    /// `source` is either a device index (`"0"`) or a path to a video file.
    pub fn open(source: &str) -> Result<VideoInput> {
        let capture = match source.parse::<i32>() {
            Ok(index) => cv2::videoio::VideoCapture::new(index, cv2::videoio::CAP_ANY),
            Err(_) => {
                if !Path::new(source).exists() {
                    return Err(Error::DeviceUnavailable(format!("{} does not exist", source)));
                }
                cv2::videoio::VideoCapture::from_file(source, cv2::videoio::CAP_ANY)
            }
        }
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        let opened = capture
            .is_opened()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        if !opened {
            return Err(Error::DeviceUnavailable(format!("cannot open {}", source)));
        }
        info!("opened video input {}", source);
        Ok(VideoInput {
            capture,
            raw: cv2::core::Mat::default(),
            resized: cv2::core::Mat::default(),
            flipped: cv2::core::Mat::default(),
            flip_h: false,
            flip_v: false,
            alive: true,
        })
    }

    fn flip_code(&self) -> Option<i32> {
        match (self.flip_h, self.flip_v) {
            (false, false) => None,
            (true, false) => Some(1),
            (false, true) => Some(0),
            (true, true) => Some(-1),
        }
    }
}

impl CaptureDevice for VideoInput {
    fn read_frame(&mut self, pixels: &mut [Pixel]) -> Result<()> {
        check_geometry(pixels)?;
        let got_frame = self.capture.read(&mut self.raw).map_err(lost)?;
        if !got_frame || self.raw.rows() == 0 {
            self.alive = false;
            return Err(Error::DeviceLost("end of stream".into()));
        }
        cv2::imgproc::resize(
            &self.raw,
            &mut self.resized,
            cv2::core::Size::new(WIDTH as i32, HEIGHT as i32),
            0.,
            0.,
            cv2::imgproc::INTER_AREA,
        )
        .map_err(lost)?;
        let image = match self.flip_code() {
            Some(code) => {
                cv2::core::flip(&self.resized, &mut self.flipped, code).map_err(lost)?;
                &self.flipped
            }
            None => &self.resized,
        };
        let bgr = image.try_as_array()?;
        for ((y, x), dst) in nd::indices((HEIGHT, WIDTH)).into_iter().zip(pixels.iter_mut()) {
            *dst = Pixel::from_rgb(bgr[(y, x, 2)], bgr[(y, x, 1)], bgr[(y, x, 0)]);
        }
        Ok(())
    }

    fn param(&self, param: CameraParam) -> Result<u8> {
        match (param, capture_property(param)) {
            (_, Some(property)) => {
                let raw = self.capture.get(property).map_err(lost)?;
                Ok(param.spec().from_device(raw))
            }
            (CameraParam::FlipV, None) => Ok(self.flip_v as u8),
            (_, None) => Ok(self.flip_h as u8),
        }
    }

    fn set_param(&mut self, param: CameraParam, value: u8) -> Result<u8> {
        let requested = param.spec().clamp(value);
        match capture_property(param) {
            Some(property) => {
                let applied = self.capture.set(property, requested as f64).map_err(lost)?;
                if !applied {
                    warn!("backend ignored {:?} = {}", param, requested);
                }
            }
            None if param == CameraParam::FlipV => self.flip_v = requested != 0,
            None => self.flip_h = requested != 0,
        }
        let live = self.param(param)?;
        if live != requested {
            debug!("{:?}: asked for {}, device reports {}", param, requested, live);
        }
        Ok(live)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}
