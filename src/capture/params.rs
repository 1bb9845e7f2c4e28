//! Camera parameters and the legacy control-protocol value mappings
//!
//! `CameraControls` and `OutputSettings` are the mutable base configuration that control
//! commands edit. Each time the pipeline is (re)configured an immutable
//! `CaptureParameters` value is derived from them for every active stream.

use crate::error::{Error, Result};

/// Upper bound of the contrast/saturation/sharpness output range.
const CONTROL_MAX: f32 = 15.99;

/// Upper bound accepted for the video bitrate, in bits per second.
pub const MAX_BITRATE: u32 = 25_000_000;

/// Automatic white balance modes understood by the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwbMode {
    Off,
    #[default]
    Auto,
    Incandescent,
    Tungsten,
    Fluorescent,
    Indoor,
    Daylight,
    Cloudy,
    Custom,
}

impl AwbMode {
    /// Parse a mode name, accepting the legacy aliases of the web interface.
    pub fn parse(name: &str) -> Option<Self> {
        let mode = match name.to_ascii_lowercase().as_str() {
            "off" => AwbMode::Off,
            "auto" => AwbMode::Auto,
            "incandescent" => AwbMode::Incandescent,
            "tungsten" => AwbMode::Tungsten,
            "fluorescent" => AwbMode::Fluorescent,
            "indoor" => AwbMode::Indoor,
            "daylight" | "sun" => AwbMode::Daylight,
            "cloudy" | "shade" => AwbMode::Cloudy,
            "custom" | "horizon" | "flash" => AwbMode::Custom,
            _ => return None,
        };
        Some(mode)
    }
}

/// Exposure metering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeteringMode {
    #[default]
    Centre,
    Spot,
    Average,
    Matrix,
    Custom,
}

impl MeteringMode {
    pub fn parse(name: &str) -> Option<Self> {
        let mode = match name.to_ascii_lowercase().as_str() {
            "centre" | "center" | "centreweighted" => MeteringMode::Centre,
            "spot" => MeteringMode::Spot,
            "average" | "backlit" => MeteringMode::Average,
            "matrix" => MeteringMode::Matrix,
            "custom" => MeteringMode::Custom,
            _ => return None,
        };
        Some(mode)
    }
}

/// Image transform expressed as the flip bit field used by the `fl` command.
///
/// Bit 0 is a horizontal flip, bit 1 a vertical flip. A 180 degree rotation is both flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transform {
    pub hflip: bool,
    pub vflip: bool,
}

impl Transform {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            hflip: bits & 0b01 != 0,
            vflip: bits & 0b10 != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        (self.hflip as u8) | ((self.vflip as u8) << 1)
    }

    /// Transform equivalent to a rotation by 0 or 180 degrees.
    pub fn rotation(degrees: u32) -> Self {
        if degrees == 180 {
            Self::from_bits(0b11)
        } else {
            Self::default()
        }
    }

    /// Compose two transforms (flips cancel out).
    pub fn then(self, other: Transform) -> Self {
        Self::from_bits(self.bits() ^ other.bits())
    }
}

/// Sensor and ISP controls shared by every stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraControls {
    /// Brightness in [-1.0, 1.0]
    pub brightness: f32,
    /// Contrast in [0.0, 15.99], 1.0 is neutral
    pub contrast: f32,
    /// Saturation in [0.0, 15.99], 1.0 is neutral
    pub saturation: f32,
    /// Sharpness in [0.0, 15.99], 1.0 is neutral
    pub sharpness: f32,
    /// Exposure compensation in stops, [-10, 10]
    pub exposure_compensation: f32,
    pub awb: AwbMode,
    pub metering: MeteringMode,
    /// Manual colour gains (red, blue)
    pub awb_gains: Option<(f32, f32)>,
    /// Analogue gain multiplier derived from an ISO value
    pub analogue_gain: Option<f32>,
    /// Shutter time in microseconds, `None` for automatic exposure
    pub shutter_us: Option<u32>,
    /// Rotation in degrees, 0 or 180
    pub rotation: u32,
    /// Flip bit field
    pub flip: u8,
}

impl Default for CameraControls {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            sharpness: 1.0,
            exposure_compensation: 0.0,
            awb: AwbMode::Auto,
            metering: MeteringMode::Centre,
            awb_gains: None,
            analogue_gain: None,
            shutter_us: None,
            rotation: 0,
            flip: 0,
        }
    }
}

impl CameraControls {
    /// Combined transform of the rotation and flip settings.
    pub fn transform(&self) -> Transform {
        Transform::rotation(self.rotation).then(Transform::from_bits(self.flip))
    }
}

/// Stream geometry and encoder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub image_width: u32,
    pub image_height: u32,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub preview_fps: u32,
    /// Width of the written preview image
    pub preview_width: u32,
    pub preview_quality: u8,
    /// Still JPEG quality after the legacy remap
    pub still_quality: u8,
    /// Video bitrate in bits per second
    pub bitrate: u32,
    /// Preview frame divider, reserved
    pub divider: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            image_width: 1280,
            image_height: 720,
            video_width: 1280,
            video_height: 720,
            video_fps: 25,
            preview_fps: 25,
            preview_width: DEFAULT_PREVIEW_WIDTH,
            preview_quality: 25,
            still_quality: 85,
            bitrate: 17_000_000,
            divider: 1,
        }
    }
}

/// Default bounded width for the preview image.
pub const DEFAULT_PREVIEW_WIDTH: u32 = 512;

/// Role of a configured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Stills, preview and motion analysis
    Viewfinder,
    /// Recording
    Video,
}

/// Immutable per-stream configuration handed to the capture pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParameters {
    pub role: StreamRole,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub controls: CameraControls,
}

impl CaptureParameters {
    pub fn viewfinder(controls: &CameraControls, outputs: &OutputSettings) -> Self {
        Self {
            role: StreamRole::Viewfinder,
            width: outputs.image_width,
            height: outputs.image_height,
            framerate: outputs.preview_fps,
            controls: controls.clone(),
        }
    }

    pub fn video(controls: &CameraControls, outputs: &OutputSettings) -> Self {
        Self {
            role: StreamRole::Video,
            width: outputs.video_width,
            height: outputs.video_height,
            framerate: outputs.video_fps,
            controls: controls.clone(),
        }
    }
}

/// Map a contrast/saturation/sharpness value from [-100, 100] to [0, 15.99].
///
/// Negative inputs map linearly onto [0, 1), zero is neutral (1.0) and positive inputs map
/// linearly onto (1, 15.99].
pub fn map_control_level(value: f32) -> f32 {
    let value = value.clamp(-100.0, 100.0);
    let mapped = if value < 0.0 {
        (value + 100.0) / 100.0
    } else if value == 0.0 {
        1.0
    } else {
        1.0 + value * (CONTROL_MAX - 1.0) / 100.0
    };
    mapped.clamp(0.0, CONTROL_MAX)
}

/// Map a brightness percentage in [0, 100] onto [-1, 1].
pub fn map_brightness(value: f32) -> f32 {
    value.clamp(0.0, 100.0) / 50.0 - 1.0
}

pub fn clamp_exposure_compensation(value: f32) -> f32 {
    value.clamp(-10.0, 10.0)
}

/// Convert a colour gain given in hundredths; negative gains are rejected.
pub fn map_colour_gain(value: f32) -> Result<f32> {
    if value < 0.0 {
        return Err(Error::invalid(format!("gain must not be negative, got {}", value)));
    }
    Ok(value / 100.0)
}

/// Map an ISO value onto an analogue gain multiplier.
pub fn map_iso(value: f32) -> f32 {
    value.clamp(100.0, 2000.0) / 100.0
}

/// Remap a legacy JPEG quality in [0, 100] onto the range the encoder actually uses.
///
/// [0, 10] maps onto [60, 85] and (10, 100] onto (85, 100].
pub fn map_jpeg_quality(value: i64) -> u8 {
    let q = value.clamp(0, 100) as f32;
    let mapped = if q <= 10.0 {
        60.0 + q * 2.5
    } else {
        85.0 + (q - 10.0) * 15.0 / 90.0
    };
    mapped.round() as u8
}

pub fn clamp_bitrate(value: i64) -> u32 {
    value.clamp(0, MAX_BITRATE as i64) as u32
}

/// Normalise a rotation to [0, 360) and reject anything other than 0 or 180 degrees.
pub fn normalize_rotation(degrees: i64) -> Result<u32> {
    let normalized = degrees.rem_euclid(360) as u32;
    match normalized {
        0 | 180 => Ok(normalized),
        other => Err(Error::UnsupportedTransform(format!(
            "rotation by {} degrees requires a transpose",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_control_level_mapping() {
        assert!(approx(map_control_level(50.0), 8.495));
        assert!(approx(map_control_level(-50.0), 0.5));
        assert!(approx(map_control_level(0.0), 1.0));
        assert!(approx(map_control_level(100.0), 15.99));
        assert!(approx(map_control_level(-100.0), 0.0));
        assert!(approx(map_control_level(250.0), 15.99));
        assert!(approx(map_control_level(-400.0), 0.0));
    }

    #[test]
    fn test_brightness_mapping() {
        assert!(approx(map_brightness(0.0), -1.0));
        assert!(approx(map_brightness(50.0), 0.0));
        assert!(approx(map_brightness(70.0), 0.4));
        assert!(approx(map_brightness(100.0), 1.0));
        assert!(approx(map_brightness(180.0), 1.0));
        assert!(approx(map_brightness(-3.0), -1.0));
    }

    #[test]
    fn test_gain_mappings() {
        assert!(approx(map_colour_gain(150.0).unwrap(), 1.5));
        assert!(map_colour_gain(-1.0).is_err());
        assert!(approx(map_iso(400.0), 4.0));
        assert!(approx(map_iso(50.0), 1.0));
        assert!(approx(map_iso(6400.0), 20.0));
        assert!(approx(clamp_exposure_compensation(-25.0), -10.0));
    }

    #[test]
    fn test_jpeg_quality_remap() {
        assert_eq!(map_jpeg_quality(0), 60);
        assert_eq!(map_jpeg_quality(4), 70);
        assert_eq!(map_jpeg_quality(10), 85);
        assert_eq!(map_jpeg_quality(55), 93);
        assert_eq!(map_jpeg_quality(100), 100);
        assert_eq!(map_jpeg_quality(-20), 60);
        assert_eq!(map_jpeg_quality(400), 100);
    }

    #[test]
    fn test_bitrate_clamp() {
        assert_eq!(clamp_bitrate(5_000_000), 5_000_000);
        assert_eq!(clamp_bitrate(-1), 0);
        assert_eq!(clamp_bitrate(90_000_000), MAX_BITRATE);
    }

    #[test]
    fn test_rotation() {
        assert_eq!(normalize_rotation(0).unwrap(), 0);
        assert_eq!(normalize_rotation(180).unwrap(), 180);
        assert_eq!(normalize_rotation(540).unwrap(), 180);
        assert_eq!(normalize_rotation(-180).unwrap(), 180);
        assert!(matches!(normalize_rotation(90), Err(Error::UnsupportedTransform(_))));
        assert!(matches!(normalize_rotation(-90), Err(Error::UnsupportedTransform(_))));
    }

    #[test]
    fn test_transform_composition() {
        let controls = CameraControls {
            rotation: 180,
            flip: 0b01,
            ..Default::default()
        };
        assert_eq!(controls.transform(), Transform { hflip: false, vflip: true });
        assert_eq!(Transform::from_bits(3).bits(), 3);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(AwbMode::parse("cloudy"), Some(AwbMode::Cloudy));
        assert_eq!(AwbMode::parse("Sun"), Some(AwbMode::Daylight));
        assert_eq!(AwbMode::parse("purple"), None);
        assert_eq!(MeteringMode::parse("center"), Some(MeteringMode::Centre));
        assert_eq!(MeteringMode::parse("backlit"), Some(MeteringMode::Average));
    }
}
