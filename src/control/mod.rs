//! Control channel commands
//!
//! Each line on the control channel is `<verb> <args...>`. Verbs are the two-letter mnemonics
//! of the legacy web interface; see [`ControlCommand::parse`] for the argument contracts.

pub mod fifo;

use std::str::FromStr;

use crate::capture::params::{
    clamp_bitrate, clamp_exposure_compensation, map_brightness, map_colour_gain,
    map_control_level, map_iso, map_jpeg_quality, normalize_rotation, AwbMode, MeteringMode,
};
use crate::error::{Error, Result};

pub use fifo::ControlChannel;

/// A validated control command with its values already mapped to camera units
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// `im`: capture a still from the next viewfinder frame
    TakeStill,
    /// `ca 1 [seconds]` starts a recording, anything else stops it
    Record {
        start: bool,
        /// `None` records until stopped
        duration_secs: Option<u64>,
    },
    /// `pv quality width divider`
    Preview { quality: u8, width: u32, divider: u32 },
    /// `ro degrees`, normalised to 0 or 180
    Rotation(u32),
    /// `fl bits`
    Flip(u8),
    WhiteBalance(AwbMode),
    /// `md 0|1`
    Motion(bool),
    Metering(MeteringMode),
    Contrast(f32),
    Brightness(f32),
    Saturation(f32),
    Sharpness(f32),
    ExposureCompensation(f32),
    /// `ag red blue`
    ColourGains { red: f32, blue: f32 },
    /// `is iso`, as an analogue gain multiplier
    AnalogueGain(f32),
    /// `ss microseconds`, `None` for automatic exposure
    Shutter(Option<u32>),
    /// `qu quality`, already remapped for the encoder
    StillQuality(u8),
    /// `bi bps`
    Bitrate(u32),
    /// `px w h videoFps previewFps imgW imgH divider`
    Resolution {
        video_width: u32,
        video_height: u32,
        video_fps: u32,
        preview_fps: u32,
        image_width: u32,
        image_height: u32,
        divider: u32,
    },
    /// `sc`: rescan output directories and reset the counters
    SetCounts,
}

impl ControlCommand {
    /// Split a control line on whitespace into verb and arguments.
    ///
    /// Returns `None` for blank lines.
    pub fn tokenize(line: &str) -> Option<(&str, Vec<&str>)> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next()?;
        Some((verb, tokens.collect()))
    }

    /// Validate the arguments of `verb`.
    ///
    /// Returns `Ok(None)` for an unknown verb and `InvalidCommand` or `UnsupportedTransform`
    /// for bad arguments.
    pub fn parse(verb: &str, args: &[&str]) -> Result<Option<Self>> {
        let command = match verb {
            "im" => ControlCommand::TakeStill,
            "ca" => {
                let mode = required(verb, args, 0)?;
                let start = mode == "1";
                let duration_secs = match args.get(1) {
                    Some(raw) if start => {
                        let secs: i64 = number(verb, raw)?;
                        (secs > 0).then_some(secs as u64)
                    }
                    _ => None,
                };
                ControlCommand::Record {
                    start,
                    duration_secs,
                }
            }
            "pv" => {
                if args.len() < 3 {
                    return Err(Error::invalid(format!(
                        "pv expects quality, width and divider, got {} argument(s)",
                        args.len()
                    )));
                }
                let quality: i64 = arg(verb, args, 0)?;
                ControlCommand::Preview {
                    quality: quality.clamp(1, 100) as u8,
                    width: positive(verb, args, 1)?,
                    divider: positive(verb, args, 2)?,
                }
            }
            "ro" => {
                let degrees: i64 = optional(verb, args, 0)?.unwrap_or(0);
                ControlCommand::Rotation(normalize_rotation(degrees)?)
            }
            "fl" => {
                let bits: i64 = optional(verb, args, 0)?.unwrap_or(0);
                if !(0..=3).contains(&bits) {
                    return Err(Error::invalid(format!("fl expects 0-3, got {}", bits)));
                }
                ControlCommand::Flip(bits as u8)
            }
            "wb" => {
                let name = required(verb, args, 0)?;
                let mode = AwbMode::parse(name)
                    .ok_or_else(|| Error::invalid(format!("unknown white balance mode {:?}", name)))?;
                ControlCommand::WhiteBalance(mode)
            }
            "md" => ControlCommand::Motion(required(verb, args, 0)? == "1"),
            "mm" => {
                let name = required(verb, args, 0)?;
                let mode = MeteringMode::parse(name)
                    .ok_or_else(|| Error::invalid(format!("unknown metering mode {:?}", name)))?;
                ControlCommand::Metering(mode)
            }
            "co" => ControlCommand::Contrast(map_control_level(real(verb, args, 0)?)),
            "sa" => ControlCommand::Saturation(map_control_level(real(verb, args, 0)?)),
            "sh" => ControlCommand::Sharpness(map_control_level(real(verb, args, 0)?)),
            "br" => ControlCommand::Brightness(map_brightness(real(verb, args, 0)?)),
            "ec" => ControlCommand::ExposureCompensation(clamp_exposure_compensation(real(
                verb, args, 0,
            )?)),
            "ag" => ControlCommand::ColourGains {
                red: map_colour_gain(real(verb, args, 0)?)?,
                blue: map_colour_gain(real(verb, args, 1)?)?,
            },
            "is" => ControlCommand::AnalogueGain(map_iso(real(verb, args, 0)?)),
            "ss" => {
                let micros: i64 = arg(verb, args, 0)?;
                if micros < 0 {
                    return Err(Error::invalid(format!("ss expects a non-negative time, got {}", micros)));
                }
                ControlCommand::Shutter((micros > 0).then(|| micros.min(u32::MAX as i64) as u32))
            }
            "qu" => ControlCommand::StillQuality(map_jpeg_quality(arg(verb, args, 0)?)),
            "bi" => ControlCommand::Bitrate(clamp_bitrate(arg(verb, args, 0)?)),
            "px" => {
                if args.len() < 7 {
                    return Err(Error::invalid(format!(
                        "px expects 7 arguments, got {}",
                        args.len()
                    )));
                }
                ControlCommand::Resolution {
                    video_width: positive(verb, args, 0)?,
                    video_height: positive(verb, args, 1)?,
                    video_fps: positive(verb, args, 2)?,
                    preview_fps: positive(verb, args, 3)?,
                    image_width: positive(verb, args, 4)?,
                    image_height: positive(verb, args, 5)?,
                    divider: positive(verb, args, 6)?,
                }
            }
            "sc" => ControlCommand::SetCounts,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Whether applying the command needs the stop/reconfigure/restart cycle
    pub fn requires_restart(&self) -> bool {
        !matches!(
            self,
            ControlCommand::TakeStill
                | ControlCommand::Record { .. }
                | ControlCommand::Motion(_)
                | ControlCommand::SetCounts
        )
    }
}

fn required<'a>(verb: &str, args: &[&'a str], index: usize) -> Result<&'a str> {
    args.get(index).copied().ok_or_else(|| {
        Error::invalid(format!("{} expects at least {} argument(s)", verb, index + 1))
    })
}

fn number<T: FromStr>(verb: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::invalid(format!("{}: {:?} is not a valid number", verb, raw)))
}

fn arg<T: FromStr>(verb: &str, args: &[&str], index: usize) -> Result<T> {
    number(verb, required(verb, args, index)?)
}

/// A finite decimal argument; `nan` and `inf` parse as `f32` but are rejected
fn real(verb: &str, args: &[&str], index: usize) -> Result<f32> {
    let value: f32 = arg(verb, args, index)?;
    if !value.is_finite() {
        return Err(Error::invalid(format!("{}: {} is not a finite number", verb, value)));
    }
    Ok(value)
}

fn optional<T: FromStr>(verb: &str, args: &[&str], index: usize) -> Result<Option<T>> {
    args.get(index).map(|raw| number(verb, raw)).transpose()
}

fn positive(verb: &str, args: &[&str], index: usize) -> Result<u32> {
    let value: i64 = arg(verb, args, index)?;
    if value <= 0 || value > u32::MAX as i64 {
        return Err(Error::invalid(format!(
            "{}: argument {} must be positive, got {}",
            verb,
            index + 1,
            value
        )));
    }
    Ok(value as u32)
}
