//! Configuration management for rpicam-mjpeg
//!
//! Settings come from a TOML file (every section optional) with command-line overrides applied
//! on top.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::params::{clamp_bitrate, OutputSettings, DEFAULT_PREVIEW_WIDTH};
use crate::capture::VideoCodec;
use crate::session::controller::ControllerSettings;

const CONFIG_ENV: &str = "RPICAM_MJPEG_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Camera device selection
    #[serde(default)]
    pub camera: CameraConfig,

    /// Output files and the control channel
    #[serde(default)]
    pub output: OutputConfig,

    /// Startup modes, stream geometry and encoder settings
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device node, or `stub://<name>` for the synthetic test pattern
    #[serde(default = "default_device")]
    pub device: String,

    /// FourCC requested from the device (`MJPG` or `YUYV`)
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    /// Number of driver buffers
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// How long to wait for a frame before restarting the pipeline (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Media root; relative templates are placed under it and thumbnails are only written
    /// for artifacts inside it
    #[serde(default)]
    pub media_path: Option<PathBuf>,

    /// Still image filename template
    #[serde(default = "default_image_path")]
    pub image_path: String,

    /// Video filename template
    #[serde(default = "default_video_path")]
    pub video_path: String,

    /// Preview image, overwritten in place
    #[serde(default = "default_preview_path")]
    pub preview_path: PathBuf,

    /// One-line status file
    #[serde(default)]
    pub status_file: Option<PathBuf>,

    /// Motion transitions are appended here, stdout when unset
    #[serde(default)]
    pub motion_output: Option<PathBuf>,

    /// Control FIFO
    #[serde(default)]
    pub control_file: Option<PathBuf>,

    /// Create the control FIFO if it does not exist
    #[serde(default)]
    pub create_fifo: bool,

    /// Artifact types (`v`ideo, `i`mage, `t`imelapse) that get thumbnails
    #[serde(default = "default_thumbnail_types")]
    pub thumbnail_types: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Modes active at startup: any of preview, still, video, motion
    #[serde(default)]
    pub streams: Vec<String>,

    #[serde(default = "default_width")]
    pub image_width: u32,

    #[serde(default = "default_height")]
    pub image_height: u32,

    #[serde(default = "default_width")]
    pub video_width: u32,

    #[serde(default = "default_height")]
    pub video_height: u32,

    #[serde(default = "default_fps")]
    pub video_fps: u32,

    #[serde(default = "default_fps")]
    pub preview_fps: u32,

    #[serde(default = "default_preview_width")]
    pub preview_width: u32,

    #[serde(default = "default_preview_quality")]
    pub preview_quality: u8,

    /// JPEG quality of stills and MJPEG video
    #[serde(default = "default_still_quality")]
    pub still_quality: u8,

    /// Video bitrate (bits per second)
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// `mjpeg` or `h264`
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Consecutive encoder start failures tolerated before giving up
    #[serde(default = "default_encoder_retries")]
    pub encoder_retries: u32,

    /// Duration of a recording started at launch, negative for unbounded (seconds)
    #[serde(default = "default_record_duration")]
    pub record_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Per-pixel luma difference counted as a change
    #[serde(default = "default_motion_threshold")]
    pub threshold: u8,

    /// Fraction of changed pixels that counts as motion
    #[serde(default = "default_min_changed_fraction")]
    pub min_changed_fraction: f32,

    /// Width frames are downscaled to before comparison
    #[serde(default = "default_analysis_width")]
    pub analysis_width: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write daily log files into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Days to keep old log files
    #[serde(default)]
    pub retention_days: Option<u64>,
}

// Default value functions
fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_pixel_format() -> String {
    "MJPG".to_string()
}

fn default_buffer_count() -> u32 {
    4
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_image_path() -> String {
    "im_%i_%Y%M%D_%h%m%s.jpg".to_string()
}

fn default_video_path() -> String {
    "vi_%v_%Y%M%D_%h%m%s.mjpeg".to_string()
}

fn default_preview_path() -> PathBuf {
    PathBuf::from("/dev/shm/mjpeg/cam.jpg")
}

fn default_thumbnail_types() -> String {
    "vit".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    25
}

fn default_preview_width() -> u32 {
    DEFAULT_PREVIEW_WIDTH
}

fn default_preview_quality() -> u8 {
    25
}

fn default_still_quality() -> u8 {
    85
}

fn default_bitrate() -> u32 {
    17_000_000
}

fn default_codec() -> String {
    "mjpeg".to_string()
}

fn default_encoder_retries() -> u32 {
    3
}

fn default_record_duration() -> i64 {
    -1
}

fn default_motion_threshold() -> u8 {
    25
}

fn default_min_changed_fraction() -> f32 {
    0.02
}

fn default_analysis_width() -> u32 {
    160
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            pixel_format: default_pixel_format(),
            buffer_count: default_buffer_count(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            media_path: None,
            image_path: default_image_path(),
            video_path: default_video_path(),
            preview_path: default_preview_path(),
            status_file: None,
            motion_output: None,
            control_file: None,
            create_fifo: false,
            thumbnail_types: default_thumbnail_types(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            image_width: default_width(),
            image_height: default_height(),
            video_width: default_width(),
            video_height: default_height(),
            video_fps: default_fps(),
            preview_fps: default_fps(),
            preview_width: default_preview_width(),
            preview_quality: default_preview_quality(),
            still_quality: default_still_quality(),
            bitrate: default_bitrate(),
            codec: default_codec(),
            encoder_retries: default_encoder_retries(),
            record_duration_secs: default_record_duration(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: default_motion_threshold(),
            min_changed_fraction: default_min_changed_fraction(),
            analysis_width: default_analysis_width(),
        }
    }
}

/// A mode that can be enabled at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Preview,
    Still,
    Video,
    Motion,
}

impl Stream {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "preview" => Some(Stream::Preview),
            "still" => Some(Stream::Still),
            "video" => Some(Stream::Video),
            "motion" => Some(Stream::Motion),
            _ => None,
        }
    }
}

/// Modes requested at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupModes {
    pub preview: bool,
    pub still: bool,
    pub video: bool,
    pub motion: bool,
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path (argument or `RPICAM_MJPEG_CONFIG`) must exist. A missing file at the
    /// default location yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let config_path = match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {:?}", path);
                }
                path
            }
            None => {
                let path = Self::default_config_path()?;
                if !path.exists() {
                    let mut config = Config::default();
                    config.config_path = Some(path);
                    return Ok(config);
                }
                path
            }
        };

        Self::from_file(&config_path)
    }

    /// Parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(config_path)
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("org", "rpicam-mjpeg", "rpicam-mjpeg")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Startup modes from `[capture] streams`
    pub fn startup_modes(&self) -> Result<StartupModes> {
        let mut modes = StartupModes::default();
        for name in &self.capture.streams {
            match Stream::parse(name) {
                Some(Stream::Preview) => modes.preview = true,
                Some(Stream::Still) => modes.still = true,
                Some(Stream::Video) => modes.video = true,
                Some(Stream::Motion) => modes.motion = true,
                None => bail!(
                    "Unknown stream {:?}, expected one of preview, still, video, motion",
                    name
                ),
            }
        }
        Ok(modes)
    }

    /// Check that the daemon has something to do
    pub fn validate(&self) -> Result<()> {
        let modes = self.startup_modes()?;
        if modes == StartupModes::default() && self.output.control_file.is_none() {
            bail!("Nothing to do: configure at least one stream or a control file");
        }
        self.video_codec()?;
        if self.camera.timeout_ms == 0 {
            bail!("[camera] timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn video_codec(&self) -> Result<VideoCodec> {
        VideoCodec::parse(&self.capture.codec)
            .with_context(|| format!("Unknown video codec {:?}", self.capture.codec))
    }

    /// Resolve everything the session controller needs
    pub fn controller_settings(&self) -> Result<ControllerSettings> {
        let out = &self.output;
        let duration = self.capture.record_duration_secs;
        Ok(ControllerSettings {
            image_template: out.image_path.clone(),
            video_template: out.video_path.clone(),
            media_root: out.media_path.clone(),
            preview_path: out.preview_path.clone(),
            status_file: out.status_file.clone(),
            motion_output: out.motion_output.clone(),
            thumbnail_types: out.thumbnail_types.clone(),
            codec: self.video_codec()?,
            encoder_retries: self.capture.encoder_retries,
            startup_duration: (duration > 0).then(|| Duration::from_secs(duration as u64)),
            modes: self.startup_modes()?,
            outputs: self.output_settings(),
            motion: self.motion.clone(),
        })
    }

    /// Initial output settings
    pub fn output_settings(&self) -> OutputSettings {
        let c = &self.capture;
        OutputSettings {
            image_width: c.image_width,
            image_height: c.image_height,
            video_width: c.video_width,
            video_height: c.video_height,
            video_fps: c.video_fps.max(1),
            preview_fps: c.preview_fps.max(1),
            preview_width: c.preview_width,
            preview_quality: c.preview_quality.clamp(1, 100),
            still_quality: c.still_quality.clamp(1, 100),
            bitrate: clamp_bitrate(c.bitrate as i64),
            divider: 1,
        }
    }
}

/// Command-line options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub streams: Vec<String>,
    pub video_path: Option<String>,
    pub image_path: Option<String>,
    pub preview_path: Option<PathBuf>,
    pub control_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub motion_output: Option<PathBuf>,
    pub media_path: Option<PathBuf>,
    pub device: Option<String>,
    pub verbose: bool,
    pub help: bool,
    pub write_config: bool,
}

impl CliOptions {
    /// Parse arguments, excluding the program name
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut opts = CliOptions::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            // Accept both `--flag value` and `--flag=value`
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };

            let mut value = || -> Result<String> {
                match inline.clone() {
                    Some(v) => Ok(v),
                    None => args
                        .next()
                        .with_context(|| format!("Missing value for {}", flag)),
                }
            };

            match flag.as_str() {
                "-h" | "--help" => opts.help = true,
                "-v" | "--verbose" => opts.verbose = true,
                "--write-config" => opts.write_config = true,
                "--config" => opts.config_path = Some(PathBuf::from(value()?)),
                "--stream" => opts
                    .streams
                    .extend(value()?.split(',').filter(|s| !s.is_empty()).map(str::to_string)),
                "--video_path" => opts.video_path = Some(value()?),
                "--image_path" => opts.image_path = Some(value()?),
                "--preview_path" => opts.preview_path = Some(PathBuf::from(value()?)),
                "--control_file" => opts.control_file = Some(PathBuf::from(value()?)),
                "--status_file" => opts.status_file = Some(PathBuf::from(value()?)),
                "--motion_output" => opts.motion_output = Some(PathBuf::from(value()?)),
                "--media_path" => opts.media_path = Some(PathBuf::from(value()?)),
                "--device" => opts.device = Some(value()?),
                other => bail!("Unknown argument {:?} (see --help)", other),
            }
        }

        Ok(opts)
    }

    /// Override configuration values with the ones given on the command line
    pub fn apply(&self, config: &mut Config) {
        if !self.streams.is_empty() {
            config.capture.streams = self.streams.clone();
        }
        if let Some(v) = &self.video_path {
            config.output.video_path = v.clone();
        }
        if let Some(v) = &self.image_path {
            config.output.image_path = v.clone();
        }
        if let Some(v) = &self.preview_path {
            config.output.preview_path = v.clone();
        }
        if let Some(v) = &self.control_file {
            config.output.control_file = Some(v.clone());
        }
        if let Some(v) = &self.status_file {
            config.output.status_file = Some(v.clone());
        }
        if let Some(v) = &self.motion_output {
            config.output.motion_output = Some(v.clone());
        }
        if let Some(v) = &self.media_path {
            config.output.media_path = Some(v.clone());
        }
        if let Some(v) = &self.device {
            config.camera.device = v.clone();
        }
    }
}
