//! Capture pipeline interface
//!
//! The camera driver is an external collaborator. The controller only needs to configure it
//! with one `CaptureParameters` per active stream, start and stop it, tear its buffers down,
//! and block waiting for the next `PipelineEvent`.
//!
//! Two pipelines are built in:
//! - `stub://...` devices select a synthetic test-pattern pipeline
//! - anything else opens a V4L2 device (Linux only)

pub mod image_io;
pub mod params;
pub mod recording;
mod synthetic;
#[cfg(target_os = "linux")]
mod v4l2;

use std::sync::Arc;

use crate::config::CameraConfig;
use crate::error::Result;
use crate::session::ShutdownToken;

pub use params::{CameraControls, CaptureParameters, OutputSettings, StreamRole};
pub use recording::{MjpegEncoderFactory, RecordingSession, VideoCodec, VideoParams};
pub use synthetic::SyntheticPipeline;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed YUV 4:2:2
    Yuyv,
    /// One JPEG image per buffer
    Mjpeg,
}

impl PixelFormat {
    /// Parse a V4L2 FourCC such as `MJPG` or `YUYV`.
    pub fn from_fourcc(fourcc: &str) -> Option<Self> {
        match fourcc.to_ascii_uppercase().as_str() {
            "MJPG" => Some(PixelFormat::Mjpeg),
            "YUYV" => Some(PixelFormat::Yuyv),
            "RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Rgb24 => b"RGB3",
        }
    }
}

/// Geometry and layout of a configured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes per row (0 for compressed formats)
    pub stride: u32,
    pub pixel_format: PixelFormat,
}

/// A completed frame buffer plus its metadata
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub data: Arc<[u8]>,
    pub info: StreamInfo,
    /// Capture timestamp reported by the sensor, if any (nanoseconds)
    pub sensor_timestamp_ns: Option<i64>,
    /// Time the buffer was dequeued (nanoseconds)
    pub buffer_timestamp_ns: i64,
    pub sequence: u64,
}

impl CompletedFrame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Frame timestamp in microseconds.
    ///
    /// The sensor timestamp is preferred; the buffer arrival time is the fallback.
    pub fn timestamp_us(&self) -> i64 {
        match self.sensor_timestamp_ns {
            Some(ts) => ts / 1000,
            None => self.buffer_timestamp_ns / 1000,
        }
    }
}

/// All buffers delivered for one capture request
#[derive(Debug, Clone, Default)]
pub struct CompletedRequest {
    pub viewfinder: Option<CompletedFrame>,
    pub video: Option<CompletedFrame>,
}

/// Events produced while waiting on the pipeline
#[derive(Debug)]
pub enum PipelineEvent {
    /// A request completed
    FrameComplete(CompletedRequest),
    /// No frame arrived within the device timeout
    Timeout,
    /// Shutdown was requested
    Quit,
}

/// Capture pipeline collaborator.
///
/// Parameters can only be applied through stop → teardown → configure → start; the
/// pipeline does not support updating controls while streaming.
pub trait CapturePipeline {
    /// Negotiate formats and allocate buffers for the given streams.
    fn configure(&mut self, streams: &[CaptureParameters]) -> Result<()>;

    /// Start streaming.
    fn start(&mut self) -> Result<()>;

    /// Stop streaming. Stopping a stopped pipeline is a no-op.
    fn stop(&mut self) -> Result<()>;

    /// Release all buffer allocations made by `configure`.
    fn teardown(&mut self);

    /// Block until the next request completes, the device times out or shutdown is requested.
    fn wait(&mut self) -> Result<PipelineEvent>;

    /// Human-readable camera model, used in log lines.
    fn camera_model(&self) -> &str;
}

/// Create the pipeline for the configured device
pub fn create_pipeline(
    config: &CameraConfig,
    shutdown: ShutdownToken,
) -> Result<Box<dyn CapturePipeline>> {
    if config.device.starts_with("stub://") {
        tracing::info!("Using synthetic capture pipeline for {}", config.device);
        return Ok(Box::new(SyntheticPipeline::new(config, shutdown)));
    }

    #[cfg(target_os = "linux")]
    {
        tracing::info!("Using V4L2 capture pipeline for {}", config.device);
        Ok(Box::new(v4l2::V4l2Pipeline::open(config, shutdown)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::error::Error::Camera(format!(
            "device {} requires V4L2, which is only available on Linux",
            config.device
        )))
    }
}

/// Check that a frame carries data, logging the ones that do not.
pub(crate) fn usable(frame: &CompletedFrame, role: StreamRole) -> bool {
    if frame.is_empty() {
        tracing::error!("{:?} buffer #{} is empty, skipping", role, frame.sequence);
        return false;
    }
    true
}
