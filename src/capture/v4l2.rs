//! V4L2 capture pipeline
//!
//! A V4L2 node delivers a single stream, so the viewfinder geometry is negotiated with the
//! device and the same buffer is handed to the video role when one is configured. Frames are
//! dequeued on a capture thread and passed to the controller over a bounded channel, which
//! lets `wait` honour the device timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rscam::Camera;
use tracing::{debug, error, info, warn};

use super::{
    CaptureParameters, CapturePipeline, CompletedFrame, CompletedRequest, PipelineEvent,
    PixelFormat, StreamInfo, StreamRole,
};
use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::session::ShutdownToken;

/// Frames buffered between the capture thread and the loop
const CHANNEL_DEPTH: usize = 2;

/// Slice in which `wait` re-checks the shutdown token
const POLL_SLICE: Duration = Duration::from_millis(100);

struct CaptureThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    frames: Receiver<std::io::Result<CompletedFrame>>,
}

pub struct V4l2Pipeline {
    device: String,
    pixel_format: PixelFormat,
    buffer_count: u32,
    timeout: Duration,
    shutdown: ShutdownToken,
    viewfinder: Option<StreamInfo>,
    framerate: u32,
    with_video: bool,
    worker: Option<CaptureThread>,
}

impl V4l2Pipeline {
    /// Check that the device can be opened and remember its settings
    pub fn open(config: &CameraConfig, shutdown: ShutdownToken) -> Result<Self> {
        let pixel_format = PixelFormat::from_fourcc(&config.pixel_format).ok_or_else(|| {
            Error::Camera(format!("unsupported pixel format {:?}", config.pixel_format))
        })?;

        Camera::new(&config.device)
            .map_err(|e| Error::Camera(format!("failed to open {}: {}", config.device, e)))?;
        info!("Opened camera {}", config.device);

        Ok(Self {
            device: config.device.clone(),
            pixel_format,
            buffer_count: config.buffer_count.max(2),
            timeout: Duration::from_millis(config.timeout_ms),
            shutdown,
            viewfinder: None,
            framerate: 0,
            with_video: false,
            worker: None,
        })
    }

    fn spawn(&self, info: StreamInfo) -> Result<CaptureThread> {
        let mut camera = Camera::new(&self.device)
            .map_err(|e| Error::Camera(format!("failed to open {}: {}", self.device, e)))?;

        camera
            .start(&rscam::Config {
                interval: (1, self.framerate.max(1)),
                resolution: (info.width, info.height),
                format: self.pixel_format.fourcc(),
                field: rscam::FIELD_NONE,
                nbuffers: self.buffer_count,
            })
            .map_err(|e| Error::Camera(format!("failed to start {}: {}", self.device, e)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = sync_channel(CHANNEL_DEPTH);
        let thread_stop = stop.clone();
        let device = self.device.clone();

        let handle = thread::spawn(move || {
            let mut sequence = 0u64;
            while !thread_stop.load(Ordering::SeqCst) {
                let frame = camera.capture().map(|frame| {
                    sequence += 1;
                    let timestamp_ns = frame.get_timestamp() as i64 * 1000;
                    CompletedFrame {
                        data: Arc::from(&frame[..]),
                        info: StreamInfo {
                            width: frame.resolution.0,
                            height: frame.resolution.1,
                            ..info
                        },
                        sensor_timestamp_ns: None,
                        buffer_timestamp_ns: timestamp_ns,
                        sequence,
                    }
                });
                let failed = frame.is_err();
                if tx.send(frame).is_err() || failed {
                    break;
                }
            }
            if let Err(e) = camera.stop() {
                warn!("Failed to stop streaming on {}: {}", device, e);
            }
            debug!("Capture thread for {} exited", device);
        });

        Ok(CaptureThread {
            handle,
            stop,
            frames: rx,
        })
    }
}

impl CapturePipeline for V4l2Pipeline {
    fn configure(&mut self, streams: &[CaptureParameters]) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::Camera("cannot configure a running pipeline".to_string()));
        }

        let viewfinder = streams
            .iter()
            .find(|s| s.role == StreamRole::Viewfinder)
            .or_else(|| streams.first())
            .ok_or_else(|| Error::Camera("no stream to configure".to_string()))?;

        let stride = match self.pixel_format {
            PixelFormat::Mjpeg => 0,
            PixelFormat::Yuyv => viewfinder.width * 2,
            PixelFormat::Rgb24 => viewfinder.width * 3,
        };
        self.viewfinder = Some(StreamInfo {
            width: viewfinder.width,
            height: viewfinder.height,
            stride,
            pixel_format: self.pixel_format,
        });
        self.framerate = viewfinder.framerate;
        self.with_video = streams.iter().any(|s| s.role == StreamRole::Video);

        let controls = &viewfinder.controls;
        debug!(
            "Controls for {}: brightness {:.2}, contrast {:.2}, saturation {:.2}, transform {:?}",
            self.device,
            controls.brightness,
            controls.contrast,
            controls.saturation,
            controls.transform()
        );
        info!(
            "Configured {} for {}x{} @ {} fps{}",
            self.device,
            viewfinder.width,
            viewfinder.height,
            viewfinder.framerate,
            if self.with_video { " with video" } else { "" }
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let info = self
            .viewfinder
            .ok_or_else(|| Error::Camera("pipeline is not configured".to_string()))?;
        self.worker = Some(self.spawn(info)?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::SeqCst);
        // Unblock a capture thread waiting on a full channel
        drop(worker.frames);

        let deadline = Instant::now() + self.timeout;
        while !worker.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Capture thread for {} did not stop in time, detaching it", self.device);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        if worker.handle.join().is_err() {
            error!("Capture thread for {} panicked", self.device);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop {} during teardown: {}", self.device, e);
        }
        self.viewfinder = None;
        self.with_video = false;
    }

    fn wait(&mut self) -> Result<PipelineEvent> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(Error::Camera("wait on a stopped pipeline".to_string()));
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            if self.shutdown.is_requested() {
                return Ok(PipelineEvent::Quit);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(PipelineEvent::Timeout);
            }

            match worker.frames.recv_timeout(remaining.min(POLL_SLICE)) {
                Ok(Ok(frame)) => {
                    let video = self.with_video.then(|| frame.clone());
                    return Ok(PipelineEvent::FrameComplete(CompletedRequest {
                        viewfinder: Some(frame),
                        video,
                    }));
                }
                Ok(Err(e)) => {
                    return Err(Error::Camera(format!("capture on {} failed: {}", self.device, e)))
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Camera(format!("capture thread for {} exited", self.device)))
                }
            }
        }
    }

    fn camera_model(&self) -> &str {
        &self.device
    }
}

impl Drop for V4l2Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
