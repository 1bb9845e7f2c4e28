//! Test-pattern pipeline for `stub://` devices
//!
//! Produces RGB frames with a vertical bar sweeping across a gradient at the configured
//! frame rate, so the daemon can run end-to-end without camera hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{
    CaptureParameters, CapturePipeline, CompletedFrame, CompletedRequest, PipelineEvent,
    PixelFormat, StreamInfo, StreamRole,
};
use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::session::ShutdownToken;

const BAR_WIDTH: u32 = 16;

pub struct SyntheticPipeline {
    name: String,
    shutdown: ShutdownToken,
    streams: Vec<CaptureParameters>,
    running: bool,
    epoch: Instant,
    sequence: u64,
}

impl SyntheticPipeline {
    pub fn new(config: &CameraConfig, shutdown: ShutdownToken) -> Self {
        Self {
            name: format!("synthetic ({})", config.device),
            shutdown,
            streams: Vec::new(),
            running: false,
            epoch: Instant::now(),
            sequence: 0,
        }
    }

    fn stream(&self, role: StreamRole) -> Option<&CaptureParameters> {
        self.streams.iter().find(|s| s.role == role)
    }

    fn render(&self, params: &CaptureParameters, timestamp_ns: i64) -> CompletedFrame {
        let (width, height) = (params.width, params.height);
        let bar_x = (self.sequence as u32 * 4) % width.max(1);
        let transform = params.controls.transform();

        let mut data = vec![0u8; width as usize * height as usize * 3];
        for (i, px) in data.chunks_exact_mut(3).enumerate() {
            let mut x = i as u32 % width;
            let mut y = i as u32 / width;
            if transform.hflip {
                x = width - 1 - x;
            }
            if transform.vflip {
                y = height - 1 - y;
            }
            if x >= bar_x && x < bar_x + BAR_WIDTH {
                px.copy_from_slice(&[255, 255, 255]);
            } else {
                px[0] = (x * 255 / width.max(1)) as u8;
                px[1] = (y * 255 / height.max(1)) as u8;
                px[2] = 96;
            }
        }

        CompletedFrame {
            data: Arc::from(data),
            info: StreamInfo {
                width,
                height,
                stride: width * 3,
                pixel_format: PixelFormat::Rgb24,
            },
            sensor_timestamp_ns: Some(timestamp_ns),
            buffer_timestamp_ns: timestamp_ns,
            sequence: self.sequence,
        }
    }
}

impl CapturePipeline for SyntheticPipeline {
    fn configure(&mut self, streams: &[CaptureParameters]) -> Result<()> {
        if self.running {
            return Err(Error::Camera("cannot configure a running pipeline".to_string()));
        }
        for s in streams {
            if s.width == 0 || s.height == 0 || s.framerate == 0 {
                return Err(Error::Camera(format!("invalid {:?} stream {:?}", s.role, s)));
            }
            debug!(
                "Configured {:?} stream {}x{} @ {} fps",
                s.role, s.width, s.height, s.framerate
            );
        }
        self.streams = streams.to_vec();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::Camera("pipeline is not configured".to_string()));
        }
        self.running = true;
        info!("{} started", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn teardown(&mut self) {
        self.running = false;
        self.streams.clear();
    }

    fn wait(&mut self) -> Result<PipelineEvent> {
        if self.shutdown.is_requested() {
            return Ok(PipelineEvent::Quit);
        }
        if !self.running {
            return Err(Error::Camera("wait on a stopped pipeline".to_string()));
        }

        let fps = self
            .stream(StreamRole::Viewfinder)
            .or_else(|| self.streams.first())
            .map(|s| s.framerate.max(1))
            .unwrap_or(25);
        std::thread::sleep(Duration::from_secs(1) / fps);

        if self.shutdown.is_requested() {
            return Ok(PipelineEvent::Quit);
        }

        self.sequence += 1;
        let timestamp_ns = self.epoch.elapsed().as_nanos() as i64;
        let request = CompletedRequest {
            viewfinder: self
                .stream(StreamRole::Viewfinder)
                .map(|p| self.render(p, timestamp_ns)),
            video: self
                .stream(StreamRole::Video)
                .map(|p| self.render(p, timestamp_ns)),
        };
        Ok(PipelineEvent::FrameComplete(request))
    }

    fn camera_model(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraControls, OutputSettings};

    fn pipeline() -> (SyntheticPipeline, ShutdownToken) {
        let token = ShutdownToken::new();
        let config = CameraConfig {
            device: "stub://test".into(),
            ..Default::default()
        };
        (SyntheticPipeline::new(&config, token.clone()), token)
    }

    fn outputs() -> OutputSettings {
        OutputSettings {
            image_width: 32,
            image_height: 16,
            video_width: 16,
            video_height: 8,
            preview_fps: 200,
            video_fps: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_frames_for_configured_streams() {
        let (mut p, _token) = pipeline();
        let controls = CameraControls::default();
        p.configure(&[
            CaptureParameters::viewfinder(&controls, &outputs()),
            CaptureParameters::video(&controls, &outputs()),
        ])
        .unwrap();
        p.start().unwrap();

        match p.wait().unwrap() {
            PipelineEvent::FrameComplete(req) => {
                let vf = req.viewfinder.unwrap();
                assert_eq!((vf.info.width, vf.info.height), (32, 16));
                assert_eq!(vf.data.len(), 32 * 16 * 3);
                let video = req.video.unwrap();
                assert_eq!((video.info.width, video.info.height), (16, 8));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_wait_after_teardown_fails() {
        let (mut p, _token) = pipeline();
        p.configure(&[CaptureParameters::viewfinder(&CameraControls::default(), &outputs())])
            .unwrap();
        p.start().unwrap();
        p.stop().unwrap();
        p.teardown();
        assert!(p.wait().is_err());
        assert!(p.start().is_err());
    }

    #[test]
    fn test_shutdown_yields_quit() {
        let (mut p, token) = pipeline();
        token.request();
        assert!(matches!(p.wait().unwrap(), PipelineEvent::Quit));
    }
}
