//! Session controller: command dispatch and the frame loop
//!
//! The controller owns every piece of mutable session state and is driven from a single
//! thread. Each loop iteration:
//!
//! 1. polls the control channel for one command and applies it
//! 2. writes the status file
//! 3. enforces the shutdown request and the recording duration budget
//! 4. waits for the next pipeline event and routes the completed frames
//!
//! Camera parameter changes are applied with a full stop → teardown → configure → start cycle.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::counters::recover_count;
use super::status::{MotionReporter, StatusReporter, ThumbnailWriter};
use super::template::render_path;
use super::{Clock, ModeState, ShutdownToken, SystemClock};
use crate::capture::image_io::{save_preview, save_still};
use crate::capture::{
    self, CameraControls, CaptureParameters, CapturePipeline, CompletedFrame, CompletedRequest,
    MjpegEncoderFactory, OutputSettings, PipelineEvent, RecordingSession,
    StreamRole, VideoCodec, VideoParams,
};
use crate::config::{MotionConfig, StartupModes};
use crate::control::{ControlChannel, ControlCommand};
use crate::error::{Error, Result};
use crate::motion::{FrameDiffDetector, MotionDetector};

/// Static settings of a session, resolved from the configuration at startup
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub image_template: String,
    pub video_template: String,
    pub media_root: Option<PathBuf>,
    pub preview_path: PathBuf,
    pub status_file: Option<PathBuf>,
    pub motion_output: Option<PathBuf>,
    pub thumbnail_types: String,
    pub codec: VideoCodec,
    /// Consecutive encoder start failures tolerated
    pub encoder_retries: u32,
    /// Budget of a recording started at launch
    pub startup_duration: Option<Duration>,
    pub modes: StartupModes,
    pub outputs: OutputSettings,
    pub motion: MotionConfig,
}

/// Whether the frame loop should keep running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

pub struct SessionController {
    settings: ControllerSettings,
    controls: CameraControls,
    outputs: OutputSettings,
    mode: ModeState,
    recording: RecordingSession,
    image_count: u32,
    video_count: u32,
    pipeline: Box<dyn CapturePipeline>,
    control: Option<ControlChannel>,
    detector: Box<dyn MotionDetector>,
    motion: MotionReporter,
    status: StatusReporter,
    thumbnails: ThumbnailWriter,
    clock: Box<dyn Clock>,
    shutdown: ShutdownToken,
    /// Output of the armed recording, fixed when recording starts
    video_output: Option<PathBuf>,
    record_started: Option<Instant>,
    record_budget: Option<Duration>,
    encoder_failures: u32,
    /// The running configuration includes a video stream
    configured_video: bool,
    streaming: bool,
}

impl SessionController {
    pub fn new(
        settings: ControllerSettings,
        pipeline: Box<dyn CapturePipeline>,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let motion = MotionReporter::open(settings.motion_output.as_deref())?;
        let modes = settings.modes;

        Ok(Self {
            controls: CameraControls::default(),
            outputs: settings.outputs.clone(),
            mode: ModeState::new(modes.preview, modes.still, modes.video, modes.motion),
            recording: RecordingSession::new(Box::new(MjpegEncoderFactory)),
            image_count: 1,
            video_count: 1,
            pipeline,
            control: None,
            detector: Box::new(FrameDiffDetector::new(&settings.motion)),
            motion,
            status: StatusReporter::new(settings.status_file.clone()),
            thumbnails: ThumbnailWriter::new(
                settings.media_root.clone(),
                settings.thumbnail_types.clone(),
                settings.preview_path.clone(),
            ),
            clock: Box::new(SystemClock),
            shutdown,
            video_output: None,
            record_started: None,
            record_budget: None,
            encoder_failures: 0,
            configured_video: false,
            streaming: false,
            settings,
        })
    }

    pub fn with_control(mut self, channel: ControlChannel) -> Self {
        self.control = Some(channel);
        self
    }

    /// Run the session until shutdown, a quit event or nothing is left to do.
    ///
    /// A fatal error is recorded as the sticky status error and written to the status file
    /// before it is returned.
    pub fn run(&mut self) -> Result<()> {
        info!("Starting session on {}", self.pipeline.camera_model());

        let result = match self.start() {
            Ok(()) => self.run_loop(),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("Session failed: {}", e);
            self.mode.set_error(e.to_string());
            if let Err(write_err) = self.status.write(&self.mode.status()) {
                warn!("Failed to write status: {}", write_err);
            }
        }

        self.close();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        while self.step()? == LoopControl::Continue {}
        info!("Frame loop finished");
        Ok(())
    }

    /// Recover counters, configure the pipeline and arm a startup recording
    pub fn start(&mut self) -> Result<()> {
        self.rescan_counters();
        self.reconfigure()?;

        if self.mode.video_active() {
            self.mode.set_video(false);
            self.start_recording(self.settings.startup_duration)?;
        }
        Ok(())
    }

    /// One loop iteration
    pub fn step(&mut self) -> Result<LoopControl> {
        self.poll_control()?;

        self.status.write(&self.mode.status())?;

        if self.shutdown.is_requested() {
            info!("Shutdown requested");
            self.stop_recording();
            return Ok(LoopControl::Exit);
        }

        if self.mode.video_active() {
            if let (Some(started), Some(budget)) = (self.record_started, self.record_budget) {
                let elapsed = self.clock.now().saturating_duration_since(started);
                if elapsed >= budget {
                    info!("Recording duration of {:?} reached", budget);
                    self.stop_recording();
                }
            }
        }

        if !self.mode.any_active() && self.control.is_none() {
            info!("No active mode and no control channel, exiting");
            return Ok(LoopControl::Exit);
        }

        match self.pipeline.wait()? {
            PipelineEvent::Timeout => {
                error!(
                    "Device timeout on {}, restarting capture",
                    self.pipeline.camera_model()
                );
                self.pipeline.stop()?;
                self.pipeline.start()?;
                Ok(LoopControl::Continue)
            }
            PipelineEvent::Quit => {
                info!("Quit event received");
                self.stop_recording();
                Ok(LoopControl::Exit)
            }
            PipelineEvent::FrameComplete(request) => {
                self.route(request)?;
                Ok(LoopControl::Continue)
            }
        }
    }

    fn poll_control(&mut self) -> Result<()> {
        let Some(channel) = self.control.as_mut() else {
            return Ok(());
        };
        match channel.poll_line()? {
            Some(line) => self.handle_line(&line),
            None => Ok(()),
        }
    }

    /// Parse and apply one control line.
    ///
    /// Unknown verbs and invalid arguments are reported and ignored; other failures are
    /// returned.
    pub fn handle_line(&mut self, line: &str) -> Result<()> {
        let Some((verb, args)) = ControlCommand::tokenize(line) else {
            return Ok(());
        };

        let result = match ControlCommand::parse(verb, &args) {
            Ok(Some(command)) => self.apply(command),
            Ok(None) => {
                println!("Unknown command: {}", line.trim());
                warn!("Ignoring unknown command {:?}", verb);
                Ok(())
            }
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_command_error() => {
                warn!("Rejected command {:?}: {}", line.trim(), e);
                Ok(())
            }
            other => other,
        }
    }

    /// Apply a validated command
    pub fn apply(&mut self, command: ControlCommand) -> Result<()> {
        debug!("Applying {:?}", command);
        let restart = command.requires_restart();
        let enables_preview = matches!(command, ControlCommand::Preview { .. });

        match command {
            ControlCommand::TakeStill => {
                self.mode.set_still(true);
                info!("Still capture armed");
            }
            ControlCommand::Record {
                start,
                duration_secs,
            } => {
                if start && !self.mode.video_active() {
                    self.start_recording(duration_secs.map(Duration::from_secs))?;
                } else if self.mode.video_active() {
                    self.stop_recording();
                } else {
                    debug!("No recording to stop");
                }
            }
            ControlCommand::Preview {
                quality,
                width,
                divider,
            } => {
                self.outputs.preview_quality = quality;
                self.outputs.preview_width = width;
                self.outputs.divider = divider;
            }
            ControlCommand::Rotation(degrees) => self.controls.rotation = degrees,
            ControlCommand::Flip(bits) => self.controls.flip = bits,
            ControlCommand::WhiteBalance(awb) => self.controls.awb = awb,
            ControlCommand::Motion(active) => {
                self.mode.set_motion(active);
                if active {
                    self.motion.reset();
                    self.detector.reset();
                }
                info!("Motion detection {}", if active { "enabled" } else { "disabled" });
            }
            ControlCommand::Metering(metering) => self.controls.metering = metering,
            ControlCommand::Contrast(v) => self.controls.contrast = v,
            ControlCommand::Brightness(v) => self.controls.brightness = v,
            ControlCommand::Saturation(v) => self.controls.saturation = v,
            ControlCommand::Sharpness(v) => self.controls.sharpness = v,
            ControlCommand::ExposureCompensation(v) => self.controls.exposure_compensation = v,
            ControlCommand::ColourGains { red, blue } => self.controls.awb_gains = Some((red, blue)),
            ControlCommand::AnalogueGain(gain) => self.controls.analogue_gain = Some(gain),
            ControlCommand::Shutter(micros) => self.controls.shutter_us = micros,
            ControlCommand::StillQuality(quality) => self.outputs.still_quality = quality,
            ControlCommand::Bitrate(bps) => self.outputs.bitrate = bps,
            ControlCommand::Resolution {
                video_width,
                video_height,
                video_fps,
                preview_fps,
                image_width,
                image_height,
                divider,
            } => {
                self.outputs.video_width = video_width;
                self.outputs.video_height = video_height;
                self.outputs.video_fps = video_fps;
                self.outputs.preview_fps = preview_fps;
                self.outputs.image_width = image_width;
                self.outputs.image_height = image_height;
                self.outputs.divider = divider;
            }
            ControlCommand::SetCounts => self.rescan_counters(),
        }

        if restart {
            self.reconfigure()?;
        }

        // The preview only starts once the new settings are live
        if enables_preview {
            self.mode.set_preview(true);
        }
        Ok(())
    }

    /// Stop, tear down, configure and restart the pipeline with the current parameters
    fn reconfigure(&mut self) -> Result<()> {
        if self.streaming {
            self.pipeline.stop()?;
            self.streaming = false;
        }
        self.pipeline.teardown();

        let streams = self.stream_parameters();
        self.pipeline.configure(&streams)?;
        self.pipeline.start()?;
        self.streaming = true;
        self.configured_video = streams.iter().any(|s| s.role == StreamRole::Video);

        debug!("Pipeline restarted with {} stream(s)", streams.len());
        Ok(())
    }

    fn stream_parameters(&self) -> Vec<CaptureParameters> {
        let mut streams = vec![CaptureParameters::viewfinder(&self.controls, &self.outputs)];
        if self.mode.video_active() {
            streams.push(CaptureParameters::video(&self.controls, &self.outputs));
        }
        streams
    }

    fn start_recording(&mut self, budget: Option<Duration>) -> Result<()> {
        let output = render_path(
            &self.settings.video_template,
            self.settings.media_root.as_deref(),
            self.clock.wall(),
            self.image_count,
            self.video_count,
        );
        info!(
            "Recording to {:?} ({})",
            output,
            match budget {
                Some(b) => format!("{} s", b.as_secs()),
                None => "until stopped".to_string(),
            }
        );

        self.mode.set_video(true);
        self.video_output = Some(output);
        self.record_started = Some(self.clock.now());
        self.record_budget = budget;
        self.encoder_failures = 0;

        if !self.configured_video {
            self.reconfigure()?;
        }
        Ok(())
    }

    /// Finalize the recording session and clear video mode
    fn stop_recording(&mut self) {
        if let Some(path) = self.recording.finalize() {
            self.write_thumbnail(&path, 'v', self.video_count);
            self.video_count += 1;
        }
        if self.mode.video_active() {
            info!("Recording stopped");
        }
        self.mode.set_video(false);
        self.video_output = None;
        self.record_started = None;
        self.record_budget = None;
    }

    fn route(&mut self, request: CompletedRequest) -> Result<()> {
        if let Some(frame) = request.viewfinder {
            if capture::usable(&frame, StreamRole::Viewfinder) {
                self.handle_viewfinder(&frame)?;
            }
        }

        if let Some(frame) = request.video {
            if self.mode.video_active() {
                self.handle_video(&frame)?;
            }
        }
        Ok(())
    }

    fn handle_viewfinder(&mut self, frame: &CompletedFrame) -> Result<()> {
        if self.mode.still_active() {
            skip_bad_frame(self.take_still(frame), "still", frame)?;
        } else if self.mode.preview_active() || self.mode.multi_active() {
            if let Err(e) = save_preview(
                frame,
                &self.settings.preview_path,
                self.outputs.preview_width,
                self.outputs.preview_quality,
            ) {
                error!("Failed to write preview {:?}: {}", self.settings.preview_path, e);
            }
        }

        if self.mode.motion_active() {
            if let Some(detected) = skip_bad_frame(self.detector.detect(frame), "motion", frame)? {
                self.motion.report(detected)?;
            }
        }
        Ok(())
    }

    fn take_still(&mut self, frame: &CompletedFrame) -> Result<()> {
        let path = render_path(
            &self.settings.image_template,
            self.settings.media_root.as_deref(),
            self.clock.wall(),
            self.image_count,
            self.video_count,
        );
        save_still(frame, &path, self.outputs.still_quality)?;
        info!("Still #{} saved to {:?}", self.image_count, path);

        self.write_thumbnail(&path, 'i', self.image_count);
        self.image_count += 1;
        self.mode.set_still(false);
        Ok(())
    }

    fn handle_video(&mut self, frame: &CompletedFrame) -> Result<()> {
        if !self.recording.is_armed() {
            let Some(output) = self.video_output.clone() else {
                return Ok(());
            };
            let params = VideoParams {
                codec: self.settings.codec,
                bitrate: self.outputs.bitrate,
                framerate: self.outputs.video_fps,
                quality: self.outputs.still_quality,
                output,
            };

            match self.recording.ensure_started(&frame.info, &params) {
                Ok(()) => self.encoder_failures = 0,
                Err(Error::EncoderInit(msg)) => {
                    self.encoder_failures += 1;
                    if self.encoder_failures > self.settings.encoder_retries {
                        return Err(Error::EncoderUnavailable {
                            attempts: self.encoder_failures,
                        });
                    }
                    warn!(
                        "Encoder start failed ({}/{}): {}",
                        self.encoder_failures, self.settings.encoder_retries, msg
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        skip_bad_frame(self.recording.feed(frame), "video", frame)?;
        Ok(())
    }

    fn write_thumbnail(&self, artifact: &std::path::Path, kind: char, count: u32) {
        if let Err(e) = self.thumbnails.write(artifact, kind, count) {
            warn!("Failed to write thumbnail for {:?}: {}", artifact, e);
        }
    }

    /// Reset both counters from the thumbnails in the output directories
    fn rescan_counters(&mut self) {
        let now = self.clock.wall();
        let media_root = self.settings.media_root.as_deref();

        let image_example = render_path(&self.settings.image_template, media_root, now, 0, 0);
        let video_example = render_path(&self.settings.video_template, media_root, now, 0, 0);

        self.image_count = recover_count(&image_example, "it") + 1;
        self.video_count = recover_count(&video_example, "v") + 1;
        info!(
            "Next image #{}, next video #{}",
            self.image_count, self.video_count
        );
    }

    /// Finalize any recording and release the pipeline
    fn close(&mut self) {
        self.stop_recording();
        if self.streaming {
            if let Err(e) = self.pipeline.stop() {
                warn!("Failed to stop capture: {}", e);
            }
            self.streaming = false;
        }
        self.pipeline.teardown();
    }
}

/// Drop a frame whose buffer cannot be decoded or encoded; any other error is passed on.
fn skip_bad_frame<T>(result: Result<T>, role: &str, frame: &CompletedFrame) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_frame_error() => {
            warn!("Skipping {} frame #{}: {}", role, frame.sequence, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::recording::{EncodedChunk, Encoder, EncoderFactory, OutputWriter};
    use crate::capture::{PixelFormat, StreamInfo};
    use crate::session::AppStatus;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::Write;
    use std::path::Path;
    use std::rc::Rc;
    use std::sync::Arc;

    impl SessionController {
        fn with_encoder_factory(mut self, factory: Box<dyn EncoderFactory>) -> Self {
            self.recording = RecordingSession::new(factory);
            self
        }

        fn with_motion(mut self, detector: Box<dyn MotionDetector>, reporter: MotionReporter) -> Self {
            self.detector = detector;
            self.motion = reporter;
            self
        }

        fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        fn mode(&self) -> &ModeState {
            &self.mode
        }

        fn controls(&self) -> &CameraControls {
            &self.controls
        }

        fn outputs(&self) -> &OutputSettings {
            &self.outputs
        }

        fn image_count(&self) -> u32 {
            self.image_count
        }

        fn video_count(&self) -> u32 {
            self.video_count
        }
    }

    // ---- scripted collaborators ----

    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Rc<Cell<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Rc::new(Cell::new(Duration::ZERO)),
            }
        }

        fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }

        fn wall(&self) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        }
    }

    enum Script {
        Frame(u8),
        /// Truncated JPEG on every configured stream
        Corrupt,
        Timeout,
        Quit,
    }

    #[derive(Default)]
    struct PipelineLog {
        calls: Vec<&'static str>,
        streams: Vec<CaptureParameters>,
    }

    struct ScriptedPipeline {
        script: VecDeque<Script>,
        log: Rc<RefCell<PipelineLog>>,
        clock: ManualClock,
        tick: Duration,
        sequence: u64,
    }

    impl ScriptedPipeline {
        fn frame(&self, role: StreamRole, fill: u8) -> Option<CompletedFrame> {
            let log = self.log.borrow();
            let params = log.streams.iter().find(|s| s.role == role)?;
            let (w, h) = (params.width, params.height);
            Some(CompletedFrame {
                data: Arc::from(vec![fill; (w * h * 3) as usize]),
                info: StreamInfo {
                    width: w,
                    height: h,
                    stride: w * 3,
                    pixel_format: PixelFormat::Rgb24,
                },
                sensor_timestamp_ns: None,
                buffer_timestamp_ns: self.sequence as i64 * 40_000_000,
                sequence: self.sequence,
            })
        }
    }

    impl ScriptedPipeline {
        fn truncated(&self, role: StreamRole) -> Option<CompletedFrame> {
            let log = self.log.borrow();
            let params = log.streams.iter().find(|s| s.role == role)?;
            Some(CompletedFrame {
                data: Arc::from(vec![0xFF, 0xD8, 0x00, 0x01]),
                info: StreamInfo {
                    width: params.width,
                    height: params.height,
                    stride: 0,
                    pixel_format: PixelFormat::Mjpeg,
                },
                sensor_timestamp_ns: None,
                buffer_timestamp_ns: self.sequence as i64 * 40_000_000,
                sequence: self.sequence,
            })
        }
    }

    impl CapturePipeline for ScriptedPipeline {
        fn configure(&mut self, streams: &[CaptureParameters]) -> Result<()> {
            let mut log = self.log.borrow_mut();
            log.calls.push("configure");
            log.streams = streams.to_vec();
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            self.log.borrow_mut().calls.push("start");
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.log.borrow_mut().calls.push("stop");
            Ok(())
        }

        fn teardown(&mut self) {
            self.log.borrow_mut().calls.push("teardown");
        }

        fn wait(&mut self) -> Result<PipelineEvent> {
            self.clock.advance(self.tick);
            self.sequence += 1;
            match self.script.pop_front().unwrap_or(Script::Quit) {
                Script::Frame(fill) => Ok(PipelineEvent::FrameComplete(CompletedRequest {
                    viewfinder: self.frame(StreamRole::Viewfinder, fill),
                    video: self.frame(StreamRole::Video, fill),
                })),
                Script::Corrupt => Ok(PipelineEvent::FrameComplete(CompletedRequest {
                    viewfinder: self.truncated(StreamRole::Viewfinder),
                    video: self.truncated(StreamRole::Video),
                })),
                Script::Timeout => Ok(PipelineEvent::Timeout),
                Script::Quit => Ok(PipelineEvent::Quit),
            }
        }

        fn camera_model(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct EncoderStats {
        encoders: u32,
        closed: u32,
        chunks: u32,
    }

    struct CountingFactory {
        stats: Rc<RefCell<EncoderStats>>,
        fail: bool,
    }

    struct CountingEncoder;
    struct CountingWriter(Rc<RefCell<EncoderStats>>);

    impl Encoder for CountingEncoder {
        fn encode(&mut self, frame: &CompletedFrame, timestamp_us: i64) -> Result<Option<EncodedChunk>> {
            Ok(Some(EncodedChunk {
                data: frame.data[..4].to_vec(),
                timestamp_us,
                keyframe: true,
            }))
        }
    }

    impl OutputWriter for CountingWriter {
        fn write_chunk(&mut self, _chunk: &EncodedChunk) -> Result<()> {
            self.0.borrow_mut().chunks += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.0.borrow_mut().closed += 1;
            Ok(())
        }
    }

    impl EncoderFactory for CountingFactory {
        fn create_encoder(&self, _info: &StreamInfo, _params: &VideoParams) -> Result<Box<dyn Encoder>> {
            if self.fail {
                return Err(Error::EncoderInit("encoder busy".into()));
            }
            self.stats.borrow_mut().encoders += 1;
            Ok(Box::new(CountingEncoder))
        }

        fn create_writer(&self, _params: &VideoParams) -> Result<Box<dyn OutputWriter>> {
            Ok(Box::new(CountingWriter(self.stats.clone())))
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // ---- harness ----

    struct Harness {
        controller: SessionController,
        log: Rc<RefCell<PipelineLog>>,
        stats: Rc<RefCell<EncoderStats>>,
        motion: SharedBuf,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn calls(&self) -> Vec<&'static str> {
            self.log.borrow().calls.clone()
        }

        fn clear_calls(&self) {
            self.log.borrow_mut().calls.clear();
        }

        fn media(&self) -> PathBuf {
            self.dir.path().join("media")
        }

        fn status(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("status_mjpeg.txt")).unwrap()
        }
    }

    fn settings(dir: &Path, modes: StartupModes) -> ControllerSettings {
        ControllerSettings {
            image_template: "im_%i_%Y%M%D.jpg".into(),
            video_template: "vi_%v_%Y%M%D.mjpeg".into(),
            media_root: Some(dir.join("media")),
            preview_path: dir.join("cam.jpg"),
            status_file: Some(dir.join("status_mjpeg.txt")),
            motion_output: None,
            thumbnail_types: "vit".into(),
            codec: VideoCodec::Mjpeg,
            encoder_retries: 2,
            startup_duration: None,
            modes,
            outputs: OutputSettings {
                image_width: 32,
                image_height: 32,
                video_width: 16,
                video_height: 16,
                preview_width: 16,
                ..Default::default()
            },
            motion: MotionConfig::default(),
        }
    }

    fn harness_with(
        modes: StartupModes,
        script: Vec<Script>,
        fail_encoder: bool,
        tweak: impl FnOnce(&mut ControllerSettings),
    ) -> (Harness, ShutdownToken) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("media")).unwrap();

        let mut s = settings(dir.path(), modes);
        tweak(&mut s);

        let clock = ManualClock::new();
        let log = Rc::new(RefCell::new(PipelineLog::default()));
        let pipeline = ScriptedPipeline {
            script: script.into(),
            log: log.clone(),
            clock: clock.clone(),
            tick: Duration::from_millis(500),
            sequence: 0,
        };

        let stats = Rc::new(RefCell::new(EncoderStats::default()));
        let factory = CountingFactory {
            stats: stats.clone(),
            fail: fail_encoder,
        };
        let motion = SharedBuf::default();
        let shutdown = ShutdownToken::new();

        let controller = SessionController::new(s.clone(), Box::new(pipeline), shutdown.clone())
            .unwrap()
            .with_encoder_factory(Box::new(factory))
            .with_motion(
                Box::new(FrameDiffDetector::new(&s.motion)),
                MotionReporter::new(Box::new(motion.clone())),
            )
            .with_clock(Box::new(clock));

        (
            Harness {
                controller,
                log,
                stats,
                motion,
                dir,
            },
            shutdown,
        )
    }

    fn harness(modes: StartupModes, script: Vec<Script>) -> Harness {
        harness_with(modes, script, false, |_| {}).0
    }

    fn frames(n: usize) -> Vec<Script> {
        (0..n).map(|_| Script::Frame(50)).collect()
    }

    // ---- dispatch ----

    #[test]
    fn test_unknown_verb_changes_nothing() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();
        h.clear_calls();
        let before = h.controller.mode().clone();

        h.controller.handle_line("xy 1 2").unwrap();

        assert_eq!(h.controller.mode(), &before);
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_parameter_change_restarts_pipeline() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();
        h.clear_calls();

        h.controller.handle_line("co 50").unwrap();

        assert!((h.controller.controls().contrast - 8.495).abs() < 1e-4);
        assert_eq!(h.calls(), vec!["stop", "teardown", "configure", "start"]);
        let log = h.log.borrow();
        assert!((log.streams[0].controls.contrast - 8.495).abs() < 1e-4);
    }

    #[test]
    fn test_invalid_commands_are_ignored() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();
        h.clear_calls();

        h.controller.handle_line("ro 90").unwrap();
        h.controller.handle_line("pv 10 512").unwrap();
        h.controller.handle_line("ag -5 100").unwrap();

        assert_eq!(h.controller.controls().rotation, 0);
        assert!(!h.controller.mode().preview_active());
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_nan_levels_leave_controls_untouched() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();
        h.clear_calls();

        h.controller.handle_line("co nan").unwrap();
        h.controller.handle_line("ag nan 100").unwrap();
        assert!(h.calls().is_empty());
        assert_eq!(h.controller.controls(), &CameraControls::default());
    }

    #[test]
    fn test_preview_command_enables_preview() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();

        h.controller.handle_line("pv 40 320 1").unwrap();

        assert!(h.controller.mode().preview_active());
        assert_eq!(h.controller.outputs().preview_width, 320);
        assert_eq!(h.controller.outputs().preview_quality, 40);
    }

    #[test]
    fn test_resolution_command() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();

        h.controller.handle_line("px 64 48 30 10 96 64 1").unwrap();

        let log = h.log.borrow();
        assert_eq!(log.streams.len(), 1);
        assert_eq!((log.streams[0].width, log.streams[0].height), (96, 64));
        assert_eq!(log.streams[0].framerate, 10);
        assert_eq!(h.controller.outputs().video_fps, 30);
    }

    #[test]
    fn test_set_counts_rescans() {
        let mut h = harness(StartupModes::default(), vec![]);
        h.controller.start().unwrap();
        assert_eq!(h.controller.image_count(), 1);

        std::fs::write(h.media().join("im_3.jpg.i9.th.jpg"), b"x").unwrap();
        std::fs::write(h.media().join("vi_4.mjpeg.v4.th.jpg"), b"x").unwrap();
        h.controller.handle_line("sc").unwrap();

        assert_eq!(h.controller.image_count(), 10);
        assert_eq!(h.controller.video_count(), 5);
    }

    // ---- frame loop ----

    #[test]
    fn test_still_then_timed_recording() {
        let mut h = harness(StartupModes::default(), frames(12));
        h.controller.start().unwrap();

        h.controller.handle_line("im").unwrap();
        assert!(h.controller.mode().still_active());
        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert!(!h.controller.mode().still_active());
        assert!(h.media().join("im_1_20240305.jpg").exists());
        assert_eq!(h.controller.image_count(), 2);

        h.clear_calls();
        h.controller.handle_line("ca 1 2").unwrap();
        assert!(h.controller.mode().video_active());
        // Video stream added once
        assert_eq!(h.calls(), vec!["stop", "teardown", "configure", "start"]);

        let mut steps = 0;
        while h.controller.mode().video_active() {
            h.controller.step().unwrap();
            steps += 1;
            assert!(steps < 10, "recording never stopped");
        }

        let stats = h.stats.borrow();
        assert_eq!(stats.encoders, 1);
        assert_eq!(stats.closed, 1);
        assert!(stats.chunks >= 3);
        assert_eq!(h.controller.video_count(), 2);
        assert!(!h.controller.mode().preview_active());
        assert!(!h.controller.mode().still_active());
    }

    #[test]
    fn test_record_toggle_and_stop() {
        let mut h = harness(StartupModes::default(), frames(4));
        h.controller.start().unwrap();

        h.controller.handle_line("ca 1").unwrap();
        h.controller.step().unwrap();
        h.controller.step().unwrap();
        // Second `ca 1` while recording stops it
        h.controller.handle_line("ca 1").unwrap();

        assert!(!h.controller.mode().video_active());
        assert_eq!(h.stats.borrow().closed, 1);
        assert_eq!(h.controller.video_count(), 2);

        // Stopping again is a no-op
        h.controller.handle_line("ca 0").unwrap();
        assert_eq!(h.stats.borrow().closed, 1);
        assert_eq!(h.controller.video_count(), 2);
    }

    #[test]
    fn test_timeout_restarts_capture() {
        let modes = StartupModes {
            preview: true,
            ..Default::default()
        };
        let mut h = harness(modes, vec![Script::Timeout, Script::Frame(10)]);
        h.controller.start().unwrap();
        h.clear_calls();

        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert_eq!(h.calls(), vec!["stop", "start"]);

        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert!(h.dir.path().join("cam.jpg").exists());
        assert_eq!(h.status(), "ready\n");
    }

    #[test]
    fn test_shutdown_finalizes_recording() {
        let modes = StartupModes {
            video: true,
            ..Default::default()
        };
        let (mut h, shutdown) = harness_with(modes, frames(10), false, |_| {});
        h.controller.start().unwrap();

        h.controller.step().unwrap();
        h.controller.step().unwrap();
        assert_eq!(h.status(), "video\n");

        shutdown.request();
        assert_eq!(h.controller.step().unwrap(), LoopControl::Exit);
        assert_eq!(h.stats.borrow().closed, 1);
        assert_eq!(h.controller.video_count(), 2);
        assert!(!h.controller.mode().video_active());
    }

    #[test]
    fn test_startup_recording_budget() {
        let modes = StartupModes {
            video: true,
            ..Default::default()
        };
        let (mut h, _) = harness_with(modes, frames(10), false, |s| {
            s.startup_duration = Some(Duration::from_secs(1));
        });

        // Nothing else is active and there is no control channel, so the loop ends
        h.controller.run().unwrap();
        assert_eq!(h.stats.borrow().closed, 1);
        assert_eq!(h.controller.video_count(), 2);
    }

    #[test]
    fn test_still_only_startup_exits() {
        let modes = StartupModes {
            still: true,
            ..Default::default()
        };
        let mut h = harness(modes, frames(5));
        h.controller.run().unwrap();

        assert!(h.media().join("im_1_20240305.jpg").exists());
        // Written at the start of the final iteration, after the still cleared
        assert_eq!(h.status(), "halted\n");
    }

    #[test]
    fn test_encoder_retries_exhausted() {
        let modes = StartupModes {
            video: true,
            ..Default::default()
        };
        let (mut h, _) = harness_with(modes, frames(10), true, |_| {});

        let err = h.controller.run().unwrap_err();
        assert!(matches!(err, Error::EncoderUnavailable { attempts: 3 }));
        assert_eq!(h.controller.mode().status(), AppStatus::Error(err.to_string()));
        assert_eq!(h.status(), format!("Error: {}\n", err));
    }

    #[test]
    fn test_motion_transitions() {
        let modes = StartupModes {
            motion: true,
            ..Default::default()
        };
        let script = vec![
            Script::Frame(10),
            Script::Frame(10),
            Script::Frame(200),
            Script::Frame(200),
            Script::Frame(10),
        ];
        let mut h = harness(modes, script);
        h.controller.run().unwrap();

        let out = String::from_utf8(h.motion.0.borrow().clone()).unwrap();
        assert_eq!(out, "1\n0\n1\n");
    }

    #[test]
    fn test_undecodable_frame_is_skipped() {
        let modes = StartupModes {
            still: true,
            motion: true,
            ..Default::default()
        };
        let script = vec![Script::Corrupt, Script::Frame(10), Script::Corrupt, Script::Frame(200)];
        let mut h = harness(modes, script);
        h.controller.start().unwrap();

        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert!(h.controller.mode().still_active());
        assert_eq!(h.controller.image_count(), 1);

        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert!(!h.controller.mode().still_active());
        assert_eq!(h.controller.image_count(), 2);

        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert_eq!(h.controller.step().unwrap(), LoopControl::Continue);
        assert_eq!(String::from_utf8(h.motion.0.borrow().clone()).unwrap(), "1\n");
        assert_eq!(h.status(), "md_ready\n");
    }

    #[test]
    fn test_thumbnail_from_preview() {
        let modes = StartupModes {
            preview: true,
            ..Default::default()
        };
        let mut h = harness(modes, frames(3));
        h.controller.start().unwrap();

        h.controller.step().unwrap();
        assert!(h.dir.path().join("cam.jpg").exists());

        h.controller.handle_line("im").unwrap();
        h.controller.step().unwrap();

        let thumb = h.media().join("im_1_20240305.jpg.i1.th.jpg");
        assert!(thumb.exists());
        assert_eq!(
            std::fs::read(&thumb).unwrap(),
            std::fs::read(h.dir.path().join("cam.jpg")).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_commands_over_fifo() {
        let h = harness(StartupModes::default(), frames(12));
        let fifo = h.dir.path().join("FIFO");
        let channel = ControlChannel::open(&fifo, true).unwrap();
        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();

        let Harness {
            controller,
            dir: _dir,
            ..
        } = h;
        let mut controller = controller.with_control(channel);
        controller.start().unwrap();

        writer.write_all(b"im\n").unwrap();
        controller.step().unwrap();
        assert_eq!(controller.image_count(), 2);

        writer.write_all(b"xy 1 2\nmd 1\n").unwrap();
        controller.step().unwrap();
        assert!(!controller.mode().motion_active());
        controller.step().unwrap();
        assert!(controller.mode().motion_active());
    }
}
