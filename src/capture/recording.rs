//! Recording session management
//!
//! A `RecordingSession` owns the encoder and file writer of one video artifact. The pair is
//! created lazily on the first video buffer after recording is armed and destroyed when the
//! recording stops. Encoded chunks are pulled from the encoder and written to the file
//! explicitly; there are no output callbacks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, error, info, warn};

use super::image_io::frame_to_rgb;
use super::{CompletedFrame, PixelFormat, StreamInfo, StreamRole};
use crate::error::{Error, Result};

/// Video codec requested for a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    /// Motion JPEG, one JPEG per frame
    #[default]
    Mjpeg,
    /// H.264, requires an external encoder
    H264,
}

impl VideoCodec {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Some(VideoCodec::Mjpeg),
            "h264" => Some(VideoCodec::H264),
            _ => None,
        }
    }
}

/// Encoder settings snapshot taken when a recording starts
#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub codec: VideoCodec,
    /// Bits per second
    pub bitrate: u32,
    pub framerate: u32,
    /// JPEG quality used by the MJPEG encoder
    pub quality: u8,
    /// Output artifact path
    pub output: PathBuf,
}

/// One unit of encoded output
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub timestamp_us: i64,
    pub keyframe: bool,
}

/// Video encoder collaborator
pub trait Encoder {
    /// Encode one frame. Encoders may buffer input and return nothing for some frames.
    fn encode(&mut self, frame: &CompletedFrame, timestamp_us: i64) -> Result<Option<EncodedChunk>>;
}

/// Destination of encoded chunks
pub trait OutputWriter {
    fn write_chunk(&mut self, chunk: &EncodedChunk) -> Result<()>;

    /// Flush and close the artifact.
    fn close(&mut self) -> Result<()>;
}

/// Creates the encoder/writer pair of a recording
pub trait EncoderFactory {
    fn create_encoder(&self, info: &StreamInfo, params: &VideoParams) -> Result<Box<dyn Encoder>>;

    fn create_writer(&self, params: &VideoParams) -> Result<Box<dyn OutputWriter>>;
}

/// The encoder and writer of an armed session; they only ever exist together.
struct ActiveRecording {
    encoder: Box<dyn Encoder>,
    writer: Box<dyn OutputWriter>,
    output_path: PathBuf,
    frames: u64,
    bytes: u64,
    first_timestamp_us: Option<i64>,
    last_timestamp_us: i64,
}

/// Encoder + writer lifecycle for one continuous video artifact
pub struct RecordingSession {
    factory: Box<dyn EncoderFactory>,
    active: Option<ActiveRecording>,
}

impl RecordingSession {
    pub fn new(factory: Box<dyn EncoderFactory>) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    /// Whether the encoder/writer pair exists
    pub fn is_armed(&self) -> bool {
        self.active.is_some()
    }

    /// Create the encoder and writer if they do not exist yet.
    ///
    /// On failure the session stays un-armed and `EncoderInit` is returned.
    pub fn ensure_started(&mut self, info: &StreamInfo, params: &VideoParams) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        info!(
            "Initializing {:?} encoder for {:?} ({}x{} @ {} fps, {} bps)",
            params.codec, params.output, info.width, info.height, params.framerate, params.bitrate
        );

        let encoder = self.factory.create_encoder(info, params).map_err(|e| {
            error!("Failed to create encoder: {}", e);
            into_init_error(e)
        })?;

        let writer = self.factory.create_writer(params).map_err(|e| {
            error!("Failed to create file output {:?}: {}", params.output, e);
            into_init_error(e)
        })?;

        self.active = Some(ActiveRecording {
            encoder,
            writer,
            output_path: params.output.clone(),
            frames: 0,
            bytes: 0,
            first_timestamp_us: None,
            last_timestamp_us: 0,
        });

        debug!("Encoder and file output armed");
        Ok(())
    }

    /// Encode one video buffer and write the result to the artifact.
    ///
    /// Returns the number of bytes written. Un-armed sessions and empty buffers are logged
    /// and skipped.
    pub fn feed(&mut self, frame: &CompletedFrame) -> Result<usize> {
        let Some(active) = self.active.as_mut() else {
            error!("Encoder is not initialized, dropping video buffer #{}", frame.sequence);
            return Ok(0);
        };

        if !super::usable(frame, StreamRole::Video) {
            return Ok(0);
        }

        let timestamp_us = frame.timestamp_us();
        debug!(
            "Encoding buffer of size {} at timestamp {}",
            frame.data.len(),
            timestamp_us
        );

        let Some(chunk) = active.encoder.encode(frame, timestamp_us)? else {
            return Ok(0);
        };

        active.writer.write_chunk(&chunk)?;
        active.frames += 1;
        active.bytes += chunk.data.len() as u64;
        if active.first_timestamp_us.is_none() {
            active.first_timestamp_us = Some(chunk.timestamp_us);
        }
        active.last_timestamp_us = chunk.timestamp_us;

        Ok(chunk.data.len())
    }

    /// Close the writer, then drop the encoder.
    ///
    /// Returns the finished artifact path, or `None` if the session was not armed.
    pub fn finalize(&mut self) -> Option<PathBuf> {
        let mut active = self.active.take()?;

        if let Err(e) = active.writer.close() {
            warn!("Failed to close recording {:?}: {}", active.output_path, e);
        }
        let ActiveRecording {
            encoder,
            writer,
            output_path,
            frames,
            bytes,
            first_timestamp_us,
            last_timestamp_us,
        } = active;
        drop(writer);
        drop(encoder);

        let duration_ms = first_timestamp_us
            .map(|first| (last_timestamp_us - first) / 1000)
            .unwrap_or(0);
        info!(
            "Recording finalized: {:?} ({} frames, {} bytes, {} ms)",
            output_path, frames, bytes, duration_ms
        );

        Some(output_path)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            warn!("Recording session dropped while armed, finalizing");
            self.finalize();
        }
    }
}

fn into_init_error(e: Error) -> Error {
    match e {
        Error::EncoderInit(_) => e,
        other => Error::EncoderInit(other.to_string()),
    }
}

/// Built-in factory: MJPEG encoding into a plain file
#[derive(Debug, Default, Clone, Copy)]
pub struct MjpegEncoderFactory;

impl EncoderFactory for MjpegEncoderFactory {
    fn create_encoder(&self, info: &StreamInfo, params: &VideoParams) -> Result<Box<dyn Encoder>> {
        match params.codec {
            VideoCodec::Mjpeg => {
                if params.bitrate > 0 {
                    debug!("MJPEG encoder ignores bitrate {}, using quality {}", params.bitrate, params.quality);
                }
                Ok(Box::new(MjpegEncoder {
                    quality: params.quality,
                    passthrough: info.pixel_format == PixelFormat::Mjpeg,
                }))
            }
            VideoCodec::H264 => Err(Error::EncoderInit(
                "no H.264 encoder is available on this system".to_string(),
            )),
        }
    }

    fn create_writer(&self, params: &VideoParams) -> Result<Box<dyn OutputWriter>> {
        Ok(Box::new(FileWriter::create(&params.output)?))
    }
}

/// Encodes every frame as a standalone JPEG
struct MjpegEncoder {
    quality: u8,
    /// Buffers that already are JPEG images are written unchanged
    passthrough: bool,
}

impl Encoder for MjpegEncoder {
    fn encode(&mut self, frame: &CompletedFrame, timestamp_us: i64) -> Result<Option<EncodedChunk>> {
        let data = if self.passthrough {
            frame.data.to_vec()
        } else {
            let rgb = frame_to_rgb(frame)?;
            let mut out = Vec::with_capacity(frame.data.len() / 4);
            JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb)?;
            out
        };

        Ok(Some(EncodedChunk {
            data,
            timestamp_us,
            keyframe: true,
        }))
    }
}

/// Buffered writer for a single output file
pub struct FileWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    chunks: u64,
    keyframes: u64,
}

impl FileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
            chunks: 0,
            keyframes: 0,
        })
    }
}

impl OutputWriter for FileWriter {
    /// Chunks that arrive before the first keyframe cannot be decoded and are dropped.
    fn write_chunk(&mut self, chunk: &EncodedChunk) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{:?} is already closed", self.path),
            )));
        };
        if chunk.keyframe {
            self.keyframes += 1;
        } else if self.keyframes == 0 {
            debug!("Dropping chunk at {} us, no keyframe written yet", chunk.timestamp_us);
            return Ok(());
        }
        file.write_all(&chunk.data)?;
        self.chunks += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
            debug!(
                "Closed {:?}: {} chunks, {} keyframes",
                self.path, self.chunks, self.keyframes
            );
        }
        Ok(())
    }
}
