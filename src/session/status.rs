//! Externally observable state: status file, thumbnails and motion transitions

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::AppStatus;
use crate::error::Result;

/// Overwrites the status file with one line per loop iteration
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    path: Option<PathBuf>,
    last: Option<AppStatus>,
}

impl StatusReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, last: None }
    }

    /// Write the status line. Without a configured path this only tracks the value.
    pub fn write(&mut self, status: &AppStatus) -> Result<()> {
        if self.last.as_ref() != Some(status) {
            debug!("Status changed to {}", status);
        }
        self.last = Some(status.clone());

        let Some(path) = &self.path else {
            return Ok(());
        };
        write_status_line(path, status)
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&AppStatus> {
        self.last.as_ref()
    }
}

/// Replace the contents of `path` with the status line
pub fn write_status_line(path: &Path, status: &AppStatus) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", status)?;
    Ok(())
}

/// Copies the current preview image next to finished artifacts
#[derive(Debug, Clone)]
pub struct ThumbnailWriter {
    media_root: Option<PathBuf>,
    types: String,
    preview_path: PathBuf,
}

impl ThumbnailWriter {
    pub fn new(media_root: Option<PathBuf>, types: impl Into<String>, preview_path: PathBuf) -> Self {
        Self {
            media_root,
            types: types.into(),
            preview_path,
        }
    }

    /// Thumbnail path for an artifact: `<artifact>.<kind><count>.th.jpg`
    pub fn thumbnail_path(artifact: &Path, kind: char, count: u32) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(format!(".{}{}.th.jpg", kind, count));
        PathBuf::from(name)
    }

    /// Copy the preview image as the thumbnail of `artifact`.
    ///
    /// Returns the thumbnail path, or `None` when thumbnails are disabled for this artifact.
    pub fn write(&self, artifact: &Path, kind: char, count: u32) -> Result<Option<PathBuf>> {
        let Some(root) = &self.media_root else {
            return Ok(None);
        };
        if !self.types.contains(kind) {
            return Ok(None);
        }
        if !artifact.starts_with(root) {
            debug!("{:?} is outside the media root, no thumbnail", artifact);
            return Ok(None);
        }
        if !self.preview_path.is_file() {
            warn!(
                "No preview image at {:?}, skipping thumbnail for {:?}",
                self.preview_path, artifact
            );
            return Ok(None);
        }

        let target = Self::thumbnail_path(artifact, kind, count);
        std::fs::copy(&self.preview_path, &target)?;
        info!("Thumbnail written to {:?}", target);
        Ok(Some(target))
    }
}

/// Writes `1`/`0` lines when the detected motion state changes
pub struct MotionReporter {
    sink: Box<dyn Write>,
    detected: bool,
}

impl MotionReporter {
    pub fn new(sink: Box<dyn Write>) -> Self {
        Self {
            sink,
            detected: false,
        }
    }

    /// Append to `path`, or report on stdout when no path is configured
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let sink: Box<dyn Write> = match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
            None => Box::new(std::io::stdout()),
        };
        Ok(Self::new(sink))
    }

    /// Forget the previous state; the next detection starts from "no motion"
    pub fn reset(&mut self) {
        self.detected = false;
    }

    /// Record the state of the latest frame. Returns true if a line was written.
    pub fn report(&mut self, detected: bool) -> Result<bool> {
        if detected == self.detected {
            return Ok(false);
        }
        self.detected = detected;
        writeln!(self.sink, "{}", if detected { 1 } else { 0 })?;
        self.sink.flush()?;
        info!("Motion {}", if detected { "started" } else { "stopped" });
        Ok(true)
    }
}
