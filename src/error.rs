//! Error types for the camera session controller
//!
//! Command errors (`InvalidCommand`, `UnsupportedTransform`) are recovered locally by the
//! dispatcher, and frame errors (`BadFrame`, undecodable images) drop a single frame.
//! Everything else escapes the event loop and terminates the process after the
//! status file has been updated.

use std::path::PathBuf;

/// Result type used by fallible functions inside the controller.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unsupported transform: {0}")]
    UnsupportedTransform(String),

    #[error("Failed to initialise encoder: {0}")]
    EncoderInit(String),

    #[error("Encoder unavailable after {attempts} attempts")]
    EncoderUnavailable { attempts: u32 },

    #[error("Cannot open control channel {path:?}: {source}")]
    FifoOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Unusable frame buffer: {0}")]
    BadFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// True for errors caused by a bad control command, which never stop the daemon.
    pub fn is_command_error(&self) -> bool {
        matches!(self, Error::InvalidCommand(_) | Error::UnsupportedTransform(_))
    }

    /// True for errors confined to one frame buffer (truncated or undecodable data).
    /// The frame is dropped and the loop carries on.
    pub fn is_frame_error(&self) -> bool {
        match self {
            Error::BadFrame(_) => true,
            Error::Image(e) => !matches!(e, image::ImageError::IoError(_)),
            _ => false,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidCommand(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_are_local() {
        assert!(Error::invalid("co needs a value").is_command_error());
        assert!(Error::UnsupportedTransform("90".into()).is_command_error());
        assert!(!Error::EncoderInit("no device".into()).is_command_error());
        assert!(!Error::Camera("gone".into()).is_command_error());
    }

    #[test]
    fn test_frame_errors_are_skippable() {
        assert!(Error::BadFrame("short YUYV buffer".into()).is_frame_error());
        let truncated = image::load_from_memory_with_format(&[0xFF, 0xD8, 0x00, 0x01], image::ImageFormat::Jpeg)
            .unwrap_err();
        assert!(Error::Image(truncated).is_frame_error());

        let disk_full = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!Error::Image(image::ImageError::IoError(disk_full)).is_frame_error());
        assert!(!Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "gone")).is_frame_error());
        assert!(!Error::Camera("gone".into()).is_frame_error());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::EncoderUnavailable { attempts: 3 };
        assert_eq!(err.to_string(), "Encoder unavailable after 3 attempts");
    }
}
