//! Motion detection on viewfinder frames

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use tracing::trace;

use crate::capture::image_io::frame_to_rgb;
use crate::capture::CompletedFrame;
use crate::config::MotionConfig;
use crate::error::Result;

/// Motion detection collaborator
pub trait MotionDetector {
    /// Analyse one frame and report whether motion is present
    fn detect(&mut self, frame: &CompletedFrame) -> Result<bool>;

    /// Drop the reference frame
    fn reset(&mut self);
}

/// Compares each frame against the previous one on a downscaled greyscale copy.
///
/// A pixel counts as changed when its luma differs by more than `threshold`; motion is
/// reported when the fraction of changed pixels reaches `min_changed_fraction`.
pub struct FrameDiffDetector {
    threshold: u8,
    min_changed_fraction: f32,
    analysis_width: u32,
    previous: Option<GrayImage>,
}

impl FrameDiffDetector {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_changed_fraction: config.min_changed_fraction.clamp(0.0, 1.0),
            analysis_width: config.analysis_width.max(8),
            previous: None,
        }
    }

    fn analyse(&self, frame: &CompletedFrame) -> Result<GrayImage> {
        let rgb = frame_to_rgb(frame)?;
        let grey = DynamicImage::ImageRgb8(rgb).to_luma8();
        if grey.width() <= self.analysis_width {
            return Ok(grey);
        }
        let height = ((grey.height() as u64 * self.analysis_width as u64) / grey.width() as u64).max(1);
        Ok(imageops::resize(&grey, self.analysis_width, height as u32, FilterType::Triangle))
    }

    fn changed_fraction(&self, previous: &GrayImage, current: &GrayImage) -> f32 {
        let total = current.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        let changed = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .filter(|(a, b)| a.abs_diff(**b) > self.threshold)
            .count();
        changed as f32 / total as f32
    }
}

impl MotionDetector for FrameDiffDetector {
    fn detect(&mut self, frame: &CompletedFrame) -> Result<bool> {
        let current = self.analyse(frame)?;

        let detected = match &self.previous {
            Some(previous) if previous.dimensions() == current.dimensions() => {
                let fraction = self.changed_fraction(previous, &current);
                trace!("Frame #{} changed fraction {:.4}", frame.sequence, fraction);
                fraction >= self.min_changed_fraction
            }
            _ => false,
        };

        self.previous = Some(current);
        Ok(detected)
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}
