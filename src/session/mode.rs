//! Capture mode flags and the derived application status

use super::AppStatus;

/// Which producers run for each completed frame.
///
/// `multi_active` is derived from the preview/still/video flags and is recomputed by every
/// setter; it cannot be set directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeState {
    preview_active: bool,
    still_active: bool,
    video_active: bool,
    motion_active: bool,
    multi_active: bool,
    error: Option<String>,
}

impl ModeState {
    pub fn new(preview: bool, still: bool, video: bool, motion: bool) -> Self {
        let mut mode = Self {
            preview_active: preview,
            still_active: still,
            video_active: video,
            motion_active: motion,
            ..Default::default()
        };
        mode.recompute();
        mode
    }

    fn recompute(&mut self) {
        let active = self.preview_active as u8 + self.still_active as u8 + self.video_active as u8;
        self.multi_active = active > 1;
    }

    pub fn preview_active(&self) -> bool {
        self.preview_active
    }

    pub fn still_active(&self) -> bool {
        self.still_active
    }

    pub fn video_active(&self) -> bool {
        self.video_active
    }

    pub fn motion_active(&self) -> bool {
        self.motion_active
    }

    pub fn multi_active(&self) -> bool {
        self.multi_active
    }

    pub fn set_preview(&mut self, active: bool) {
        self.preview_active = active;
        self.recompute();
    }

    pub fn set_still(&mut self, active: bool) {
        self.still_active = active;
        self.recompute();
    }

    pub fn set_video(&mut self, active: bool) {
        self.video_active = active;
        self.recompute();
    }

    pub fn set_motion(&mut self, active: bool) {
        self.motion_active = active;
    }

    /// True if any producer is active
    pub fn any_active(&self) -> bool {
        self.preview_active || self.still_active || self.video_active || self.motion_active
    }

    /// Record a fatal error. Only the first error is kept.
    pub fn set_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    #[cfg(test)]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Status derived from the flags, highest priority first:
    /// error, still, motion + video, video, motion, preview, halted.
    pub fn status(&self) -> AppStatus {
        if let Some(message) = &self.error {
            AppStatus::Error(message.clone())
        } else if self.still_active {
            AppStatus::Image
        } else if self.motion_active && self.video_active {
            AppStatus::MotionVideo
        } else if self.video_active {
            AppStatus::Video
        } else if self.motion_active {
            AppStatus::MotionReady
        } else if self.preview_active {
            AppStatus::Ready
        } else {
            AppStatus::Halted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_active_for_all_combinations() {
        for bits in 0u8..8 {
            let (p, s, v) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let mut mode = ModeState::new(p, s, v, false);
            assert_eq!(mode.multi_active(), (p as u8 + s as u8 + v as u8) > 1);

            // Flip each flag in turn and check the derivation still holds
            mode.set_preview(!p);
            assert_eq!(mode.multi_active(), (!p as u8 + s as u8 + v as u8) > 1);
            mode.set_preview(p);
            mode.set_still(!s);
            assert_eq!(mode.multi_active(), (p as u8 + !s as u8 + v as u8) > 1);
            mode.set_still(s);
            mode.set_video(!v);
            assert_eq!(mode.multi_active(), (p as u8 + s as u8 + !v as u8) > 1);
        }
    }

    #[test]
    fn test_motion_does_not_count_towards_multi() {
        let mode = ModeState::new(true, false, false, true);
        assert!(!mode.multi_active());
    }

    #[test]
    fn test_status_priority() {
        let mut mode = ModeState::default();
        assert_eq!(mode.status(), AppStatus::Halted);

        mode.set_preview(true);
        assert_eq!(mode.status(), AppStatus::Ready);

        mode.set_motion(true);
        assert_eq!(mode.status(), AppStatus::MotionReady);

        mode.set_video(true);
        assert_eq!(mode.status(), AppStatus::MotionVideo);

        mode.set_motion(false);
        assert_eq!(mode.status(), AppStatus::Video);

        mode.set_still(true);
        assert_eq!(mode.status(), AppStatus::Image);

        mode.set_error("camera gone");
        assert_eq!(mode.status(), AppStatus::Error("camera gone".into()));
    }

    #[test]
    fn test_error_is_sticky() {
        let mut mode = ModeState::default();
        mode.set_error("first");
        mode.set_error("second");
        assert_eq!(mode.error(), Some("first"));
    }
}
