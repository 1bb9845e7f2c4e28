//! Capture session: mode state, output naming and the controller event loop

pub mod controller;
pub mod counters;
pub mod mode;
pub mod status;
pub mod template;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;

pub use controller::SessionController;
pub use mode::ModeState;

/// Status line written for external consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStatus {
    Error(String),
    Image,
    MotionVideo,
    Video,
    MotionReady,
    Ready,
    Halted,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Error(message) => write!(f, "Error: {}", message),
            AppStatus::Image => f.write_str("image"),
            AppStatus::MotionVideo => f.write_str("md_video"),
            AppStatus::Video => f.write_str("video"),
            AppStatus::MotionReady => f.write_str("md_ready"),
            AppStatus::Ready => f.write_str("ready"),
            AppStatus::Halted => f.write_str("halted"),
        }
    }
}

/// Process-wide stop request, set from the signal handler and polled by the loop
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Time source for recording budgets and filename timestamps
pub trait Clock {
    /// Monotonic time, used for elapsed recording time
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for filenames
    fn wall(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}
