//! Crash handling
//!
//! A panic anywhere in the daemon is recorded twice before the default hook runs:
//! - a timestamped report with a backtrace is appended to `crash.log` in the log directory
//! - the status file is overwritten with `Error: panic: <message>` so the web interface
//!   sees the failure

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::error;

use crate::session::{status::write_status_line, AppStatus};

/// Crash log file path, set during initialization
static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Status file updated on panic
static STATUS_PATH: OnceLock<PathBuf> = OnceLock::new();

const CRASH_LOG_FILENAME: &str = "crash.log";

/// Install the panic hook. Call this early in main().
///
/// Either path may be absent; the hook then only writes what it can.
pub fn init_crash_handler(log_dir: Option<&Path>, status_file: Option<&Path>) -> Option<PathBuf> {
    let crash_log_path = log_dir.map(|dir| dir.join(CRASH_LOG_FILENAME));

    if let Some(path) = &crash_log_path {
        let _ = CRASH_LOG_PATH.set(path.clone());
    }
    if let Some(path) = status_file {
        let _ = STATUS_PATH.set(path.to_path_buf());
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        handle_panic(panic_info);
        default_hook(panic_info);
    }));

    crash_log_path
}

fn panic_message(panic_info: &PanicHookInfo) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

fn handle_panic(panic_info: &PanicHookInfo) {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let message = panic_message(panic_info);

    let location = if let Some(loc) = panic_info.location() {
        format!("{}:{}:{}", loc.file(), loc.line(), loc.column())
    } else {
        "unknown location".to_string()
    };

    if let Some(path) = STATUS_PATH.get() {
        let _ = write_status_line(path, &AppStatus::Error(format!("panic: {}", message)));
    }

    if let Some(path) = CRASH_LOG_PATH.get() {
        let report = format_report(&timestamp.to_string(), &location, &message);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }

    // May not be flushed if we're crashing
    error!("PANIC at {}: {}", location, message);
}

fn format_report(timestamp: &str, location: &str, message: &str) -> String {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let separator = "=".repeat(80);
    format!(
        "\n{sep}\n\
         PANIC at {ts}\n\
         {sep}\n\
         Location: {loc}\n\
         Message: {msg}\n\
         \n\
         Backtrace:\n\
         {bt}\n\
         {sep}\n",
        sep = separator,
        ts = timestamp,
        loc = location,
        msg = message,
        bt = backtrace
    )
}

/// Get the crash log path
pub fn get_crash_log_path() -> Option<&'static PathBuf> {
    CRASH_LOG_PATH.get()
}
