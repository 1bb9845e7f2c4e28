use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_BASENAME: &str = "rpicam-mjpeg.log";
const LOG_DIR_ENV: &str = "RPICAM_MJPEG_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Resolve the log directory: environment override first, then the config file
pub fn get_log_dir(config: &LoggingConfig) -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        return Some(PathBuf::from(override_path));
    }
    config.directory.clone()
}

/// Install the global subscriber.
///
/// Logs always go to stderr. When a log directory is configured they are also written to a
/// daily rolling file; the returned guard must be kept alive to flush it.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(log_dir) = get_log_dir(config) else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    let retention_days = config.retention_days.unwrap_or(LOG_RETENTION_DAYS);
    prune_old_logs(&log_dir, Duration::from_secs(60 * 60 * 24 * retention_days));

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(Some(guard))
}

fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    let cutoff = SystemTime::now().checked_sub(max_age);
    let Some(cutoff) = cutoff else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let file_name = path.file_name().and_then(|name| name.to_str());
        let Some(file_name) = file_name else {
            continue;
        };

        if !file_name.starts_with(LOG_FILE_BASENAME) {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_only_touches_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2024-01-01", LOG_FILE_BASENAME));
        let other = dir.path().join("crash.log");
        std::fs::write(&log, b"old").unwrap();
        std::fs::write(&other, b"keep").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        prune_old_logs(dir.path(), Duration::from_millis(1));

        assert!(!log.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_recent_logs_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_BASENAME);
        std::fs::write(&log, b"new").unwrap();

        prune_old_logs(dir.path(), Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS));
        assert!(log.exists());
    }
}
