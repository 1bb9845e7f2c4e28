//! Non-blocking line reader for the control FIFO
//!
//! The FIFO is opened read-only with `O_NONBLOCK`, so a poll never stalls the frame loop.
//! Bytes are accumulated in a partial-line buffer and handed out one complete line at a time.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 4096;

/// Longest partial line kept while waiting for its newline
const MAX_PENDING: usize = 64 * 1024;

pub struct ControlChannel {
    file: File,
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl ControlChannel {
    /// Open the control FIFO, creating it first when `create` is set and it does not exist
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        if create && !path.exists() {
            make_fifo(path)?;
            info!("Created control FIFO {:?}", path);
        }

        let file = open_nonblocking(path).map_err(|source| Error::FifoOpen {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Listening for commands on {:?}", path);

        Ok(Self {
            file,
            partial: Vec::new(),
            lines: VecDeque::new(),
        })
    }

    /// Return the next complete line, or `None` if none is pending.
    ///
    /// Never blocks. Line terminators are stripped; blank lines are skipped.
    pub fn poll_line(&mut self) -> Result<Option<String>> {
        if self.lines.is_empty() {
            self.fill()?;
        }
        Ok(self.lines.pop_front())
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.file.read(&mut chunk) {
                // No writer attached, or the writer closed its end
                Ok(0) => break,
                Ok(n) => {
                    self.partial.extend_from_slice(&chunk[..n]);
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                debug!("Control line: {:?}", line);
                self.lines.push_back(line.to_string());
            }
        }

        if self.partial.len() > MAX_PENDING {
            debug!("Discarding {} bytes without a newline", self.partial.len());
            self.partial.clear();
        }
        Ok(())
    }
}

#[cfg(unix)]
fn open_nonblocking(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let fifo_error = |source| Error::FifoOpen {
        path: path.to_path_buf(),
        source,
    };

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| fifo_error(std::io::Error::new(ErrorKind::InvalidInput, e)))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        return Err(fifo_error(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(path: &Path) -> Result<()> {
    Err(Error::FifoOpen {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::Unsupported, "named pipes require a Unix system"),
    })
}
