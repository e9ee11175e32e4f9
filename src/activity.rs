//! Server-side activity log.
//!
//! Log records go to stderr and to a file. Controllers receive the file's
//! contents when they connect, so the router holds an [`ActivityLog`] handle
//! to the same file the logger writes.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Handle to the activity log file.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate (or create) the log file and return a writer that copies
    /// everything to both stderr and the file.
    pub fn open_tee(&self) -> io::Result<TeeWriter> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(TeeWriter {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Current contents of the log.
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// Writes to stderr and to the activity log file.
///
/// Handed to `env_logger` as a pipe target.
#[derive(Clone)]
pub struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // stderr is best effort; the file is the record controllers read.
        let _ = io::stderr().write_all(buf);
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tee_truncates_and_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tether.log");
        std::fs::write(&path, "stale line\n").unwrap();

        let log = ActivityLog::new(&path);
        let mut tee = log.open_tee().unwrap();
        tee.write_all(b"[INFO] router started\n").unwrap();
        tee.flush().unwrap();

        let contents = log.read().await.unwrap();
        assert_eq!(contents, b"[INFO] router started\n");
    }

    #[tokio::test]
    async fn test_missing_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        let log = ActivityLog::new(dir.path().join("absent.log"));
        assert!(log.read().await.is_err());
    }
}
