//! Raw inbound message log

use anyhow::{anyhow, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Appends every inbound message as `<topic>: <payload>`
pub struct SignalLog {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
    count: Mutex<usize>,
}

impl SignalLog {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            count: Mutex::new(0),
        })
    }

    /// Record one message; failures are logged, never propagated
    pub fn record(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.write_line(topic, payload) {
            warn!("Failed to write signal log {:?}: {}", self.path, e);
        }
    }

    fn write_line(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut file_lock = self
            .file
            .lock()
            .map_err(|_| anyhow!("signal log lock poisoned"))?;

        // Open file if not already open
        if file_lock.is_none() {
            *file_lock = Some(BufWriter::new(self.open_log_file()?));
            info!("Recording inbound signals to {:?}", self.path);
        }

        if let Some(ref mut writer) = *file_lock {
            let text = String::from_utf8_lossy(payload);
            writeln!(writer, "{}: {}", topic, text.replace('\n', " "))?;
            writer.flush()?;
        }

        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }

        Ok(())
    }

    fn open_log_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| anyhow!("Failed to open signal log: {}", e))
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Flush and close the file
    pub fn close(&self) -> Result<()> {
        if let Ok(mut lock) = self.file.lock() {
            if let Some(mut writer) = lock.take() {
                writer.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("signals.log");

        let log = SignalLog::new(&path).unwrap();
        log.record("diagnostics/device", br#"{"client_id":"esp32-01"}"#);
        log.record("test/echo", b"{\"value\":\n70}");
        log.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"diagnostics/device: {"client_id":"esp32-01"}"#);
        assert_eq!(lines[1], r#"test/echo: {"value": 70}"#);
        assert_eq!(log.count(), 2);

        // Reopening appends rather than truncating
        let again = SignalLog::new(&path).unwrap();
        again.record("test/echo", b"{}");
        again.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}
