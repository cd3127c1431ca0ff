//! Polling reader over a growing log file.
//!
//! The durable fallback when no live broker exists: install transcripts and
//! retained output files are tailed by offset. A read may end mid-line; the
//! fragment is buffered and joined with the next read so consumers only ever
//! see whole lines.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Minimum sleep between polls of an idle file.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    position: u64,
    partial: String,
}

impl FileTailer {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            position: 0,
            partial: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read everything new since the last poll and return the complete
    /// lines, trailing newlines included. A missing file reads as empty:
    /// the writer may simply not have created it yet.
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        file.seek(SeekFrom::Start(self.position)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        self.position += buf.len() as u64;

        let mut chunk = std::mem::take(&mut self.partial);
        chunk.push_str(&String::from_utf8_lossy(&buf));
        let mut lines: Vec<String> = chunk.split_inclusive('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|line| !line.ends_with('\n')) {
            self.partial = lines.pop().unwrap_or_default();
        }
        Ok(lines)
    }

    /// Hand back any buffered fragment. Called once the writer is known to
    /// be done, when a trailing unterminated line is final output.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}
