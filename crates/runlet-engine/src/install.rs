//! Live view of a dependency installation transcript.
//!
//! Installation has no broker: the transcript is tailed straight off disk
//! until the end marker appears. The marker protocol is the provisioner's:
//! `install.finished` means the installation ended, `install.ok` means it
//! succeeded.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use runlet_env::ScriptPaths;
use runlet_runner::{FileTailer, POLL_INTERVAL};

/// Lazy line sequence over `install.log`, ending with a `STATUS:` line.
///
/// The wait budget bounds how long the stream waits for the end marker
/// after the transcript last grew; new output resets it. An expired budget
/// closes the stream with `STATUS: FAILURE`.
pub struct InstallLogStream {
    paths: ScriptPaths,
    tailer: FileTailer,
    queue: VecDeque<String>,
    wait: Duration,
    deadline: tokio::time::Instant,
    done: bool,
}

impl InstallLogStream {
    pub fn new<P: AsRef<Path>>(scripts_dir: P, script_id: i64, wait: Duration) -> Self {
        let paths = ScriptPaths::new(scripts_dir, script_id);
        let tailer = FileTailer::new(paths.install_log());
        Self {
            paths,
            tailer,
            queue: VecDeque::new(),
            wait,
            deadline: tokio::time::Instant::now() + wait,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.queue.pop_front() {
                return Some(line);
            }
            if self.done {
                return None;
            }
            let lines = self.tailer.poll().await.unwrap_or_default();
            if !lines.is_empty() {
                self.deadline = tokio::time::Instant::now() + self.wait;
                self.queue.extend(lines);
                continue;
            }
            if self.paths.install_finished().exists() {
                // Marker is written after the last transcript byte; one more
                // poll picks up anything that landed in between.
                let mut tail = self.tailer.poll().await.unwrap_or_default();
                if let Some(partial) = self.tailer.take_partial() {
                    tail.push(partial);
                }
                self.queue.extend(tail);
                let status = if self.paths.install_ok().exists() {
                    "SUCCESS"
                } else {
                    "FAILURE"
                };
                self.queue.push_back(format!("STATUS: {status}"));
                self.done = true;
                continue;
            }
            if tokio::time::Instant::now() >= self.deadline {
                self.queue.push_back("STATUS: FAILURE".to_string());
                self.done = true;
                continue;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await {
            lines.push(line);
        }
        lines
    }
}
