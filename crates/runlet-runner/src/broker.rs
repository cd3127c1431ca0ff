//! Single-writer output persistence with live fan-out.
//!
//! For each execution the broker is the only writer of the output file and
//! the multiplexer feeding every live subscriber. The file is the durable
//! record; the in-memory broadcast channel is the primary live delivery
//! path, bounded so a slow subscriber can never stall the writer or its
//! peers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Queue depth per subscriber before the subscription is cut off.
const SUBSCRIBER_QUEUE: usize = 256;

/// Line delivered to a subscriber whose queue overflowed.
pub const SLOW_CONSUMER_LINE: &str = "ERROR: slow consumer, subscription terminated";

/// Closing marker delivered after the terminal status line.
pub const CLOSE_LINE: &str = "Execution finished.";

/// Prefix stamped onto stderr lines in the durable log.
pub const STDERR_PREFIX: &str = "ERROR: ";

/// Classification of a captured output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Stdout,
    Stderr,
}

/// Terminal status surfaced to subscribers as a `STATUS:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Success,
    Failure,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TerminalStatus::Success => "SUCCESS",
            TerminalStatus::Failure => "FAILURE",
        })
    }
}

#[derive(Debug, Clone)]
enum Event {
    Line(String),
    Finished(TerminalStatus),
}

struct WriterState {
    file: File,
    written: u64,
    finished: Option<TerminalStatus>,
}

struct Shared {
    path: PathBuf,
    state: Mutex<WriterState>,
    events: broadcast::Sender<Event>,
}

/// Handle to one execution's output. Cheap to clone; all clones write
/// through the same serialized writer.
#[derive(Clone)]
pub struct OutputBroker {
    shared: Arc<Shared>,
}

impl OutputBroker {
    /// Open the output file, truncating anything left from a prior attempt.
    /// Called before the child is spawned, so subscribers that poll for the
    /// file's existence never race the process start.
    pub async fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        let (events, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                state: Mutex::new(WriterState {
                    file,
                    written: 0,
                    finished: None,
                }),
                events,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Append one captured line: stdout verbatim, stderr with the `ERROR: `
    /// prefix. The line is flushed and fsync'd before it is offered to live
    /// subscribers, so a reader starting from offset 0 always sees a
    /// coherent prefix of what subscribers saw.
    pub async fn publish(&self, kind: LineKind, line: &str) -> std::io::Result<()> {
        let record = match kind {
            LineKind::Stdout => format!("{line}\n"),
            LineKind::Stderr => format!("{STDERR_PREFIX}{line}\n"),
        };
        let mut state = self.shared.state.lock().await;
        if state.finished.is_some() {
            debug!("dropping line published after finish");
            return Ok(());
        }
        state.file.write_all(record.as_bytes()).await?;
        state.file.flush().await?;
        state.file.sync_data().await?;
        state.written += record.len() as u64;
        let _ = self.shared.events.send(Event::Line(record));
        Ok(())
    }

    /// Seal the output: no further lines are accepted, and every live
    /// subscriber is handed the terminal status once its queue drains.
    pub async fn finish(&self, status: TerminalStatus) -> std::io::Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.finished.is_some() {
            return Ok(());
        }
        state.file.sync_all().await?;
        state.finished = Some(status);
        let _ = self.shared.events.send(Event::Finished(status));
        Ok(())
    }

    /// The full durable record as written so far.
    pub async fn contents(&self) -> std::io::Result<String> {
        let _state = self.shared.state.lock().await;
        tokio::fs::read_to_string(&self.shared.path).await
    }

    /// Attach a subscriber. The writer lock makes the snapshot exact: a
    /// from-start subscriber replays the file up to the snapshot and the
    /// live channel continues precisely at the next line.
    pub async fn subscribe(&self, mode: SubscribeMode) -> std::io::Result<OutputSubscription> {
        let (receiver, snapshot, finished) = {
            let state = self.shared.state.lock().await;
            (self.shared.events.subscribe(), state.written, state.finished)
        };
        let prefix = match mode {
            SubscribeMode::Live => VecDeque::new(),
            SubscribeMode::FromStart => {
                let bytes = tokio::fs::read(&self.shared.path).await?;
                let replay = String::from_utf8_lossy(&bytes[..snapshot.min(bytes.len() as u64) as usize]);
                replay
                    .split_inclusive('\n')
                    .map(str::to_string)
                    .collect()
            }
        };
        Ok(OutputSubscription {
            prefix,
            receiver: Some(receiver),
            pending_finish: finished,
            phase: Phase::Streaming,
        })
    }
}

/// How much history a new subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Replay the output from offset 0, then tail live to terminal status.
    FromStart,
    /// Only lines produced after subscription, tailed to terminal status.
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Closing,
    Done,
}

/// A lazy line sequence over one execution's output.
///
/// Data lines keep their trailing newline (they are exactly the bytes of the
/// durable record); the `STATUS:` and closing markers do not. After the
/// closing marker the sequence ends.
pub struct OutputSubscription {
    prefix: VecDeque<String>,
    receiver: Option<broadcast::Receiver<Event>>,
    pending_finish: Option<TerminalStatus>,
    phase: Phase,
}

impl OutputSubscription {
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.phase {
                Phase::Streaming => {
                    if let Some(line) = self.prefix.pop_front() {
                        return Some(line);
                    }
                    if let Some(status) = self.pending_finish.take() {
                        self.phase = Phase::Closing;
                        return Some(format!("STATUS: {status}"));
                    }
                    let Some(receiver) = self.receiver.as_mut() else {
                        self.phase = Phase::Done;
                        return None;
                    };
                    match receiver.recv().await {
                        Ok(Event::Line(line)) => return Some(line),
                        Ok(Event::Finished(status)) => {
                            self.phase = Phase::Closing;
                            return Some(format!("STATUS: {status}"));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "subscriber queue overflowed, cutting subscription");
                            self.phase = Phase::Done;
                            return Some(SLOW_CONSUMER_LINE.to_string());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.phase = Phase::Done;
                            return None;
                        }
                    }
                }
                Phase::Closing => {
                    self.phase = Phase::Done;
                    return Some(CLOSE_LINE.to_string());
                }
                Phase::Done => return None,
            }
        }
    }

    /// Collect the remainder of the sequence. Test and replay helper.
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await {
            lines.push(line);
        }
        lines
    }
}

/// A sequence replayed from already-final output, for subscribers arriving
/// after the execution ended and its broker is gone.
pub fn replay_subscription(
    log_output: &str,
    status: TerminalStatus,
) -> OutputSubscription {
    OutputSubscription {
        prefix: log_output.split_inclusive('\n').map(str::to_string).collect(),
        receiver: None,
        pending_finish: Some(status),
        phase: Phase::Streaming,
    }
}
