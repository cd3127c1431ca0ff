//! Child process lifecycle: spawn, capture, timeout, terminate.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{LineKind, OutputBroker};
use crate::error::RunnerError;

/// Grace period between the polite stop signal and the forceful kill.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on draining the output streams once the child is gone.
/// Protects against grandchildren that inherited the pipes and never exit.
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Exit code recorded when the child was stopped by timeout or cancellation.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Everything needed to launch one script run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// The runtime's interpreter executable.
    pub interpreter: PathBuf,
    /// Flags passed before the script path (e.g. `-u` for unbuffered
    /// stdout when the runtime supports it).
    pub interpreter_args: Vec<String>,
    pub script: PathBuf,
    /// Working directory of the child; the script's own directory.
    pub workdir: PathBuf,
    /// Total wall-clock budget for the run.
    pub timeout: Duration,
    /// Per-line idle timeout on the output streams. An idle read only
    /// yields control; it never fails the run.
    pub idle_timeout: Duration,
}

/// Terminal description of a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == 0
    }
}

/// Run the child to completion, piping both output streams into the broker.
///
/// Stdout and stderr are each surfaced as an ordered line stream; the two
/// interleave by arrival. When the wall clock expires or `cancel` fires,
/// the child is stopped with signal escalation and the streams are drained
/// before returning. A non-zero natural exit appends the
/// `Error: Script exited with return code <n>` footer after the drain.
pub async fn run(
    spec: &RunSpec,
    broker: &OutputBroker,
    cancel: &CancellationToken,
) -> Result<RunOutcome, RunnerError> {
    let mut child = Command::new(&spec.interpreter)
        .args(&spec.interpreter_args)
        .arg(&spec.script)
        .current_dir(&spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunnerError::Spawn)?;
    debug!(pid = child.id(), script = %spec.script.display(), "child started");

    let stdout = child.stdout.take().ok_or(RunnerError::StdioUnavailable)?;
    let stderr = child.stderr.take().ok_or(RunnerError::StdioUnavailable)?;
    let mut stdout_pump = tokio::spawn(pump(
        stdout,
        LineKind::Stdout,
        broker.clone(),
        spec.idle_timeout,
    ));
    let mut stderr_pump = tokio::spawn(pump(
        stderr,
        LineKind::Stderr,
        broker.clone(),
        spec.idle_timeout,
    ));

    let mut timed_out = false;
    let mut cancelled = false;
    let mut natural_exit = None;
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => natural_exit = Some(status.code().unwrap_or(KILLED_EXIT_CODE)),
            Err(err) => {
                warn!(%err, "failed to await child");
                natural_exit = Some(KILLED_EXIT_CODE);
            }
        },
        _ = tokio::time::sleep(spec.timeout) => timed_out = true,
        _ = cancel.cancelled() => cancelled = true,
    }
    if natural_exit.is_none() {
        terminate(&mut child).await;
    }

    // Both streams hit EOF once the child is gone; drain what they buffered.
    let drained = tokio::time::timeout(DRAIN_LIMIT, async {
        let _ = (&mut stdout_pump).await;
        let _ = (&mut stderr_pump).await;
    })
    .await;
    if drained.is_err() {
        warn!("child output streams did not drain, aborting readers");
        stdout_pump.abort();
        stderr_pump.abort();
    }

    let exit_code = natural_exit.unwrap_or(KILLED_EXIT_CODE);
    if natural_exit.is_some() && exit_code != 0 {
        let footer = format!("Error: Script exited with return code {exit_code}");
        if let Err(err) = broker.publish(LineKind::Stdout, &footer).await {
            warn!(%err, "failed to record exit footer");
        }
    }

    Ok(RunOutcome {
        exit_code,
        timed_out,
        cancelled,
    })
}

/// Forward one stream into the broker, line by line.
async fn pump<R>(reader: R, kind: LineKind, broker: OutputBroker, idle_timeout: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match tokio::time::timeout(idle_timeout, lines.next_line()).await {
            // Idle stream; yield and try again. Liveness is owned by the
            // wall-clock guard in `run`.
            Err(_) => continue,
            Ok(Ok(Some(line))) => {
                if let Err(err) = broker.publish(kind, &line).await {
                    warn!(%err, "failed to persist output line");
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                warn!(%err, "error reading child stream");
                break;
            }
        }
    }
}

/// Polite stop, then kill. SIGTERM first on Unix so the script can flush;
/// the kill only lands if the grace period lapses.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "child ignored stop signal, killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
