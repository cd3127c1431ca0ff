//! Child process execution with durable output capture and live fan-out.
//!
//! The runner owns the subprocess lifecycle; the broker owns the output
//! file and the live subscriber channels; the tailer is the polling
//! fallback for logs that no live broker serves.

mod broker;
mod error;
mod runner;
mod tail;

pub use broker::{
    replay_subscription, LineKind, OutputBroker, OutputSubscription, SubscribeMode,
    TerminalStatus, CLOSE_LINE, SLOW_CONSUMER_LINE, STDERR_PREFIX,
};
pub use error::RunnerError;
pub use runner::{run, RunOutcome, RunSpec, KILLED_EXIT_CODE};
pub use tail::{FileTailer, POLL_INTERVAL};
