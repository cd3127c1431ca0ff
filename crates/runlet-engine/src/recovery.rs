//! Closing the ledger across process boundaries.
//!
//! A crashed or restarted server leaves executions in `PENDING`/`RUNNING`
//! with no process behind them. Before the scheduler accepts its first tick
//! those rows are swept to `FAILURE`, restoring the one-live-execution
//! invariant.

use runlet_store::Store;
use tracing::{info, warn};

pub const INTERRUPTED_BY_RESTART: &str = "Execution interrupted by server restart";
pub const INTERRUPTED_BY_SHUTDOWN: &str = "Execution interrupted by server shutdown";

/// Sweep stale executions left over by a prior process.
pub async fn recover_on_startup(store: &Store) -> Result<u64, runlet_store::StoreError> {
    let stale = store.scan_unterminated().await?;
    for execution in &stale {
        warn!(
            execution_id = execution.id,
            script_id = execution.script_id,
            status = %execution.status,
            "found stale execution, marking as failed"
        );
    }
    let swept = store.fail_all_unterminated(INTERRUPTED_BY_RESTART).await?;
    if swept > 0 {
        info!(swept, "closed stale executions from previous run");
    }
    Ok(swept)
}
