//! Engine-level failure kinds.

use runlet_env::ProvisionError;
use runlet_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("script {0} not found")]
    ScriptNotFound(i64),

    #[error("execution {0} not found")]
    ExecutionNotFound(i64),

    /// The execution exists but is neither streaming live nor terminal yet.
    #[error("execution {0} has no subscribable output")]
    SubscriptionUnavailable(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
