//! Re-exports of the engine surface, for embedders and the test suite.

pub use runlet_config::Settings;
pub use runlet_engine::{
    Engine, EngineError, InstallLogStream, EXECUTION_CANCELLED, INTERRUPTED_BY_RESTART,
    INTERRUPTED_BY_SHUTDOWN, SCRIPT_INACTIVE, UNINSTALLED_DEPENDENCIES,
};
pub use runlet_store::{
    Dependency, Execution, ExecutionStatus, Schedule, Script, Store, INTERRUPTED_BY_NEW_REQUEST,
};
