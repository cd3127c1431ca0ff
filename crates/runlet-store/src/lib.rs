//! SQLite-backed script catalog and execution ledger.
//!
//! The store is the single source of truth for execution status. Scripts,
//! tags, dependencies and schedules are owned by the CRUD collaborator and
//! read here; executions and `Dependency::installed_version` are written by
//! the engine through the guarded operations on [`Store`].

mod error;
mod models;
mod store;

pub use error::{Result, StoreError};
pub use models::{Dependency, Execution, ExecutionStatus, Schedule, Script, Tag};
pub use store::{Store, INTERRUPTED_BY_NEW_REQUEST};
