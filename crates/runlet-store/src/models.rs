//! Row types for the script catalog and execution ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single execution attempt.
///
/// `Pending` and `Running` are the live states; a script can have at most
/// one live execution at a time. `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    #[sqlx(rename = "PENDING")]
    Pending,
    #[sqlx(rename = "RUNNING")]
    Running,
    #[sqlx(rename = "SUCCESS")]
    Success,
    #[sqlx(rename = "FAILURE")]
    Failure,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-authored script. Owned by the CRUD collaborator; the engine reads
/// it and only ever writes `Dependency::installed_version`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Script {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A declared package dependency of a script.
///
/// `version_spec` is an opaque constraint string: empty or `*` means latest,
/// a `==`/`>=`/`<=`/`>`/`<`/`~=` prefix is passed through to the installer,
/// anything else degrades to unconstrained. `installed_version` is written
/// back after provisioning reports the actually-installed version.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dependency {
    pub id: i64,
    pub script_id: i64,
    pub package_name: String,
    pub version_spec: String,
    pub installed_version: Option<String>,
}

/// A cron trigger attached to a script. Five-field expression, evaluated in
/// the server's local timezone.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: i64,
    pub script_id: i64,
    pub cron_expression: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One attempt to run a script.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    pub id: i64,
    pub script_id: i64,
    pub schedule_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub log_output: Option<String>,
    pub error_message: Option<String>,
}

/// A label attached to scripts by the CRUD collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_stored_form() {
        assert_eq!(ExecutionStatus::Pending.to_string(), "PENDING");
        assert_eq!(ExecutionStatus::Failure.to_string(), "FAILURE");
    }

    #[test]
    fn terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failure.is_terminal());
    }
}
