//! The transactional store behind the execution engine.
//!
//! Every status transition is one committed transaction, and the terminal
//! transitions are guarded on the current status so a competing transition
//! (an interrupting run, a recovery sweep) turns later writers into no-ops
//! instead of corrupting the ledger.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;
use crate::models::{Dependency, Execution, Schedule, Script, Tag};

/// Error message recorded on an execution displaced by a newer run request.
pub const INTERRUPTED_BY_NEW_REQUEST: &str = "Execution interrupted by new execution request";

const EXECUTION_COLUMNS: &str = "id, script_id, schedule_id, started_at, completed_at, \
     status, log_output, error_message";

/// Handle to the SQLite catalog. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `database_url` and bring
    /// the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single never-recycled connection, so
    /// the database lives exactly as long as the store.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----- executions -----

    /// Create a new `PENDING` execution, displacing any live execution of the
    /// same script in the same transaction. This is the serialization point
    /// for per-script exclusivity: the displaced row is terminally failed
    /// before the insert, so the one-live-execution index can never trip.
    pub async fn begin_execution(
        &self,
        script_id: i64,
        schedule_id: Option<i64>,
    ) -> Result<Execution> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let displaced = sqlx::query(
            "UPDATE executions SET status = 'FAILURE', completed_at = ?, error_message = ? \
             WHERE script_id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(now)
        .bind(INTERRUPTED_BY_NEW_REQUEST)
        .bind(script_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if displaced > 0 {
            debug!(script_id, displaced, "displaced live execution");
        }
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "INSERT INTO executions (script_id, schedule_id, started_at, status) \
             VALUES (?, ?, ?, 'PENDING') RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(script_id)
        .bind(schedule_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(execution)
    }

    /// Record a scheduled fire that was refused before anything ran (script
    /// gone inactive, dependencies missing). Inserts an already-terminal row.
    pub async fn record_refused_execution(
        &self,
        script_id: i64,
        schedule_id: Option<i64>,
        error_message: &str,
    ) -> Result<Execution> {
        let now = Utc::now();
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "INSERT INTO executions \
             (script_id, schedule_id, started_at, completed_at, status, error_message) \
             VALUES (?, ?, ?, ?, 'FAILURE', ?) RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(script_id)
        .bind(schedule_id)
        .bind(now)
        .bind(now)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await?;
        Ok(execution)
    }

    /// `PENDING` -> `RUNNING`. Returns false when the execution was already
    /// moved on (typically displaced by a newer run request).
    pub async fn mark_running(&self, execution_id: i64) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE executions SET status = 'RUNNING' WHERE id = ? AND status = 'PENDING'",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Terminal transition to `SUCCESS`. Guarded; returns false if the row
    /// was no longer live.
    pub async fn mark_success(&self, execution_id: i64, log_output: &str) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE executions SET status = 'SUCCESS', completed_at = ?, log_output = ? \
             WHERE id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .bind(log_output)
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Terminal transition to `FAILURE`. Guarded; returns false if the row
    /// was no longer live.
    pub async fn mark_failure(
        &self,
        execution_id: i64,
        log_output: Option<&str>,
        error_message: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE executions SET status = 'FAILURE', completed_at = ?, log_output = ?, \
             error_message = ? WHERE id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .bind(log_output)
        .bind(error_message)
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    pub async fn get_running_for(&self, script_id: i64) -> Result<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE script_id = ? AND status IN ('PENDING', 'RUNNING')"
        ))
        .bind(script_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    /// Every execution still in a live state, across all scripts.
    pub async fn scan_unterminated(&self) -> Result<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE status IN ('PENDING', 'RUNNING') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    /// Sweep every live execution into `FAILURE` with the given message.
    /// Used on startup (stale rows from a dead process) and on shutdown.
    pub async fn fail_all_unterminated(&self, error_message: &str) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE executions SET status = 'FAILURE', completed_at = ?, error_message = ? \
             WHERE status IN ('PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .bind(error_message)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    /// Most recent executions of a script, newest first.
    pub async fn list_executions(
        &self,
        script_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE script_id = ? \
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(script_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    // ----- scripts -----

    pub async fn insert_script(
        &self,
        name: &str,
        description: Option<&str>,
        content: &str,
        is_active: bool,
    ) -> Result<Script> {
        let now = Utc::now();
        let script = sqlx::query_as::<_, Script>(
            "INSERT INTO scripts (name, description, content, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING id, name, description, content, is_active, created_at, updated_at",
        )
        .bind(name)
        .bind(description)
        .bind(content)
        .bind(is_active)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(script)
    }

    pub async fn get_script(&self, script_id: i64) -> Result<Option<Script>> {
        let script = sqlx::query_as::<_, Script>(
            "SELECT id, name, description, content, is_active, created_at, updated_at \
             FROM scripts WHERE id = ?",
        )
        .bind(script_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(script)
    }

    pub async fn set_script_active(&self, script_id: i64, is_active: bool) -> Result<bool> {
        let rows = sqlx::query("UPDATE scripts SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(script_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Delete a script. Dependencies, schedules and executions cascade.
    pub async fn delete_script(&self, script_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM scripts WHERE id = ?")
            .bind(script_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    // ----- dependencies -----

    pub async fn insert_dependency(
        &self,
        script_id: i64,
        package_name: &str,
        version_spec: &str,
    ) -> Result<Dependency> {
        let dependency = sqlx::query_as::<_, Dependency>(
            "INSERT INTO dependencies (script_id, package_name, version_spec) VALUES (?, ?, ?) \
             RETURNING id, script_id, package_name, version_spec, installed_version",
        )
        .bind(script_id)
        .bind(package_name)
        .bind(version_spec)
        .fetch_one(&self.pool)
        .await?;
        Ok(dependency)
    }

    pub async fn list_dependencies(&self, script_id: i64) -> Result<Vec<Dependency>> {
        let dependencies = sqlx::query_as::<_, Dependency>(
            "SELECT id, script_id, package_name, version_spec, installed_version \
             FROM dependencies WHERE script_id = ? ORDER BY id",
        )
        .bind(script_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(dependencies)
    }

    /// The one write the engine owns on the script side: the version a
    /// provisioning run actually installed.
    pub async fn set_installed_version(
        &self,
        dependency_id: i64,
        installed_version: Option<&str>,
    ) -> Result<bool> {
        let rows = sqlx::query("UPDATE dependencies SET installed_version = ? WHERE id = ?")
            .bind(installed_version)
            .bind(dependency_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    // ----- schedules -----

    pub async fn insert_schedule(
        &self,
        script_id: i64,
        cron_expression: &str,
        description: Option<&str>,
    ) -> Result<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>(
            "INSERT INTO schedules (script_id, cron_expression, description, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, script_id, cron_expression, description, created_at",
        )
        .bind(script_id)
        .bind(cron_expression)
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn get_schedule(&self, schedule_id: i64) -> Result<Option<Schedule>> {
        let schedule = sqlx::query_as::<_, Schedule>(
            "SELECT id, script_id, cron_expression, description, created_at \
             FROM schedules WHERE id = ?",
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self, script_id: i64) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT id, script_id, cron_expression, description, created_at \
             FROM schedules WHERE script_id = ? ORDER BY id",
        )
        .bind(script_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    /// Schedules of every active script, for scheduler startup.
    pub async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT s.id, s.script_id, s.cron_expression, s.description, s.created_at \
             FROM schedules s JOIN scripts sc ON sc.id = s.script_id \
             WHERE sc.is_active = 1 ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    /// Delete a schedule. Executions that referenced it keep their row with
    /// `schedule_id` nulled.
    pub async fn delete_schedule(&self, schedule_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    // ----- tags -----

    /// Get or create a tag by name.
    pub async fn upsert_tag(&self, name: &str) -> Result<Tag> {
        if let Some(tag) = sqlx::query_as::<_, Tag>("SELECT id, name FROM tags WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(tag);
        }
        let tag =
            sqlx::query_as::<_, Tag>("INSERT INTO tags (name) VALUES (?) RETURNING id, name")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(tag)
    }

    pub async fn tag_script(&self, script_id: i64, tag_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO script_tags (script_id, tag_id) VALUES (?, ?)")
            .bind(script_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn untag_script(&self, script_id: i64, tag_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM script_tags WHERE script_id = ? AND tag_id = ?")
            .bind(script_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    pub async fn list_tags(&self, script_id: i64) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            "SELECT t.id, t.name FROM tags t \
             JOIN script_tags st ON st.tag_id = t.id \
             WHERE st.script_id = ? ORDER BY t.name",
        )
        .bind(script_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }
}
