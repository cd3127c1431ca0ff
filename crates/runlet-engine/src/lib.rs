//! The execution engine: coordinator, cron scheduler and crash recovery,
//! wired behind one handle constructed at startup.
//!
//! The [`Engine`] is the surface the HTTP/WebSocket collaborator talks to:
//! start runs, cancel them, subscribe to live output or install logs, and
//! page through the execution ledger.

mod coordinator;
mod error;
mod install;
mod recovery;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use runlet_config::Settings;
use runlet_runner::{OutputSubscription, SubscribeMode};
use runlet_store::{Dependency, Execution, Schedule, Store};

pub use coordinator::{Coordinator, EXECUTION_CANCELLED, UNINSTALLED_DEPENDENCIES};
pub use error::EngineError;
pub use install::InstallLogStream;
pub use recovery::{recover_on_startup, INTERRUPTED_BY_RESTART, INTERRUPTED_BY_SHUTDOWN};
pub use scheduler::{CronScheduler, SCRIPT_INACTIVE};

/// Grace period executions get to finish naturally during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Engine {
    coordinator: Arc<Coordinator>,
    scheduler: CronScheduler,
}

impl Engine {
    /// Recover the ledger, then bring up the coordinator and the scheduler.
    /// Recovery runs strictly before the scheduler's first tick.
    pub async fn start(settings: Settings, store: Store) -> Result<Self, EngineError> {
        recovery::recover_on_startup(&store).await?;
        let coordinator = Arc::new(Coordinator::new(settings, store));
        let scheduler = CronScheduler::start(Arc::clone(&coordinator)).await?;
        Ok(Self {
            coordinator,
            scheduler,
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    /// Run a script now. Returns the new execution id immediately.
    pub async fn run(&self, script_id: i64) -> Result<i64, EngineError> {
        self.coordinator.run(script_id, None).await
    }

    /// Cancel a live execution; false when nothing is running under the id.
    pub async fn cancel(&self, execution_id: i64) -> bool {
        self.coordinator.cancel(execution_id).await
    }

    /// Attach to an execution's output stream.
    pub async fn subscribe(
        &self,
        execution_id: i64,
        mode: SubscribeMode,
    ) -> Result<OutputSubscription, EngineError> {
        self.coordinator.subscribe(execution_id, mode).await
    }

    /// Tail a script's dependency installation transcript.
    pub fn subscribe_install(&self, script_id: i64) -> InstallLogStream {
        let settings = self.coordinator.settings();
        InstallLogStream::new(
            settings.scripts_dir.clone(),
            script_id,
            settings.install_timeout(),
        )
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<Execution, EngineError> {
        self.coordinator.get_execution(execution_id).await
    }

    pub async fn list_executions(
        &self,
        script_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>, EngineError> {
        self.coordinator
            .list_executions(script_id, limit, offset)
            .await
    }

    /// Provision a script's environment on demand and refresh the recorded
    /// installed versions.
    pub async fn install_dependencies(
        &self,
        script_id: i64,
    ) -> Result<Vec<Dependency>, EngineError> {
        self.coordinator.install_dependencies(script_id).await
    }

    /// Installed packages of a script's runtime with a newer release
    /// available.
    pub async fn outdated_packages(&self, script_id: i64) -> Result<Vec<String>, EngineError> {
        self.coordinator.outdated_packages(script_id).await
    }

    /// Remove one installed package from a script's runtime.
    pub async fn uninstall_dependency(
        &self,
        script_id: i64,
        package_name: &str,
    ) -> Result<(), EngineError> {
        self.coordinator
            .uninstall_dependency(script_id, package_name)
            .await
    }

    /// Tear down a deleted script's environment.
    pub async fn remove_script_environment(&self, script_id: i64) -> Result<(), EngineError> {
        self.coordinator.remove_script_environment(script_id).await
    }

    pub async fn add_schedule(&self, schedule: Schedule) {
        self.scheduler.add(schedule).await;
    }

    pub async fn remove_schedule(&self, script_id: i64, schedule_id: i64) {
        self.scheduler.remove(script_id, schedule_id).await;
    }

    /// Stop ticking, let live executions drain, and close whatever is left.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        info!("engine shutting down");
        self.scheduler.stop();
        self.coordinator.shutdown(SHUTDOWN_GRACE).await;
        let swept = self
            .coordinator
            .store()
            .fail_all_unterminated(INTERRUPTED_BY_SHUTDOWN)
            .await?;
        if swept > 0 {
            info!(swept, "closed executions interrupted by shutdown");
        }
        Ok(())
    }
}
