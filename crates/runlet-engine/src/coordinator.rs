//! End-to-end execution of a single script run.
//!
//! The coordinator drives provision -> dependency gate -> child process ->
//! terminal commit while keeping the ledger's per-script exclusivity: a new
//! run request displaces the previous live execution (the displaced row is
//! failed in the same transaction that inserts the new one) and cancels its
//! in-process task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runlet_config::Settings;
use runlet_env::Provisioner;
use runlet_runner::{
    replay_subscription, run as run_child, OutputBroker, OutputSubscription, RunSpec,
    SubscribeMode, TerminalStatus,
};
use runlet_store::{Dependency, Execution, ExecutionStatus, Script, Store};

use crate::error::EngineError;

/// Error recorded when the dependency gate refuses a run.
pub const UNINSTALLED_DEPENDENCIES: &str = "Cannot execute script with uninstalled dependencies";

/// Error recorded when an external cancellation stops a run.
pub const EXECUTION_CANCELLED: &str = "Execution cancelled";

struct ExecutionHandle {
    script_id: i64,
    cancel: CancellationToken,
    broker: OutputBroker,
}

#[derive(Default)]
struct Inflight {
    by_execution: HashMap<i64, ExecutionHandle>,
    by_script: HashMap<i64, i64>,
}

/// Runs scripts end-to-end. One instance per process, constructed at
/// startup and threaded through everything that needs to start or observe
/// executions.
pub struct Coordinator {
    store: Store,
    settings: Settings,
    inflight: Mutex<Inflight>,
    slots: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(settings: Settings, store: Store) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_executions.max(1)));
        Self {
            store,
            settings,
            inflight: Mutex::new(Inflight::default()),
            slots,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn provisioner(&self, script_id: i64) -> Provisioner {
        Provisioner::new(&self.settings.scripts_dir, script_id)
    }

    /// Whether the script is not ready to execute, from the runtime's point
    /// of view. Query problems count as not ready.
    pub async fn script_has_uninstalled_dependencies(&self, script_id: i64) -> bool {
        let dependencies = match self.store.list_dependencies(script_id).await {
            Ok(dependencies) => dependencies,
            Err(err) => {
                warn!(script_id, %err, "failed to load dependencies");
                return true;
            }
        };
        self.provisioner(script_id)
            .has_uninstalled_dependencies(&dependencies)
            .await
    }

    /// Start a run. Returns the new execution id as soon as the `PENDING`
    /// row exists; the run itself proceeds on its own task and every later
    /// failure is recorded on that row.
    pub async fn run(
        self: &Arc<Self>,
        script_id: i64,
        schedule_id: Option<i64>,
    ) -> Result<i64, EngineError> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .ok_or(EngineError::ScriptNotFound(script_id))?;

        let execution = self.store.begin_execution(script_id, schedule_id).await?;
        info!(
            script_id,
            execution_id = execution.id,
            schedule_id,
            "execution created"
        );

        let provisioner = self.provisioner(script_id);
        // The output file exists before the child (or even provisioning)
        // starts, so pollers and subscribers never race its creation.
        let broker = match self.prepare_output(&provisioner, execution.id).await {
            Ok(broker) => broker,
            Err(err) => {
                self.commit_failure(
                    execution.id,
                    None,
                    &format!("Failed to set up script environment: {err}"),
                )
                .await;
                return Ok(execution.id);
            }
        };

        let cancel = CancellationToken::new();
        let displaced_already = {
            let mut inflight = self.inflight.lock().await;
            let existing = inflight.by_script.get(&script_id).copied();
            if existing.is_some_and(|id| id > execution.id) {
                // A request that raced past us already displaced this row
                // in the ledger; the newest execution owns the script.
                true
            } else {
                if let Some(previous) = existing {
                    if let Some(handle) = inflight.by_execution.get(&previous) {
                        debug!(script_id, previous, "cancelling displaced execution task");
                        handle.cancel.cancel();
                    }
                }
                inflight.by_script.insert(script_id, execution.id);
                inflight.by_execution.insert(
                    execution.id,
                    ExecutionHandle {
                        script_id,
                        cancel: cancel.clone(),
                        broker: broker.clone(),
                    },
                );
                false
            }
        };
        if displaced_already {
            let _ = broker.finish(TerminalStatus::Failure).await;
            self.remove_output_file(&broker).await;
            return Ok(execution.id);
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator
                .drive(script, execution.id, broker, cancel)
                .await;
        });
        Ok(execution.id)
    }

    async fn prepare_output(
        &self,
        provisioner: &Provisioner,
        execution_id: i64,
    ) -> std::io::Result<OutputBroker> {
        tokio::fs::create_dir_all(provisioner.paths().script_dir()).await?;
        OutputBroker::create(provisioner.paths().output_file(execution_id)).await
    }

    /// The spawned body of one execution.
    async fn drive(
        self: Arc<Self>,
        script: Script,
        execution_id: i64,
        broker: OutputBroker,
        cancel: CancellationToken,
    ) {
        let _slot = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let script_id = script.id;
        let provisioner = self.provisioner(script_id);

        // Reconcile the environment and record what actually got installed.
        let dependencies = match self.store.list_dependencies(script_id).await {
            Ok(dependencies) => dependencies,
            Err(err) => {
                self.fail_before_start(
                    script_id,
                    execution_id,
                    &broker,
                    &format!("Failed to set up script environment: {err}"),
                )
                .await;
                return;
            }
        };
        match provisioner.provision(&script.content, &dependencies).await {
            Ok(installed) => {
                for dependency in &dependencies {
                    let version = installed.version_for(&dependency.package_name);
                    if version != dependency.installed_version.as_deref() {
                        if let Err(err) = self
                            .store
                            .set_installed_version(dependency.id, version)
                            .await
                        {
                            warn!(script_id, %err, "failed to record installed version");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(script_id, execution_id, %err, "environment setup failed");
                self.fail_before_start(
                    script_id,
                    execution_id,
                    &broker,
                    &format!("Failed to set up script environment: {err}"),
                )
                .await;
                return;
            }
        }

        let dependencies = self
            .store
            .list_dependencies(script_id)
            .await
            .unwrap_or(dependencies);
        if provisioner.has_uninstalled_dependencies(&dependencies).await {
            self.fail_before_start(script_id, execution_id, &broker, UNINSTALLED_DEPENDENCIES)
                .await;
            return;
        }

        match self.store.mark_running(execution_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Displaced while pending; the interrupting run owns the
                // script now.
                debug!(execution_id, "execution displaced before start");
                let _ = broker.finish(TerminalStatus::Failure).await;
                self.cleanup(script_id, execution_id).await;
                return;
            }
            Err(err) => {
                error!(execution_id, %err, "failed to mark execution running");
                let _ = broker.finish(TerminalStatus::Failure).await;
                self.cleanup(script_id, execution_id).await;
                return;
            }
        }

        let paths = provisioner.paths();
        let spec = RunSpec {
            interpreter: paths.interpreter(),
            // Unbuffered stdout, so output reaches subscribers as produced.
            interpreter_args: vec!["-u".to_string()],
            script: paths.script_file(),
            workdir: paths.script_dir().to_path_buf(),
            timeout: self.settings.max_execution_time(),
            idle_timeout: self.settings.stream_idle_timeout(),
        };

        match run_child(&spec, &broker, &cancel).await {
            Ok(outcome) => {
                let status = if outcome.success() {
                    TerminalStatus::Success
                } else {
                    TerminalStatus::Failure
                };
                if let Err(err) = broker.finish(status).await {
                    warn!(execution_id, %err, "failed to seal output");
                }
                let log = broker.contents().await.unwrap_or_default();
                if outcome.cancelled {
                    self.commit_failure(execution_id, Some(&log), EXECUTION_CANCELLED)
                        .await;
                } else if outcome.timed_out {
                    let message = format!(
                        "Script execution timed out after {} seconds",
                        self.settings.max_execution_time
                    );
                    self.commit_failure(execution_id, Some(&log), &message).await;
                } else if outcome.exit_code != 0 {
                    let message =
                        format!("Script exited with return code {}", outcome.exit_code);
                    self.commit_failure(execution_id, Some(&log), &message).await;
                } else {
                    self.commit_success(execution_id, &log).await;
                }
                info!(
                    script_id,
                    execution_id,
                    exit_code = outcome.exit_code,
                    timed_out = outcome.timed_out,
                    cancelled = outcome.cancelled,
                    "execution finished"
                );
            }
            Err(err) => {
                warn!(script_id, execution_id, %err, "failed to start child process");
                let _ = broker.finish(TerminalStatus::Failure).await;
                let log = broker.contents().await.unwrap_or_default();
                self.commit_failure(
                    execution_id,
                    Some(&log),
                    &format!("Failed to start script process: {err}"),
                )
                .await;
            }
        }

        self.cleanup(script_id, execution_id).await;
    }

    /// Record a refusal that happened before the child ever started.
    async fn fail_before_start(
        &self,
        script_id: i64,
        execution_id: i64,
        broker: &OutputBroker,
        message: &str,
    ) {
        let _ = broker.finish(TerminalStatus::Failure).await;
        self.commit_failure(execution_id, None, message).await;
        self.cleanup(script_id, execution_id).await;
    }

    /// Drop inflight bookkeeping and, when this run still owns the script,
    /// its temporary artifacts: output files, the install transcript and
    /// the install markers. The runtime directory is retained for reuse.
    async fn cleanup(&self, script_id: i64, execution_id: i64) {
        let owns_script = {
            let mut inflight = self.inflight.lock().await;
            inflight.by_execution.remove(&execution_id);
            if inflight.by_script.get(&script_id) == Some(&execution_id) {
                inflight.by_script.remove(&script_id);
                true
            } else {
                false
            }
        };
        // A displaced run must not touch the script directory: the newer
        // execution's output file and transcript live there now, and that
        // execution's own cleanup sweeps any leftovers.
        if !owns_script || self.settings.retain_output_files {
            return;
        }
        if let Err(err) = self.provisioner(script_id).remove_artifacts() {
            warn!(script_id, execution_id, %err, "failed to remove execution artifacts");
        }
    }

    /// Remove only this run's own output file. Used when a newer execution
    /// owns the script directory and a full artifact sweep would clobber it.
    async fn remove_output_file(&self, broker: &OutputBroker) {
        if self.settings.retain_output_files {
            return;
        }
        if let Err(err) = tokio::fs::remove_file(broker.path()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %broker.path().display(), %err, "failed to remove output file");
            }
        }
    }

    /// Commit a terminal transition, retrying once on a transient store
    /// failure. On repeated failure the row stays live and the next startup
    /// sweep closes it.
    async fn commit_success(&self, execution_id: i64, log: &str) {
        for attempt in 0..2u8 {
            match self.store.mark_success(execution_id, log).await {
                Ok(applied) => {
                    if !applied {
                        debug!(execution_id, "success transition lost to an interrupt");
                    }
                    return;
                }
                Err(err) if attempt == 0 && err.is_transient() => {
                    warn!(execution_id, %err, "retrying status transition");
                }
                Err(err) => {
                    error!(execution_id, %err, "giving up on status transition");
                    return;
                }
            }
        }
    }

    async fn commit_failure(&self, execution_id: i64, log: Option<&str>, message: &str) {
        for attempt in 0..2u8 {
            match self.store.mark_failure(execution_id, log, message).await {
                Ok(applied) => {
                    if !applied {
                        debug!(execution_id, "failure transition lost to an interrupt");
                    }
                    return;
                }
                Err(err) if attempt == 0 && err.is_transient() => {
                    warn!(execution_id, %err, "retrying status transition");
                }
                Err(err) => {
                    error!(execution_id, %err, "giving up on status transition");
                    return;
                }
            }
        }
    }

    /// Cancel a live execution. Returns false when nothing was running
    /// under that id.
    pub async fn cancel(&self, execution_id: i64) -> bool {
        let inflight = self.inflight.lock().await;
        match inflight.by_execution.get(&execution_id) {
            Some(handle) => {
                info!(execution_id, "cancelling execution");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Attach to an execution's output. Live executions stream through
    /// their broker; terminal ones replay the committed log.
    pub async fn subscribe(
        &self,
        execution_id: i64,
        mode: SubscribeMode,
    ) -> Result<OutputSubscription, EngineError> {
        let broker = {
            let inflight = self.inflight.lock().await;
            inflight
                .by_execution
                .get(&execution_id)
                .map(|handle| handle.broker.clone())
        };
        if let Some(broker) = broker {
            return Ok(broker.subscribe(mode).await?);
        }
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        match execution.status {
            ExecutionStatus::Success | ExecutionStatus::Failure => {
                let status = if execution.status == ExecutionStatus::Success {
                    TerminalStatus::Success
                } else {
                    TerminalStatus::Failure
                };
                let log = match mode {
                    SubscribeMode::FromStart => execution.log_output.as_deref().unwrap_or(""),
                    SubscribeMode::Live => "",
                };
                Ok(replay_subscription(log, status))
            }
            _ => Err(EngineError::SubscriptionUnavailable(execution_id)),
        }
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<Execution, EngineError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    pub async fn list_executions(
        &self,
        script_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.store.list_executions(script_id, limit, offset).await?)
    }

    /// Provision on demand (the catalog's "install dependencies" action)
    /// and return the dependencies with their recorded versions refreshed.
    pub async fn install_dependencies(
        &self,
        script_id: i64,
    ) -> Result<Vec<Dependency>, EngineError> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .ok_or(EngineError::ScriptNotFound(script_id))?;
        let dependencies = self.store.list_dependencies(script_id).await?;
        let provisioner = self.provisioner(script_id);
        let installed = provisioner.provision(&script.content, &dependencies).await?;
        for dependency in &dependencies {
            let version = installed.version_for(&dependency.package_name);
            self.store
                .set_installed_version(dependency.id, version)
                .await?;
        }
        Ok(self.store.list_dependencies(script_id).await?)
    }

    /// Installed packages of a script's runtime with a newer release
    /// available.
    pub async fn outdated_packages(&self, script_id: i64) -> Result<Vec<String>, EngineError> {
        Ok(self.provisioner(script_id).outdated_packages().await?)
    }

    /// Remove one package from a script's runtime and clear its recorded
    /// version. The manifest catches up on the next provision.
    pub async fn uninstall_dependency(
        &self,
        script_id: i64,
        package_name: &str,
    ) -> Result<(), EngineError> {
        self.provisioner(script_id).uninstall(package_name).await?;
        let dependencies = self.store.list_dependencies(script_id).await?;
        for dependency in dependencies {
            if dependency.package_name.eq_ignore_ascii_case(package_name) {
                self.store.set_installed_version(dependency.id, None).await?;
            }
        }
        Ok(())
    }

    /// Remove a deleted script's directory, runtime included.
    pub async fn remove_script_environment(&self, script_id: i64) -> Result<(), EngineError> {
        Ok(self.provisioner(script_id).destroy().await?)
    }

    /// Number of executions currently tracked in-process.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.by_execution.len()
    }

    /// Wait for live executions to drain, then cancel the stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.inflight_count().await == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining: Vec<_> = {
            let inflight = self.inflight.lock().await;
            inflight
                .by_execution
                .values()
                .map(|handle| handle.cancel.clone())
                .collect()
        };
        warn!(
            remaining = remaining.len(),
            "cancelling executions still live at shutdown"
        );
        for cancel in remaining {
            cancel.cancel();
        }
        // Give the cancelled tasks a moment to commit their failure rows.
        let settle = tokio::time::Instant::now() + Duration::from_secs(3);
        while self.inflight_count().await > 0 && tokio::time::Instant::now() < settle {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
