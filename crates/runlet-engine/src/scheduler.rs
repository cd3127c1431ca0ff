//! Cron-driven dispatch into the coordinator.
//!
//! One cooperative task owns every job. Jobs are keyed by
//! `(script_id, schedule_id)`; commands (add, remove) arrive on a channel
//! and fires re-validate the script before dispatching, because a script
//! can go inactive or lose its installed dependencies between ticks.

use std::sync::Arc;

use chrono::{DateTime, Local};
use croner::Cron;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use runlet_store::Schedule;

use crate::coordinator::{Coordinator, UNINSTALLED_DEPENDENCIES};
use crate::error::EngineError;

/// Error recorded when a fire finds its script deactivated.
pub const SCRIPT_INACTIVE: &str = "Script is inactive";

/// How long the scheduler sleeps when it has no jobs at all.
const IDLE_SLEEP: std::time::Duration = std::time::Duration::from_secs(60);

enum Command {
    Add(Schedule),
    Remove { script_id: i64, schedule_id: i64 },
    JobCount(oneshot::Sender<usize>),
}

struct Job {
    script_id: i64,
    schedule_id: i64,
    cron: Cron,
    next: DateTime<Local>,
}

/// Handle to the scheduler task.
pub struct CronScheduler {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl CronScheduler {
    /// Load every schedule of every active script and start ticking.
    pub async fn start(coordinator: Arc<Coordinator>) -> Result<Self, EngineError> {
        let schedules = coordinator.store().list_active_schedules().await?;
        let (commands, receiver) = mpsc::channel(64);
        let mut task = SchedulerTask {
            coordinator,
            jobs: Vec::new(),
            receiver,
        };
        for schedule in schedules {
            task.add(schedule).await;
        }
        info!(jobs = task.jobs.len(), "cron scheduler started");
        let task = tokio::spawn(task.run());
        Ok(Self { commands, task })
    }

    /// Add or replace the job for a schedule. A no-op (logged) when the
    /// script is inactive or its dependencies are not installed.
    pub async fn add(&self, schedule: Schedule) {
        let _ = self.commands.send(Command::Add(schedule)).await;
    }

    /// Remove a job by key. Idempotent.
    pub async fn remove(&self, script_id: i64, schedule_id: i64) {
        let _ = self
            .commands
            .send(Command::Remove {
                script_id,
                schedule_id,
            })
            .await;
    }

    /// Number of jobs currently scheduled.
    pub async fn job_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::JobCount(reply)).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

struct SchedulerTask {
    coordinator: Arc<Coordinator>,
    jobs: Vec<Job>,
    receiver: mpsc::Receiver<Command>,
}

impl SchedulerTask {
    async fn run(mut self) {
        loop {
            let sleep_for = self
                .jobs
                .iter()
                .map(|job| job.next)
                .min()
                .map(|at| (at - Local::now()).to_std().unwrap_or_default())
                .unwrap_or(IDLE_SLEEP);
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(Command::Add(schedule)) => self.add(schedule).await,
                    Some(Command::Remove { script_id, schedule_id }) => {
                        self.remove(script_id, schedule_id);
                    }
                    Some(Command::JobCount(reply)) => {
                        let _ = reply.send(self.jobs.len());
                    }
                    None => break,
                },
                _ = tokio::time::sleep(sleep_for) => self.fire_due().await,
            }
        }
    }

    async fn add(&mut self, schedule: Schedule) {
        let script = match self.coordinator.store().get_script(schedule.script_id).await {
            Ok(Some(script)) => script,
            Ok(None) => {
                warn!(script_id = schedule.script_id, "script not found, not scheduling");
                return;
            }
            Err(err) => {
                error!(script_id = schedule.script_id, %err, "failed to load script");
                return;
            }
        };
        if !script.is_active {
            info!(
                script_id = script.id,
                schedule_id = schedule.id,
                "script is inactive, not scheduling"
            );
            return;
        }
        if self
            .coordinator
            .script_has_uninstalled_dependencies(script.id)
            .await
        {
            warn!(
                script_id = script.id,
                schedule_id = schedule.id,
                "script has uninstalled dependencies, not scheduling"
            );
            return;
        }
        let cron: Cron = match schedule.cron_expression.parse() {
            Ok(cron) => cron,
            Err(err) => {
                error!(
                    schedule_id = schedule.id,
                    expression = %schedule.cron_expression,
                    %err,
                    "invalid cron expression, skipping schedule"
                );
                return;
            }
        };
        let Some(next) = next_occurrence(&cron) else {
            warn!(schedule_id = schedule.id, "cron expression never fires");
            return;
        };
        // Replace any existing job with the same key.
        self.remove(schedule.script_id, schedule.id);
        info!(
            script_id = schedule.script_id,
            schedule_id = schedule.id,
            expression = %schedule.cron_expression,
            next = %next,
            "job scheduled"
        );
        self.jobs.push(Job {
            script_id: schedule.script_id,
            schedule_id: schedule.id,
            cron,
            next,
        });
    }

    fn remove(&mut self, script_id: i64, schedule_id: i64) {
        let before = self.jobs.len();
        self.jobs
            .retain(|job| !(job.script_id == script_id && job.schedule_id == schedule_id));
        if self.jobs.len() != before {
            debug!(script_id, schedule_id, "job removed");
        }
    }

    async fn fire_due(&mut self) {
        let now = Local::now();
        let mut due = Vec::new();
        self.jobs.retain_mut(|job| {
            if job.next > now {
                return true;
            }
            due.push((job.script_id, job.schedule_id));
            match next_occurrence(&job.cron) {
                Some(next) => {
                    job.next = next;
                    true
                }
                None => false,
            }
        });
        for (script_id, schedule_id) in due {
            if !self.fire(script_id, schedule_id).await {
                self.remove(script_id, schedule_id);
            }
        }
    }

    /// Dispatch one fire. Returns false when the job should be dropped.
    async fn fire(&self, script_id: i64, schedule_id: i64) -> bool {
        let store = self.coordinator.store();
        let script = match store.get_script(script_id).await {
            Ok(Some(script)) => script,
            Ok(None) => {
                warn!(script_id, "scheduled script no longer exists");
                return false;
            }
            Err(err) => {
                error!(script_id, %err, "failed to load script at fire time");
                return true;
            }
        };
        if !script.is_active {
            warn!(script_id, schedule_id, "script went inactive, dropping job");
            if let Err(err) = store
                .record_refused_execution(script_id, Some(schedule_id), SCRIPT_INACTIVE)
                .await
            {
                error!(script_id, %err, "failed to record refused execution");
            }
            return false;
        }
        if self
            .coordinator
            .script_has_uninstalled_dependencies(script_id)
            .await
        {
            warn!(
                script_id,
                schedule_id, "dependencies no longer installed, dropping job"
            );
            if let Err(err) = store
                .record_refused_execution(script_id, Some(schedule_id), UNINSTALLED_DEPENDENCIES)
                .await
            {
                error!(script_id, %err, "failed to record refused execution");
            }
            return false;
        }
        info!(script_id, schedule_id, "firing scheduled execution");
        if let Err(err) = self.coordinator.run(script_id, Some(schedule_id)).await {
            error!(script_id, schedule_id, %err, "scheduled execution failed to start");
        }
        true
    }
}

fn next_occurrence(cron: &Cron) -> Option<DateTime<Local>> {
    cron.find_next_occurrence(&Local::now(), false).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn five_field_expressions_parse() {
        let cron: Cron = "*/5 * * * *".parse().expect("parse");
        let next = next_occurrence(&cron).expect("next");
        assert!(next > Local::now());
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn nonsense_expressions_fail_to_parse() {
        assert!("not a cron".parse::<Cron>().is_err());
        assert!("99 99 * * *".parse::<Cron>().is_err());
    }
}
