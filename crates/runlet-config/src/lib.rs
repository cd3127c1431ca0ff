// Figment-based configuration for runlet
// Layers: built-in defaults -> runlet.toml -> RUNLET_* environment variables

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Environment variable prefix recognized by the settings loader.
pub const ENV_PREFIX: &str = "RUNLET_";

/// Configuration file name searched in the working directory.
pub const CONFIG_FILE: &str = "runlet.toml";

/// Runtime settings for the execution engine.
///
/// Every field can be overridden by `runlet.toml` or a `RUNLET_`-prefixed
/// environment variable (e.g. `RUNLET_MAX_EXECUTION_TIME=60`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Per-script environments live under this directory, one subdirectory
    /// per script id.
    pub scripts_dir: PathBuf,
    /// Database and other persistent state.
    pub data_dir: PathBuf,
    /// Service log files.
    pub logs_dir: PathBuf,
    /// SQLite connection URL for the execution ledger.
    pub database_url: String,
    /// Wall-clock limit for a single execution, in seconds.
    pub max_execution_time: u64,
    /// How long install-log subscribers wait for installation to produce
    /// its completion marker, in seconds.
    pub install_timeout: u64,
    /// Per-line idle timeout when reading child output, in seconds. Idle
    /// reads yield control; they never fail the execution.
    pub stream_idle_timeout: u64,
    /// Keep per-execution output files after their contents have been
    /// committed to the store. Useful when debugging the engine itself.
    pub retain_output_files: bool,
    /// Upper bound on concurrently running executions.
    pub max_concurrent_executions: usize,
    /// Default log level when RUST_LOG is not set.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let root = default_root();
        let data_dir = root.join("data");
        Self {
            scripts_dir: root.join("scripts"),
            database_url: format!("sqlite://{}", data_dir.join("runlet.db").display()),
            data_dir,
            logs_dir: root.join("logs"),
            max_execution_time: 300,
            install_timeout: 30,
            stream_idle_timeout: 10,
            retain_output_files: false,
            max_concurrent_executions: 16,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, `runlet.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Load settings from an explicit configuration file instead of the
    /// working-directory default.
    pub fn load_from<P: AsRef<Path>>(config_file: P) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_file.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment)
    }

    /// The complete figment with all configuration layers.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment
            .extract()
            .context("failed to load runlet configuration")?;
        Ok(settings)
    }

    /// Create the directories the engine writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.scripts_dir, &self.data_dir, &self.logs_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Filesystem path of the SQLite database, when the URL points at a file.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_url
            .strip_prefix("sqlite://")
            .filter(|rest| !rest.starts_with(":memory:"))
            .map(PathBuf::from)
    }

    pub fn max_execution_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_execution_time)
    }

    pub fn install_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.install_timeout)
    }

    pub fn stream_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stream_idle_timeout)
    }
}

/// Base directory for all runlet state. Prefers the platform-local data
/// directory, falling back to `./runlet` when none is available.
fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("runlet"))
        .unwrap_or_else(|| PathBuf::from("runlet"))
}
