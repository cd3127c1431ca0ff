//! Building and reconciling a script's private runtime.
//!
//! The runtime directory either contains a functioning interpreter with a
//! package set consistent with the manifest, or it is absent; provisioning
//! from any intermediate state converges back to that invariant.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use runlet_store::Dependency;

use crate::error::ProvisionError;
use crate::manifest::render_manifest;
use crate::paths::{ScriptPaths, MANIFEST_FILE};

/// Package set reported by the runtime, keyed by the installer's own casing.
#[derive(Debug, Clone, Default)]
pub struct InstalledPackages {
    packages: HashMap<String, String>,
}

#[derive(Deserialize)]
struct PipPackage {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct OutdatedPackage {
    name: String,
    version: String,
    latest_version: String,
}

impl InstalledPackages {
    pub fn from_pip_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let packages: Vec<PipPackage> = serde_json::from_slice(raw)?;
        Ok(Self {
            packages: packages
                .into_iter()
                .map(|package| (package.name, package.version))
                .collect(),
        })
    }

    /// Installed version of a package, matched case-insensitively.
    pub fn version_for(&self, package_name: &str) -> Option<&str> {
        self.packages
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(package_name))
            .map(|(_, version)| version.as_str())
    }

    pub fn contains(&self, package_name: &str) -> bool {
        self.version_for(package_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Creates and reconciles one script's runtime directory.
pub struct Provisioner {
    script_id: i64,
    paths: ScriptPaths,
}

impl Provisioner {
    pub fn new<P: AsRef<Path>>(scripts_dir: P, script_id: i64) -> Self {
        Self {
            script_id,
            paths: ScriptPaths::new(scripts_dir, script_id),
        }
    }

    pub fn paths(&self) -> &ScriptPaths {
        &self.paths
    }

    pub fn runtime_exists(&self) -> bool {
        self.paths.interpreter().exists()
    }

    /// Reconcile the runtime with the script's source and declared
    /// dependencies, and report the runtime's resulting package set.
    ///
    /// Installation output is appended to `install.log`; `install.ok` is
    /// created on success and `install.finished` is touched last in every
    /// outcome, so install-log subscribers always see an end marker.
    pub async fn provision(
        &self,
        content: &str,
        dependencies: &[Dependency],
    ) -> Result<InstalledPackages, ProvisionError> {
        info!(script_id = self.script_id, "provisioning script environment");
        std::fs::create_dir_all(self.paths.script_dir())?;

        write_atomic(&self.paths.script_file(), content)?;
        let manifest = render_manifest(dependencies);
        write_atomic(&self.paths.manifest(), &manifest)?;

        let created = if self.runtime_exists() {
            false
        } else {
            self.create_runtime().await?;
            true
        };

        // Start each pass with a fresh transcript: stale markers or a prior
        // run's log would otherwise be replayed to install subscribers.
        remove_if_present(&self.paths.install_log())?;
        remove_if_present(&self.paths.install_ok())?;
        remove_if_present(&self.paths.install_finished())?;

        let install: Result<(), ProvisionError> = async {
            if created {
                // A fresh runtime first upgrades its own package manager.
                self.run_pip(&["install", "--upgrade", "pip"]).await?;
            }
            if !manifest.is_empty() {
                self.run_pip(&["install", "-r", MANIFEST_FILE]).await?;
            }
            Ok(())
        }
        .await;

        if install.is_ok() {
            touch(&self.paths.install_ok())?;
        }
        touch(&self.paths.install_finished())?;
        install?;

        if dependencies.is_empty() {
            return Ok(InstalledPackages::default());
        }
        self.installed_packages().await
    }

    /// Create the isolated interpreter from the system Python.
    async fn create_runtime(&self) -> Result<(), ProvisionError> {
        let system_python = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| ProvisionError::InterpreterNotFound)?;
        info!(
            script_id = self.script_id,
            interpreter = %system_python.display(),
            "creating runtime"
        );
        let output = Command::new(&system_python)
            .arg("-m")
            .arg("venv")
            .arg(self.paths.runtime_dir())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisionError::RuntimeCreation(stderr));
        }
        Ok(())
    }

    /// Run a pip subcommand inside the runtime, appending its output to the
    /// installation transcript.
    async fn run_pip(&self, args: &[&str]) -> Result<(), ProvisionError> {
        debug!(script_id = self.script_id, ?args, "running pip");
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.install_log())?;
        let log_err = log.try_clone()?;
        let status = Command::new(self.paths.interpreter())
            .arg("-m")
            .arg("pip")
            .args(args)
            .current_dir(self.paths.script_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await?;
        if !status.success() {
            return Err(ProvisionError::InstallFailed {
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// The runtime's reported package set. An absent runtime reports empty.
    pub async fn installed_packages(&self) -> Result<InstalledPackages, ProvisionError> {
        if !self.runtime_exists() {
            return Ok(InstalledPackages::default());
        }
        let output = Command::new(self.paths.interpreter())
            .args(["-m", "pip", "list", "--format=json"])
            .current_dir(self.paths.script_dir())
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisionError::PackageQuery(stderr));
        }
        InstalledPackages::from_pip_json(&output.stdout)
            .map_err(|err| ProvisionError::PackageQuery(err.to_string()))
    }

    /// Installed packages with a newer release available, formatted
    /// `name (installed -> latest)`. An absent runtime reports none.
    pub async fn outdated_packages(&self) -> Result<Vec<String>, ProvisionError> {
        if !self.runtime_exists() {
            return Ok(Vec::new());
        }
        let output = Command::new(self.paths.interpreter())
            .args(["-m", "pip", "list", "--outdated", "--format=json"])
            .current_dir(self.paths.script_dir())
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisionError::PackageQuery(stderr));
        }
        let packages: Vec<OutdatedPackage> = serde_json::from_slice(&output.stdout)
            .map_err(|err| ProvisionError::PackageQuery(err.to_string()))?;
        Ok(packages
            .into_iter()
            .map(|package| {
                format!(
                    "{} ({} -> {})",
                    package.name, package.version, package.latest_version
                )
            })
            .collect())
    }

    /// Whether the script is not ready to execute: the runtime is missing, a
    /// declared package is absent from the reported set (case-insensitive),
    /// or a declared dependency has no recorded installed version.
    pub async fn has_uninstalled_dependencies(&self, dependencies: &[Dependency]) -> bool {
        if !self.runtime_exists() {
            warn!(script_id = self.script_id, "runtime missing");
            return true;
        }
        if dependencies.is_empty() {
            return false;
        }
        let installed = match self.installed_packages().await {
            Ok(installed) => installed,
            Err(err) => {
                warn!(script_id = self.script_id, %err, "package query failed");
                return true;
            }
        };
        dependencies.iter().any(|dependency| {
            let missing = match installed.version_for(&dependency.package_name) {
                None => true,
                Some(version) => version.is_empty(),
            };
            let unrecorded = dependency
                .installed_version
                .as_deref()
                .is_none_or(str::is_empty);
            if missing || unrecorded {
                warn!(
                    script_id = self.script_id,
                    package = %dependency.package_name,
                    missing,
                    unrecorded,
                    "dependency not installed"
                );
            }
            missing || unrecorded
        })
    }

    /// Remove a package from the runtime. The manifest is rewritten by the
    /// catalog owner on the next provision.
    pub async fn uninstall(&self, package_name: &str) -> Result<(), ProvisionError> {
        if !self.runtime_exists() {
            return Err(ProvisionError::RuntimeMissing);
        }
        info!(script_id = self.script_id, package_name, "uninstalling package");
        self.run_pip(&["uninstall", "-y", package_name]).await
    }

    /// Delete per-execution output files, the install transcript and the
    /// install markers. The runtime itself is kept for reuse.
    pub fn remove_artifacts(&self) -> Result<(), ProvisionError> {
        for path in self.paths.output_files() {
            remove_if_present(&path)?;
        }
        remove_if_present(&self.paths.install_log())?;
        remove_if_present(&self.paths.install_ok())?;
        remove_if_present(&self.paths.install_finished())?;
        Ok(())
    }

    /// Remove the script directory entirely, runtime included. Used when the
    /// script is deleted from the catalog.
    pub async fn destroy(&self) -> Result<(), ProvisionError> {
        match tokio::fs::remove_dir_all(self.paths.script_dir()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write via a sibling temp file and rename, so readers never observe a
/// partially written script or manifest.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ProvisionError> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(contents.as_bytes())?;
    staged.flush()?;
    staged
        .persist(path)
        .map_err(|err| ProvisionError::Io(err.error))?;
    Ok(())
}

fn touch(path: &Path) -> Result<(), ProvisionError> {
    std::fs::write(path, b"")?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), ProvisionError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
