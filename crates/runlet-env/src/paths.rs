//! Filesystem layout of a script's private directory.

use std::path::{Path, PathBuf};

pub const SCRIPT_FILE: &str = "script.py";
pub const MANIFEST_FILE: &str = "requirements.manifest";
pub const RUNTIME_DIR: &str = "runtime";
pub const INSTALL_LOG: &str = "install.log";
pub const INSTALL_OK: &str = "install.ok";
pub const INSTALL_FINISHED: &str = "install.finished";

/// Paths inside `<scripts_dir>/<script_id>/`:
///
/// ```text
/// script.py                  # source, written atomically before a run
/// requirements.manifest      # canonical dependency list
/// runtime/                   # isolated interpreter and packages
/// output_<execution_id>.txt  # live + final execution log
/// install.log                # dependency installation transcript
/// install.finished           # marker: installation ended
/// install.ok                 # marker: installation succeeded
/// ```
#[derive(Debug, Clone)]
pub struct ScriptPaths {
    script_dir: PathBuf,
}

impl ScriptPaths {
    pub fn new<P: AsRef<Path>>(scripts_dir: P, script_id: i64) -> Self {
        Self {
            script_dir: scripts_dir.as_ref().join(script_id.to_string()),
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn script_file(&self) -> PathBuf {
        self.script_dir.join(SCRIPT_FILE)
    }

    pub fn manifest(&self) -> PathBuf {
        self.script_dir.join(MANIFEST_FILE)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.script_dir.join(RUNTIME_DIR)
    }

    /// The runtime's interpreter executable.
    pub fn interpreter(&self) -> PathBuf {
        if cfg!(windows) {
            self.runtime_dir().join("Scripts").join("python.exe")
        } else {
            self.runtime_dir().join("bin").join("python")
        }
    }

    pub fn install_log(&self) -> PathBuf {
        self.script_dir.join(INSTALL_LOG)
    }

    pub fn install_ok(&self) -> PathBuf {
        self.script_dir.join(INSTALL_OK)
    }

    pub fn install_finished(&self) -> PathBuf {
        self.script_dir.join(INSTALL_FINISHED)
    }

    pub fn output_file(&self, execution_id: i64) -> PathBuf {
        self.script_dir.join(format!("output_{execution_id}.txt"))
    }

    /// All per-execution output files currently on disk.
    pub fn output_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.script_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("output_") && name.ends_with(".txt"))
            })
            .collect()
    }
}
