//! Provisioning failure kinds.

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("no system Python interpreter found")]
    InterpreterNotFound,

    #[error("failed to create runtime: {0}")]
    RuntimeCreation(String),

    #[error("runtime does not exist")]
    RuntimeMissing,

    #[error("dependency installation failed with exit code {code}, see install.log")]
    InstallFailed { code: i32 },

    #[error("failed to query installed packages: {0}")]
    PackageQuery(String),
}
