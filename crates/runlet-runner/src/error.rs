//! Runner failure kinds.

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The child process could not be launched: missing interpreter,
    /// missing script file, or a permission problem.
    #[error("failed to start child process: {0}")]
    Spawn(std::io::Error),

    #[error("child stdio pipes unavailable")]
    StdioUnavailable,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
