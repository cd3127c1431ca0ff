//! Error type for store operations.

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Whether retrying the same statement on a fresh acquire could succeed.
    /// Constraint violations and decode errors are permanent; connection and
    /// pool level failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreError::Migrate(_) => false,
        }
    }
}
