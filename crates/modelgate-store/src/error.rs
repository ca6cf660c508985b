//! Error types for `modelgate-store`.

/// Errors from store operations.
///
/// Integrity-constraint violations are surfaced as [`StoreError::Conflict`]
/// — uniqueness is a user-visible condition, never swallowed here.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness or state constraint was violated.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The requested row does not exist.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    /// Another process holds the data-directory lock.
    #[error("data directory is locked by another instance (lock file: {path})")]
    Locked { path: String },

    /// The lock file could not be created or removed.
    #[error("lock file error at {path}: {source}")]
    LockIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored value failed to parse (corrupt settings JSON, unknown enum).
    #[error("invalid stored value: {reason}")]
    Corrupt { reason: String },

    /// Schema migration failed at startup.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound { entity: "row" },
            sqlx::Error::Database(ref db) if db.is_unique_violation() => Self::Conflict {
                message: db.message().to_owned(),
            },
            other => Self::Database(other),
        }
    }
}
