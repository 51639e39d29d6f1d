//! Typed errors for the seams where callers branch on the failure kind.
//!
//! Everything else in the crate uses `anyhow` with context strings.

use thiserror::Error;

/// Failure of one exchange write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Anonymous exchanges are never persisted.
    #[error("an identity is required to persist an exchange")]
    IdentityRequired,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection checkout or blocking-task failure.
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<anyhow::Error> for PersistenceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<rusqlite::Error>() {
            Ok(db_error) => PersistenceError::Database(db_error),
            Err(other) => PersistenceError::Pool(format!("{other:#}")),
        }
    }
}

/// Request-level failures raised before any response bytes exist.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is required")]
    MissingMessage,
}
