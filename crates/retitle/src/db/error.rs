//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::status::{JobId, JobStatus};

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// No job row with the given id.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A conditional status write found the job in a state that does not
    /// permit the requested transition.
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatabaseError {
    /// True when the underlying SQLite error is a constraint violation
    /// (for example the one-active-job unique index).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DatabaseError::Sqlite(err) => {
                err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
            }
            _ => false,
        }
    }

    /// True for `SQLITE_BUSY`/`SQLITE_LOCKED`, which a later attempt may clear.
    pub fn is_busy(&self) -> bool {
        match self {
            DatabaseError::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}
