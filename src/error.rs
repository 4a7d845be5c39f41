// src/error.rs
// Error kinds for the conversation memory core, grounded on the teacher's
// git/error.rs pattern: a thiserror enum with one variant per error kind,
// constructor helpers, and a crate-local Result alias.

use thiserror::Error;

/// Conversation memory core error type.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Classify a raw sqlx error into a transient vs. storage failure.
    ///
    /// SQLite surfaces "database is locked"/"database is busy" as generic
    /// `sqlx::Error::Database` errors; the caller needs to know these are
    /// worth retrying rather than a schema or query bug.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            let msg = db_err.message().to_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                return Self::Transient(db_err.message().to_string());
            }
        }
        Self::Storage(err)
    }
}

/// Conversation memory core result alias.
pub type Result<T> = std::result::Result<T, MemoryError>;
