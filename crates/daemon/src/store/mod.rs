//! Durable session/worker state.
//!
//! The store is the single source of truth for sessions, workers, port
//! reservations and in-flight operations. Everything else in the daemon
//! is a view that can be rebuilt from it after a restart.

mod database;
mod records;

pub use database::{Store, CURRENT_SCHEMA_VERSION};
pub use records::{
    now_millis, Operation, OperationKind, OperationStep, Session, TerminationReason, Worker,
    WorkerState,
};

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A compare-and-set transition found the record in another state.
    #[error("conflict on {entity} {id}: expected {expected}, found {found}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: &'static str,
        found: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Filesystem error while opening the database.
    #[error("Invalid database path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
