//! Error types for the item ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a schema migration.
    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Ledger query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A state transition was requested from a state that does not allow it.
    #[error("Invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// The item is not present in the ledger.
    #[error("Unknown item: {0}")]
    UnknownItem(String),

    /// A stored record violates a ledger invariant. Never repaired
    /// automatically; the run must stop.
    #[error("Ledger consistency violation for item {id}: {detail}")]
    Consistency { id: String, detail: String },
}

impl LedgerError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Whether this error means the ledger can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Consistency { .. } | Self::UnsupportedSchemaVersion { .. }
        )
    }
}
