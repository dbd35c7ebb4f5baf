//! Ledger schema definitions and migrations.

use rusqlite::Connection;

use super::error::LedgerError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
///
/// The `CHECK` on `items` pins the `local_path`/`download_state` invariant
/// at the storage layer as well as in the row decoder.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY NOT NULL,
    captured_at INTEGER NOT NULL,
    content_ref TEXT NOT NULL,
    kind TEXT NOT NULL,
    mime_type TEXT,
    filename TEXT,
    download_state TEXT NOT NULL DEFAULT 'pending',
    local_path TEXT,
    downloaded_at INTEGER,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    download_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    ref_stale INTEGER NOT NULL DEFAULT 0,
    CHECK ((download_state = 'downloaded') = (local_path IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_items_state_captured ON items(download_state, captured_at, id);
CREATE INDEX IF NOT EXISTS idx_items_local_path ON items(local_path);

CREATE TABLE IF NOT EXISTS watermark (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    min_seen INTEGER NOT NULL,
    max_seen INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scanned_ranges (
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    scanned_at INTEGER NOT NULL,
    PRIMARY KEY (start_date, end_date)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    items_indexed INTEGER DEFAULT 0,
    items_new INTEGER DEFAULT 0,
    items_downloaded INTEGER DEFAULT 0,
    items_quarantined INTEGER DEFAULT 0,
    items_left_pending INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0,
    error TEXT
);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent; safe on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(LedgerError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    match version {
        1 => conn.execute_batch(SCHEMA_V1)?,
        other => {
            tracing::warn!(version = other, "No migration registered for schema version");
        }
    }
    set_schema_version(conn, version)?;
    tracing::debug!(version, "Migrated ledger schema");
    Ok(())
}
