//! Ledger trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::LedgerError;
use super::schema;
use super::types::{
    DownloadState, ItemRecord, LedgerSummary, PendingKey, SyncRunStats, Watermark,
};
use crate::types::{DateRange, ItemKind};

/// Trait for ledger operations.
///
/// Object-safe so it can be shared as `Arc<dyn Ledger>` between the indexer
/// and the download workers. Every mutating call is its own transaction.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert an unknown item or merge the remote-sourced fields of a known
    /// one. Never touches `download_state` or `local_path`.
    ///
    /// Returns true if the item was newly inserted.
    async fn upsert_item(&self, record: &ItemRecord) -> Result<bool, LedgerError>;

    /// `upsert_item` for a whole listing page in one transaction.
    ///
    /// Returns the number of newly inserted items.
    async fn upsert_page(&self, records: &[ItemRecord]) -> Result<u64, LedgerError>;

    /// Transition `pending -> downloaded`.
    async fn mark_downloaded(&self, id: &str, local_path: &Path) -> Result<(), LedgerError>;

    /// Transition `pending -> permanently_failed`.
    async fn mark_permanently_failed(&self, id: &str, reason: &str) -> Result<(), LedgerError>;

    /// Record a failed attempt on a pending item without changing its state.
    async fn record_transient_failure(
        &self,
        id: &str,
        error: &str,
        ref_stale: bool,
    ) -> Result<(), LedgerError>;

    /// Store a refreshed content reference and clear the stale flag.
    async fn update_content_ref(&self, id: &str, content_ref: &str) -> Result<(), LedgerError>;

    /// Pending items in ascending `(captured_at, id)` order, strictly after
    /// `after` when given.
    async fn list_pending(
        &self,
        after: Option<&PendingKey>,
        limit: usize,
    ) -> Result<Vec<ItemRecord>, LedgerError>;

    async fn get_watermark(&self) -> Result<Option<Watermark>, LedgerError>;

    /// Merge `observed` into the stored watermark and return the result.
    ///
    /// `max_seen` never decreases and `min_seen` never increases.
    async fn set_watermark(&self, observed: Watermark) -> Result<Watermark, LedgerError>;

    async fn record_scanned_range(&self, range: &DateRange) -> Result<(), LedgerError>;

    async fn scanned_ranges(&self) -> Result<Vec<DateRange>, LedgerError>;

    async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>, LedgerError>;

    /// The id of the downloaded item occupying `path`, if any.
    async fn path_owner(&self, path: &Path) -> Result<Option<String>, LedgerError>;

    /// All quarantined items.
    async fn get_quarantined(&self) -> Result<Vec<ItemRecord>, LedgerError>;

    /// Move every quarantined item back to pending with a stale reference.
    ///
    /// Returns the number of items reset.
    async fn reset_quarantined(&self) -> Result<u64, LedgerError>;

    async fn get_summary(&self) -> Result<LedgerSummary, LedgerError>;

    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self) -> Result<i64, LedgerError>;

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats)
        -> Result<(), LedgerError>;

    /// Decode every stored record, failing on the first invariant violation.
    ///
    /// Returns the number of records checked.
    async fn check_consistency(&self) -> Result<u64, LedgerError>;
}

const ITEM_COLUMNS: &str = "id, captured_at, content_ref, kind, mime_type, filename, \
     download_state, local_path, downloaded_at, first_seen_at, last_seen_at, \
     download_attempts, last_error, ref_stale";

const INSERT_ITEM: &str = r#"
    INSERT OR IGNORE INTO items (id, captured_at, content_ref, kind, mime_type, filename, download_state, first_seen_at, last_seen_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)
"#;

const MERGE_ITEM: &str = r#"
    UPDATE items SET
        captured_at = ?2,
        content_ref = ?3,
        kind = ?4,
        mime_type = ?5,
        filename = ?6,
        last_seen_at = ?7,
        ref_stale = 0
    WHERE id = ?1
"#;

/// SQLite implementation of the ledger.
pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open or create a ledger at the given path.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| LedgerError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(LedgerError::Migration)?;
            // FULL so a committed mark_downloaded survives power loss along
            // with the renamed file.
            conn.pragma_update(None, "synchronous", "FULL")
                .map_err(LedgerError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, LedgerError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened ledger");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory ledger (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Query(e.to_string()))
    }
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(LedgerError::query)?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT").map_err(LedgerError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Insert-or-merge one record. Returns true if it was new.
fn upsert_one(conn: &Connection, record: &ItemRecord, now: i64) -> Result<bool, LedgerError> {
    let params = rusqlite::params![
        record.id,
        record.captured_at.timestamp_millis(),
        record.content_ref,
        record.kind.as_str(),
        record.mime_type,
        record.filename,
        now,
    ];
    let inserted = conn
        .prepare_cached(INSERT_ITEM)
        .and_then(|mut stmt| stmt.execute(params))
        .map_err(LedgerError::query)?;
    if inserted == 1 {
        return Ok(true);
    }
    conn.prepare_cached(MERGE_ITEM)
        .and_then(|mut stmt| stmt.execute(params))
        .map_err(LedgerError::query)?;
    Ok(false)
}

/// Build the error for a compare-and-swap that matched no row.
fn failed_transition(conn: &Connection, id: &str, to: DownloadState) -> LedgerError {
    let current: Result<Option<String>, _> = conn
        .query_row(
            "SELECT download_state FROM items WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional();
    match current {
        Ok(None) => LedgerError::UnknownItem(id.to_string()),
        Ok(Some(state)) => match DownloadState::from_str(&state) {
            Some(from) => LedgerError::InvalidTransition {
                id: id.to_string(),
                from: from.as_str(),
                to: to.as_str(),
            },
            None => LedgerError::Consistency {
                id: id.to_string(),
                detail: format!("unknown download state '{state}'"),
            },
        },
        Err(e) => LedgerError::query(e),
    }
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ItemRecord>, LedgerError> {
    let mut stmt = conn.prepare_cached(sql).map_err(LedgerError::query)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_item_record(row)))
        .map_err(LedgerError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::query)?;
    rows.into_iter().collect()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn upsert_item(&self, record: &ItemRecord) -> Result<bool, LedgerError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        in_transaction(&conn, |conn| upsert_one(conn, record, now))
    }

    async fn upsert_page(&self, records: &[ItemRecord]) -> Result<u64, LedgerError> {
        if records.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        in_transaction(&conn, |conn| {
            let mut new_items = 0u64;
            for record in records {
                if upsert_one(conn, record, now)? {
                    new_items += 1;
                }
            }
            Ok(new_items)
        })
    }

    async fn mark_downloaded(&self, id: &str, local_path: &Path) -> Result<(), LedgerError> {
        let downloaded_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE items SET download_state = 'downloaded', local_path = ?1, downloaded_at = ?2, last_error = NULL, ref_stale = 0 \
                 WHERE id = ?3 AND download_state = 'pending'",
                rusqlite::params![local_path.to_string_lossy(), downloaded_at, id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(failed_transition(&conn, id, DownloadState::Downloaded));
        }
        Ok(())
    }

    async fn mark_permanently_failed(&self, id: &str, reason: &str) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE items SET download_state = 'permanently_failed', last_error = ?1, download_attempts = download_attempts + 1 \
                 WHERE id = ?2 AND download_state = 'pending'",
                rusqlite::params![reason, id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(failed_transition(
                &conn,
                id,
                DownloadState::PermanentlyFailed,
            ));
        }
        Ok(())
    }

    async fn record_transient_failure(
        &self,
        id: &str,
        error: &str,
        ref_stale: bool,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE items SET download_attempts = download_attempts + 1, last_error = ?1, ref_stale = ?2 \
                 WHERE id = ?3 AND download_state = 'pending'",
                rusqlite::params![error, ref_stale, id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(failed_transition(&conn, id, DownloadState::Pending));
        }
        Ok(())
    }

    async fn update_content_ref(&self, id: &str, content_ref: &str) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE items SET content_ref = ?1, ref_stale = 0 WHERE id = ?2",
                rusqlite::params![content_ref, id],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(LedgerError::UnknownItem(id.to_string()));
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        after: Option<&PendingKey>,
        limit: usize,
    ) -> Result<Vec<ItemRecord>, LedgerError> {
        let (after_ts, after_id) = match after {
            Some(key) => (key.captured_at.timestamp_millis(), key.id.as_str()),
            None => (i64::MIN, ""),
        };
        let conn = self.lock()?;
        query_items(
            &conn,
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items \
                 WHERE download_state = 'pending' AND (captured_at > ?1 OR (captured_at = ?1 AND id > ?2)) \
                 ORDER BY captured_at, id LIMIT ?3"
            ),
            rusqlite::params![after_ts, after_id, limit as i64],
        )
    }

    async fn get_watermark(&self) -> Result<Option<Watermark>, LedgerError> {
        let conn = self.lock()?;
        read_watermark(&conn)
    }

    async fn set_watermark(&self, observed: Watermark) -> Result<Watermark, LedgerError> {
        let updated_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        in_transaction(&conn, |conn| {
            conn.execute(
                r#"
                INSERT INTO watermark (id, min_seen, max_seen, updated_at)
                VALUES (1, ?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    min_seen = MIN(min_seen, excluded.min_seen),
                    max_seen = MAX(max_seen, excluded.max_seen),
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    observed.min_seen.timestamp_millis(),
                    observed.max_seen.timestamp_millis(),
                    updated_at,
                ],
            )
            .map_err(LedgerError::query)?;
            read_watermark(conn)?.ok_or_else(|| {
                LedgerError::Query("watermark missing after update".to_string())
            })
        })
    }

    async fn record_scanned_range(&self, range: &DateRange) -> Result<(), LedgerError> {
        let scanned_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scanned_ranges (start_date, end_date, scanned_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(start_date, end_date) DO UPDATE SET scanned_at = excluded.scanned_at",
            rusqlite::params![range.start.to_string(), range.end.to_string(), scanned_at],
        )
        .map_err(LedgerError::query)?;
        Ok(())
    }

    async fn scanned_ranges(&self) -> Result<Vec<DateRange>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT start_date, end_date FROM scanned_ranges ORDER BY start_date, end_date")
            .map_err(LedgerError::query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        rows.into_iter()
            .map(|(start, end)| {
                let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
                parse(&start)
                    .zip(parse(&end))
                    .and_then(|(start, end)| DateRange::new(start, end))
                    .ok_or_else(|| {
                        LedgerError::Query(format!("invalid scanned range {start}..{end}"))
                    })
            })
            .collect()
    }

    async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut items = query_items(
            &conn,
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
            [id],
        )?;
        Ok(items.pop())
    }

    async fn path_owner(&self, path: &Path) -> Result<Option<String>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id FROM items WHERE local_path = ?1 LIMIT 1",
            [path.to_string_lossy()],
            |row| row.get(0),
        )
        .optional()
        .map_err(LedgerError::query)
    }

    async fn get_quarantined(&self) -> Result<Vec<ItemRecord>, LedgerError> {
        let conn = self.lock()?;
        query_items(
            &conn,
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE download_state = 'permanently_failed' ORDER BY captured_at, id"
            ),
            [],
        )
    }

    async fn reset_quarantined(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE items SET download_state = 'pending', download_attempts = 0, last_error = NULL, ref_stale = 1 \
                 WHERE download_state = 'permanently_failed'",
                [],
            )
            .map_err(LedgerError::query)?;
        Ok(rows as u64)
    }

    async fn get_summary(&self) -> Result<LedgerSummary, LedgerError> {
        let conn = self.lock()?;

        let count = |state: Option<&str>| -> Result<u64, LedgerError> {
            let n: i64 = match state {
                Some(state) => conn.query_row(
                    "SELECT COUNT(*) FROM items WHERE download_state = ?1",
                    [state],
                    |row| row.get(0),
                ),
                None => conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)),
            }
            .map_err(LedgerError::query)?;
            Ok(n as u64)
        };

        let total_items = count(None)?;
        let pending = count(Some(DownloadState::Pending.as_str()))?;
        let downloaded = count(Some(DownloadState::Downloaded.as_str()))?;
        let quarantined = count(Some(DownloadState::PermanentlyFailed.as_str()))?;

        let last_sync: Option<(i64, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT started_at, completed_at, error FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(LedgerError::query)?;

        let (last_sync_started, last_sync_completed, last_sync_error) = match last_sync {
            Some((started, completed, error)) => (
                from_millis(started),
                completed.and_then(from_millis),
                error,
            ),
            None => (None, None, None),
        };

        Ok(LedgerSummary {
            total_items,
            pending,
            downloaded,
            quarantined,
            watermark: read_watermark(&conn)?,
            last_sync_started,
            last_sync_completed,
            last_sync_error,
        })
    }

    async fn start_sync_run(&self) -> Result<i64, LedgerError> {
        let started_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(LedgerError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(
        &self,
        run_id: i64,
        stats: &SyncRunStats,
    ) -> Result<(), LedgerError> {
        let completed_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, items_indexed = ?2, items_new = ?3, items_downloaded = ?4, \
             items_quarantined = ?5, items_left_pending = ?6, interrupted = ?7, error = ?8 \
             WHERE id = ?9",
            rusqlite::params![
                completed_at,
                stats.items_indexed as i64,
                stats.items_new as i64,
                stats.items_downloaded as i64,
                stats.items_quarantined as i64,
                stats.items_left_pending as i64,
                stats.interrupted,
                stats.error,
                run_id,
            ],
        )
        .map_err(LedgerError::query)?;
        Ok(())
    }

    async fn check_consistency(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let items = query_items(&conn, &format!("SELECT {ITEM_COLUMNS} FROM items"), [])?;
        Ok(items.len() as u64)
    }
}

fn read_watermark(conn: &Connection) -> Result<Option<Watermark>, LedgerError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT min_seen, max_seen FROM watermark WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(LedgerError::query)?;

    Ok(row.and_then(|(min, max)| {
        Some(Watermark {
            min_seen: from_millis(min)?,
            max_seen: from_millis(max)?,
        })
    }))
}

/// Convert a database row to an ItemRecord, enforcing the state invariant.
fn row_to_item_record(row: &rusqlite::Row<'_>) -> Result<ItemRecord, LedgerError> {
    let id: String = row.get(0).map_err(LedgerError::query)?;
    let consistency = |detail: String| LedgerError::Consistency {
        id: id.clone(),
        detail,
    };

    let captured_at_ms: i64 = row.get(1).map_err(LedgerError::query)?;
    let content_ref: String = row.get(2).map_err(LedgerError::query)?;
    let kind_str: String = row.get(3).map_err(LedgerError::query)?;
    let mime_type: Option<String> = row.get(4).map_err(LedgerError::query)?;
    let filename: Option<String> = row.get(5).map_err(LedgerError::query)?;
    let state_str: String = row.get(6).map_err(LedgerError::query)?;
    let local_path: Option<String> = row.get(7).map_err(LedgerError::query)?;
    let downloaded_at_ms: Option<i64> = row.get(8).map_err(LedgerError::query)?;
    let first_seen_ms: i64 = row.get(9).map_err(LedgerError::query)?;
    let last_seen_ms: i64 = row.get(10).map_err(LedgerError::query)?;
    let download_attempts: i64 = row.get(11).map_err(LedgerError::query)?;
    let last_error: Option<String> = row.get(12).map_err(LedgerError::query)?;
    let ref_stale: bool = row.get(13).map_err(LedgerError::query)?;

    let download_state = DownloadState::from_str(&state_str)
        .ok_or_else(|| consistency(format!("unknown download state '{state_str}'")))?;
    let kind = ItemKind::from_str(&kind_str)
        .ok_or_else(|| consistency(format!("unknown item kind '{kind_str}'")))?;

    match (download_state, &local_path) {
        (DownloadState::Downloaded, None) => {
            return Err(consistency("downloaded item has no local path".to_string()));
        }
        (DownloadState::Pending | DownloadState::PermanentlyFailed, Some(path)) => {
            return Err(consistency(format!(
                "{} item has local path {path}",
                download_state.as_str()
            )));
        }
        _ => {}
    }

    let captured_at = from_millis(captured_at_ms)
        .ok_or_else(|| consistency(format!("invalid capture timestamp {captured_at_ms}")))?;

    Ok(ItemRecord {
        id,
        content_ref,
        mime_type,
        filename,
        local_path: local_path.map(PathBuf::from),
        last_error,
        captured_at,
        first_seen_at: from_millis(first_seen_ms).unwrap_or(DateTime::UNIX_EPOCH),
        last_seen_at: from_millis(last_seen_ms).unwrap_or(DateTime::UNIX_EPOCH),
        downloaded_at: downloaded_at_ms.and_then(from_millis),
        download_attempts: download_attempts.max(0) as u32,
        kind,
        download_state,
        ref_stale,
    })
}
