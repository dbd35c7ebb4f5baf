//! Types for the item ledger.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::catalog::RemoteItem;
use crate::types::ItemKind;

/// Download status of an item in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Known but not yet materialized on disk.
    Pending,
    /// Written to `local_path`.
    Downloaded,
    /// Quarantined: the remote rejected the item itself. Excluded from
    /// retries but kept for inspection.
    PermanentlyFailed,
}

impl DownloadState {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloaded" => Some(Self::Downloaded),
            "permanently_failed" => Some(Self::PermanentlyFailed),
            _ => None,
        }
    }
}

/// A record of an item's state in the ledger.
///
/// Remote-sourced fields (`captured_at`, `content_ref`, `kind`, `mime_type`,
/// `filename`) are refreshed on every sighting; the download fields are owned
/// by the download engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    /// Remote item identifier, immutable.
    pub id: String,
    /// Time-limited reference used to fetch the bytes.
    pub content_ref: String,
    pub mime_type: Option<String>,
    /// Display filename reported by the remote.
    pub filename: Option<String>,
    /// Set iff `download_state` is `Downloaded`.
    pub local_path: Option<PathBuf>,
    /// Quarantine reason, or the last transient error while pending.
    pub last_error: Option<String>,

    pub captured_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,

    pub download_attempts: u32,

    pub kind: ItemKind,
    pub download_state: DownloadState,
    /// The stored `content_ref` failed with an expiry signal and must be
    /// refreshed before the next fetch.
    pub ref_stale: bool,
}

impl ItemRecord {
    /// Create a new pending record.
    pub fn new_pending(
        id: String,
        captured_at: DateTime<Utc>,
        content_ref: String,
        kind: ItemKind,
        mime_type: Option<String>,
        filename: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            content_ref,
            mime_type,
            filename,
            local_path: None,
            last_error: None,
            captured_at,
            first_seen_at: now,
            last_seen_at: now,
            downloaded_at: None,
            download_attempts: 0,
            kind,
            download_state: DownloadState::Pending,
            ref_stale: false,
        }
    }

    /// Key used to resume the oldest-first pending scan after this record.
    pub fn pending_key(&self) -> PendingKey {
        PendingKey {
            captured_at: self.captured_at,
            id: self.id.clone(),
        }
    }
}

impl From<RemoteItem> for ItemRecord {
    fn from(item: RemoteItem) -> Self {
        ItemRecord::new_pending(
            item.id,
            item.captured_at,
            item.content_ref,
            item.kind,
            item.mime_type,
            item.filename,
        )
    }
}

/// Position in the oldest-first ordering of pending items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub captured_at: DateTime<Utc>,
    pub id: String,
}

/// The contiguous range of capture times confirmed fully enumerated by
/// incremental or full scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub min_seen: DateTime<Utc>,
    pub max_seen: DateTime<Utc>,
}

impl Watermark {
    /// Widen `self` to include `other`. Never shrinks either bound.
    pub fn merged(self, other: Watermark) -> Watermark {
        Watermark {
            min_seen: self.min_seen.min(other.min_seen),
            max_seen: self.max_seen.max(other.max_seen),
        }
    }
}

/// Statistics for a single sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncRunStats {
    pub items_indexed: u64,
    pub items_new: u64,
    pub items_downloaded: u64,
    pub items_quarantined: u64,
    pub items_left_pending: u64,
    /// Whether the run was interrupted by a shutdown signal.
    pub interrupted: bool,
    /// Set when the run ended with an error.
    pub error: Option<String>,
}

/// Summary of the current ledger state.
#[derive(Debug, Clone)]
pub struct LedgerSummary {
    pub total_items: u64,
    pub pending: u64,
    pub downloaded: u64,
    pub quarantined: u64,
    pub watermark: Option<Watermark>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}
