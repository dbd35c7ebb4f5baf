//! Persistent item ledger.
//!
//! The ledger is the single source of truth for which items have been
//! discovered and which have been materialized to disk. It is backed by
//! SQLite and survives restarts; every mutation commits before the caller
//! moves on.

mod db;
mod error;
mod schema;
mod types;

use std::sync::Arc;

use futures_util::stream::{self, Stream, TryStreamExt};

pub use db::{Ledger, SqliteLedger};
pub use error::LedgerError;
pub use types::{
    DownloadState, ItemRecord, LedgerSummary, PendingKey, SyncRunStats, Watermark,
};

/// Lazily stream pending items oldest-first, one keyset page at a time.
///
/// Each page starts strictly after the last key of the previous one, so an
/// item left pending by a failed attempt is not revisited in the same pass
/// and the stream is always finite.
pub fn pending_stream(
    ledger: Arc<dyn Ledger>,
    page_size: usize,
) -> impl Stream<Item = Result<ItemRecord, LedgerError>> + Send {
    let page_size = page_size.max(1);
    stream::try_unfold(
        (ledger, None::<PendingKey>, false),
        move |(ledger, after, exhausted)| async move {
            if exhausted {
                return Ok::<_, LedgerError>(None);
            }
            let page = ledger.list_pending(after.as_ref(), page_size).await?;
            let Some(last) = page.last().map(ItemRecord::pending_key) else {
                return Ok(None);
            };
            let exhausted = page.len() < page_size;
            tracing::debug!(count = page.len(), "Loaded pending page");
            Ok(Some((
                stream::iter(page.into_iter().map(Ok)),
                (ledger, Some(last), exhausted),
            )))
        },
    )
    .try_flatten()
}
