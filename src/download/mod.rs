//! Download engine: drains the ledger's pending items into files on disk.
//!
//! Items are taken oldest-first from [`pending_stream`] and processed with
//! bounded concurrency. Each item either ends `downloaded` (file atomically
//! in place, ledger updated), `permanently_failed` (the remote no longer has
//! it), or stays `pending` with its failure recorded for the next run. Only
//! ledger failures abort the whole pass.

pub mod error;
pub mod file;
pub mod paths;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use self::error::DownloadError;
use self::paths::{clean_filename, with_id_suffix, PathMapper};
use crate::catalog::{CatalogError, RemoteCatalog};
use crate::ledger::{pending_stream, ItemRecord, Ledger, LedgerError};
use crate::retry::{self, RetryConfig};

/// Subset of application config consumed by the download engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub(crate) directory: PathBuf,
    pub(crate) concurrent_downloads: usize,
    pub(crate) retry: RetryConfig,
    pub(crate) no_progress_bar: bool,
    /// Pending items loaded from the ledger per query.
    pub(crate) page_size: usize,
}

/// An item that did not end up downloaded, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub id: String,
    pub reason: String,
}

/// Final state of one item after a download attempt.
#[derive(Debug)]
enum ItemOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    Quarantined(FailedItem),
    LeftPending(FailedItem),
}

/// Aggregated results of a download pass.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: u64,
    pub bytes: u64,
    pub quarantined: Vec<FailedItem>,
    pub left_pending: Vec<FailedItem>,
    pub interrupted: bool,
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY (e.g. piped output, cron jobs).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub struct DownloadEngine {
    ledger: Arc<dyn Ledger>,
    catalog: Arc<dyn RemoteCatalog>,
    mapper: Arc<dyn PathMapper>,
    config: DownloadConfig,
    /// Mapped paths seen during this pass and the item that won each one.
    claimed: Mutex<HashMap<PathBuf, String>>,
}

impl DownloadEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        catalog: Arc<dyn RemoteCatalog>,
        mapper: Arc<dyn PathMapper>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            ledger,
            catalog,
            mapper,
            config,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    /// Download every pending item once.
    ///
    /// On shutdown no new items are started; in-flight ones finish and are
    /// recorded. Returns `Err` only when the ledger fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DownloadReport, LedgerError> {
        let started = Instant::now();
        let total = self.ledger.get_summary().await?.pending;
        let mut report = DownloadReport::default();
        if total == 0 {
            tracing::info!("No pending items to download");
            return Ok(report);
        }

        tracing::info!(
            pending = total,
            concurrency = self.config.concurrent_downloads,
            "Downloading pending items"
        );
        let pb = create_progress_bar(self.config.no_progress_bar, total);
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let shutdown_ref = &shutdown;
        let results = pending_stream(self.ledger.clone(), self.config.page_size)
            .take_while(|_| std::future::ready(!shutdown_ref.is_cancelled()))
            .map(|record| {
                // Reserved here, in stream order, so the winner of a shared
                // path does not depend on which download runs first.
                let reserved = record.map(|record| {
                    let candidate = self.reserve_candidate(&record);
                    (record, candidate)
                });
                async move {
                    match reserved {
                        Ok((record, candidate)) => self.download_item(record, candidate).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .buffer_unordered(self.config.concurrent_downloads.max(1));
        tokio::pin!(results);

        while let Some(result) = results.next().await {
            match result? {
                ItemOutcome::Downloaded { path, bytes } => {
                    report.downloaded += 1;
                    report.bytes += bytes;
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    pb.set_message(name);
                }
                ItemOutcome::Quarantined(failed) => {
                    pb.suspend(|| {
                        tracing::warn!(
                            id = %failed.id,
                            reason = %failed.reason,
                            "Item quarantined"
                        );
                    });
                    report.quarantined.push(failed);
                }
                ItemOutcome::LeftPending(failed) => {
                    pb.suspend(|| {
                        tracing::error!(
                            id = %failed.id,
                            error = %failed.reason,
                            "Download failed, item left pending"
                        );
                    });
                    report.left_pending.push(failed);
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        report.interrupted = shutdown.is_cancelled();
        if report.interrupted {
            tracing::info!("Shutdown requested, stopped taking new downloads");
        }
        tracing::info!(
            downloaded = report.downloaded,
            quarantined = report.quarantined.len(),
            left_pending = report.left_pending.len(),
            elapsed = %format_duration(started.elapsed()),
            "Download pass finished"
        );
        Ok(report)
    }

    /// Drive one item to a final outcome. Only ledger errors escape.
    async fn download_item(
        &self,
        mut record: ItemRecord,
        candidate: Candidate,
    ) -> Result<ItemOutcome, LedgerError> {
        let id = record.id.clone();
        let result = self.materialize(&mut record, candidate).await;

        let outcome = match result {
            Ok((path, bytes)) => {
                self.ledger.mark_downloaded(&id, &path).await?;
                tracing::debug!(id = %id, path = %path.display(), "Downloaded");
                ItemOutcome::Downloaded { path, bytes }
            }
            Err(DownloadError::Ledger(e)) => return Err(e),
            Err(DownloadError::Catalog(CatalogError::NotFound(_))) => {
                let reason = "item no longer exists remotely".to_string();
                self.ledger.mark_permanently_failed(&id, &reason).await?;
                ItemOutcome::Quarantined(FailedItem { id, reason })
            }
            Err(e) => {
                let reason = e.to_string();
                let stale = e.is_expired() || record.ref_stale;
                self.ledger
                    .record_transient_failure(&id, &reason, stale)
                    .await?;
                ItemOutcome::LeftPending(FailedItem { id, reason })
            }
        };
        Ok(outcome)
    }

    /// Fetch and write the item, refreshing its content reference at most
    /// once. Returns the final path and the number of bytes written.
    async fn materialize(
        &self,
        record: &mut ItemRecord,
        candidate: Candidate,
    ) -> Result<(PathBuf, u64), DownloadError> {
        let mut refreshed = false;
        if record.ref_stale {
            self.refresh_ref(record).await?;
            refreshed = true;
        }

        let dest = self.resolve_destination(record, candidate).await?;
        match self.fetch_and_write(record, &dest).await {
            Err(e) if e.is_expired() && !refreshed => {
                tracing::debug!(id = %record.id, "Content reference expired, refreshing");
                record.ref_stale = true;
                self.refresh_ref(record).await?;
                let bytes = self.fetch_and_write(record, &dest).await?;
                Ok((dest, bytes))
            }
            result => result.map(|bytes| (dest, bytes)),
        }
    }

    async fn fetch_and_write(
        &self,
        record: &ItemRecord,
        dest: &Path,
    ) -> Result<u64, DownloadError> {
        retry::retry_with_backoff(
            &self.config.retry,
            DownloadError::retry_action,
            || async {
                let stream = self.catalog.fetch(&record.content_ref, record.kind).await?;
                file::write_atomically(stream, dest, &record.id, record.captured_at).await
            },
        )
        .await
    }

    /// Re-list the item for a fresh reference and store it.
    async fn refresh_ref(&self, record: &mut ItemRecord) -> Result<(), DownloadError> {
        let fresh = retry::retry_with_backoff(
            &self.config.retry,
            CatalogError::retry_action,
            || self.catalog.get_item(&record.id),
        )
        .await?;
        self.ledger
            .update_content_ref(&record.id, &fresh.content_ref)
            .await?;
        record.content_ref = fresh.content_ref;
        record.kind = fresh.kind;
        record.ref_stale = false;
        Ok(())
    }

    /// Map `record` and register it for the mapped path. Pending items
    /// arrive ordered by `(captured_at, id)`, so the oldest item mapping to a
    /// path wins it for the whole pass, even if its download later fails.
    fn reserve_candidate(&self, record: &ItemRecord) -> Candidate {
        let path = self.config.directory.join(self.mapper.map(record));
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        let winner = claimed
            .entry(path.clone())
            .or_insert_with(|| record.id.clone());
        Candidate {
            won: *winner == record.id,
            path,
        }
    }

    /// Choose the destination for `record`, never taking a path that belongs
    /// to another item or to a file this tool did not write.
    ///
    /// A file whose name already carries this item's id is a leftover from an
    /// interrupted run and may be replaced.
    async fn resolve_destination(
        &self,
        record: &ItemRecord,
        candidate: Candidate,
    ) -> Result<PathBuf, DownloadError> {
        let Candidate { path, won } = candidate;
        let owner = self.ledger.path_owner(&path).await?;
        let exists = tokio::fs::try_exists(&path).await?;

        let id_in_name = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains(&clean_filename(&record.id)));
        let foreign_file = exists && owner.is_none() && !id_in_name;
        let owned_by_other = owner.is_some_and(|o| o != record.id);

        if !won || owned_by_other || foreign_file {
            let suffixed = with_id_suffix(&path, &record.id);
            tracing::debug!(
                id = %record.id,
                taken = %path.display(),
                dest = %suffixed.display(),
                "Destination taken, using id suffix"
            );
            return Ok(suffixed);
        }
        Ok(path)
    }
}

/// Mapped path of an item and whether the item won it in this pass.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    won: bool,
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::{content_of, remote_item, FakeCatalog};
    use crate::catalog::RemoteItem;
    use crate::ledger::{DownloadState, SqliteLedger};
    use crate::types::ItemKind;
    use super::paths::DateFolderMapper;

    struct Fixture {
        dir: tempfile::TempDir,
        ledger: Arc<SqliteLedger>,
        catalog: Arc<FakeCatalog>,
    }

    impl Fixture {
        async fn new(items: Vec<RemoteItem>) -> Self {
            let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
            let records: Vec<ItemRecord> = items.iter().cloned().map(ItemRecord::from).collect();
            ledger.upsert_page(&records).await.unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                ledger,
                catalog: Arc::new(FakeCatalog::new(items, 10)),
            }
        }

        fn engine_with(&self, mapper: Arc<dyn PathMapper>) -> DownloadEngine {
            DownloadEngine::new(
                self.ledger.clone(),
                self.catalog.clone(),
                mapper,
                DownloadConfig {
                    directory: self.dir.path().to_path_buf(),
                    concurrent_downloads: 4,
                    retry: RetryConfig {
                        max_retries: 2,
                        base_delay: Duration::ZERO,
                        max_delay: Duration::ZERO,
                    },
                    no_progress_bar: true,
                    page_size: 2,
                },
            )
        }

        fn engine(&self) -> DownloadEngine {
            self.engine_with(Arc::new(DateFolderMapper::default()))
        }

        async fn run(&self) -> DownloadReport {
            self.engine().run(CancellationToken::new()).await.unwrap()
        }

        async fn state(&self, id: &str) -> ItemRecord {
            self.ledger.get_item(id).await.unwrap().unwrap()
        }
    }

    /// Maps every item to the same file.
    struct SameName;

    impl PathMapper for SameName {
        fn map(&self, _item: &ItemRecord) -> PathBuf {
            PathBuf::from("same.jpg")
        }
    }

    #[tokio::test]
    async fn test_expired_reference_is_refreshed_once() {
        let fx = Fixture::new(vec![remote_item(
            "AF1Q",
            "2020-01-02T10:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        fx.catalog.expire_ref("mem://AF1Q/0");

        let report = fx.run().await;

        assert_eq!(report.downloaded, 1);
        assert_eq!(fx.catalog.get_item_calls(), 1);
        let stored = fx.state("AF1Q").await;
        assert_eq!(stored.download_state, DownloadState::Downloaded);
        let expected = fx.dir.path().join("2020/01/02/AF1Q.jpg");
        assert_eq!(stored.local_path.as_deref(), Some(expected.as_path()));
        assert_eq!(stored.content_ref, "mem://AF1Q/1");
        assert_eq!(std::fs::read(&expected).unwrap(), content_of("AF1Q"));
    }

    #[tokio::test]
    async fn test_same_capture_time_gets_distinct_files() {
        let fx = Fixture::new(vec![
            remote_item("A", "2020-01-02T10:00:00Z", ItemKind::Photo),
            remote_item("B", "2020-01-02T10:00:00Z", ItemKind::Photo),
        ])
        .await;

        let report = fx.run().await;

        assert_eq!(report.downloaded, 2);
        let a = fx.state("A").await.local_path.unwrap();
        let b = fx.state("B").await.local_path.unwrap();
        assert_eq!(a.parent(), b.parent());
        assert_ne!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), content_of("A"));
        assert_eq!(std::fs::read(&b).unwrap(), content_of("B"));
    }

    #[tokio::test]
    async fn test_colliding_paths_go_to_the_oldest_item() {
        let fx = Fixture::new(vec![
            remote_item("B", "2020-01-02T00:00:00Z", ItemKind::Photo),
            remote_item("C", "2020-01-02T00:00:00Z", ItemKind::Photo),
            remote_item("A", "2020-01-03T00:00:00Z", ItemKind::Photo),
        ])
        .await;

        let report = fx
            .engine_with(Arc::new(SameName))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 3);
        let root = fx.dir.path();
        assert_eq!(fx.state("B").await.local_path.unwrap(), root.join("same.jpg"));
        assert_eq!(fx.state("C").await.local_path.unwrap(), root.join("same-C.jpg"));
        assert_eq!(fx.state("A").await.local_path.unwrap(), root.join("same-A.jpg"));
        assert_eq!(std::fs::read(root.join("same.jpg")).unwrap(), content_of("B"));
    }

    #[tokio::test]
    async fn test_failed_collision_winner_keeps_its_path_for_next_run() {
        let fx = Fixture::new(vec![
            remote_item("A", "2020-01-01T00:00:00Z", ItemKind::Photo),
            remote_item("B", "2020-01-02T00:00:00Z", ItemKind::Photo),
        ])
        .await;
        fx.catalog.fail_fetches(
            "A",
            (0..3)
                .map(|_| CatalogError::Transient("503".into()))
                .collect(),
        );
        let root = fx.dir.path();

        let report = fx
            .engine_with(Arc::new(SameName))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.left_pending.len(), 1);
        assert_eq!(fx.state("B").await.local_path.unwrap(), root.join("same-B.jpg"));
        assert!(!root.join("same.jpg").exists());

        fx.engine_with(Arc::new(SameName))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.state("A").await.local_path.unwrap(), root.join("same.jpg"));
        assert_eq!(std::fs::read(root.join("same.jpg")).unwrap(), content_of("A"));
    }

    #[tokio::test]
    async fn test_foreign_file_is_never_overwritten() {
        let fx = Fixture::new(vec![remote_item(
            "A",
            "2020-01-01T00:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        std::fs::write(fx.dir.path().join("same.jpg"), b"user's own file").unwrap();

        fx.engine_with(Arc::new(SameName))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(fx.dir.path().join("same.jpg")).unwrap(),
            b"user's own file"
        );
        assert_eq!(
            fx.state("A").await.local_path.unwrap(),
            fx.dir.path().join("same-A.jpg")
        );
    }

    #[tokio::test]
    async fn test_leftover_file_of_same_item_is_replaced() {
        let fx = Fixture::new(vec![remote_item(
            "A",
            "2020-01-02T10:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        let dest = fx.dir.path().join("2020/01/02/A.jpg");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"from a crashed run").unwrap();

        fx.run().await;

        assert_eq!(fx.state("A").await.local_path.unwrap(), dest);
        assert_eq!(std::fs::read(&dest).unwrap(), content_of("A"));
    }

    #[tokio::test]
    async fn test_removed_item_is_quarantined_without_blocking_others() {
        let fx = Fixture::new(vec![
            remote_item("GONE", "2020-01-01T00:00:00Z", ItemKind::Photo),
            remote_item("OK", "2020-01-02T00:00:00Z", ItemKind::Video),
        ])
        .await;
        fx.catalog.expire_ref("mem://GONE/0");
        fx.catalog.remove_item("GONE");

        let report = fx.run().await;

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].id, "GONE");
        assert_eq!(
            fx.state("GONE").await.download_state,
            DownloadState::PermanentlyFailed
        );
        let ok = fx.state("OK").await;
        assert_eq!(ok.download_state, DownloadState::Downloaded);
        assert!(ok.local_path.unwrap().ends_with("2020/01/02/OK.mp4"));

        // Quarantined items are not retried.
        let second = fx.run().await;
        assert_eq!(second.downloaded + second.quarantined.len() as u64, 0);
    }

    #[tokio::test]
    async fn test_repeated_expiry_leaves_item_pending_and_stale() {
        let fx = Fixture::new(vec![remote_item(
            "A",
            "2020-01-01T00:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        fx.catalog.expire_ref("mem://A/0");
        fx.catalog.expire_ref("mem://A/1");

        let report = fx.run().await;

        assert_eq!(report.left_pending.len(), 1);
        assert_eq!(fx.catalog.get_item_calls(), 1);
        let stored = fx.state("A").await;
        assert_eq!(stored.download_state, DownloadState::Pending);
        assert!(stored.ref_stale);
        assert_eq!(stored.download_attempts, 1);

        // Next run refreshes before fetching and succeeds.
        let report = fx.run().await;
        assert_eq!(report.downloaded, 1);
        assert_eq!(fx.state("A").await.content_ref, "mem://A/2");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_left_pending() {
        let fx = Fixture::new(vec![
            remote_item("FLAKY", "2020-01-01T00:00:00Z", ItemKind::Photo),
            remote_item("DOWN", "2020-01-02T00:00:00Z", ItemKind::Photo),
        ])
        .await;
        fx.catalog.fail_fetches(
            "FLAKY",
            vec![
                CatalogError::Transient("503".into()),
                CatalogError::RateLimited { retry_after: None },
            ],
        );
        fx.catalog.fail_fetches(
            "DOWN",
            (0..3)
                .map(|_| CatalogError::Transient("503".into()))
                .collect(),
        );

        let report = fx.run().await;

        assert_eq!(report.downloaded, 1);
        assert_eq!(fx.state("FLAKY").await.download_state, DownloadState::Downloaded);
        assert_eq!(report.left_pending.len(), 1);
        let down = fx.state("DOWN").await;
        assert_eq!(down.download_state, DownloadState::Pending);
        assert_eq!(down.download_attempts, 1);
        assert!(!down.ref_stale);
        assert!(down.last_error.unwrap().contains("503"));

        let report = fx.run().await;
        assert_eq!(report.downloaded, 1);
        assert_eq!(fx.state("DOWN").await.download_state, DownloadState::Downloaded);
    }

    #[tokio::test]
    async fn test_broken_stream_leaves_no_partial_file() {
        let fx = Fixture::new(vec![remote_item(
            "A",
            "2020-01-02T00:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        fx.catalog.break_stream("A");

        let report = fx.run().await;

        assert_eq!(report.left_pending.len(), 1);
        let dest = fx.dir.path().join("2020/01/02/A.jpg");
        assert!(!dest.exists());
        assert!(!file::temp_download_path(&dest, "A").exists());
        assert_eq!(fx.state("A").await.download_state, DownloadState::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_downloads_nothing() {
        let fx = Fixture::new(vec![remote_item(
            "A",
            "2020-01-02T00:00:00Z",
            ItemKind::Photo,
        )])
        .await;
        let token = CancellationToken::new();
        token.cancel();

        let report = fx.engine().run(token).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.downloaded, 0);
        assert_eq!(fx.catalog.fetch_calls(), 0);
        assert_eq!(fx.state("A").await.download_state, DownloadState::Pending);
    }

    #[tokio::test]
    async fn test_many_items_across_pages_all_downloaded() {
        let items: Vec<_> = (1..=9)
            .map(|d| {
                let captured = format!("2020-01-0{d}T00:00:00Z");
                remote_item(&format!("I{d}"), &captured, ItemKind::Photo)
            })
            .collect();
        let fx = Fixture::new(items).await;

        let report = fx.run().await;

        assert_eq!(report.downloaded, 9);
        let summary = fx.ledger.get_summary().await.unwrap();
        assert_eq!(summary.downloaded, 9);
        assert_eq!(summary.pending, 0);
        assert_eq!(fx.ledger.check_consistency().await.unwrap(), 9);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        let pb = create_progress_bar(true, 100);
        assert!(pb.is_hidden());
    }
}
