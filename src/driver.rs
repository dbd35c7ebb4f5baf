//! One sync run: index every requested scope, then drain pending downloads.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::download::{format_duration, DownloadEngine, DownloadReport};
use crate::indexer::{IndexError, IndexReport, Indexer, Scope};
use crate::ledger::{Ledger, LedgerError, SyncRunStats};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Index(IndexError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<IndexError> for SyncError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Ledger(e) => SyncError::Ledger(e),
            other => SyncError::Index(other),
        }
    }
}

/// Everything a sync run did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub index: IndexReport,
    /// `None` when downloading was skipped.
    pub download: Option<DownloadReport>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl SyncReport {
    fn stats(&self) -> SyncRunStats {
        let download = self.download.as_ref();
        SyncRunStats {
            items_indexed: self.index.items_seen,
            items_new: self.index.items_new,
            items_downloaded: download.map_or(0, |d| d.downloaded),
            items_quarantined: download.map_or(0, |d| d.quarantined.len() as u64),
            items_left_pending: download.map_or(0, |d| d.left_pending.len() as u64),
            interrupted: self.interrupted,
            error: None,
        }
    }

    /// Log the end-of-run summary, including every item that did not make it.
    pub fn log_summary(&self) {
        tracing::info!("── Summary ──");
        if self.interrupted {
            tracing::info!("  Interrupted; the next run resumes where this one stopped");
        }
        tracing::info!(
            "  indexed {} items ({} new) in {} pages",
            self.index.items_seen,
            self.index.items_new,
            self.index.pages
        );
        let Some(download) = &self.download else {
            tracing::info!("  downloads skipped");
            tracing::info!("  elapsed: {}", format_duration(self.elapsed));
            return;
        };
        tracing::info!(
            "  {} downloaded ({} bytes), {} quarantined, {} left pending",
            download.downloaded,
            download.bytes,
            download.quarantined.len(),
            download.left_pending.len()
        );
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));

        for item in &download.quarantined {
            tracing::warn!("Quarantined {}: {}", item.id, item.reason);
        }
        for item in &download.left_pending {
            tracing::error!("Left pending {}: {}", item.id, item.reason);
        }
        if !download.left_pending.is_empty() {
            tracing::info!("Run sync again to retry items left pending");
        }
    }
}

pub struct Driver {
    ledger: Arc<dyn Ledger>,
    indexer: Indexer,
    engine: DownloadEngine,
}

impl Driver {
    pub fn new(ledger: Arc<dyn Ledger>, indexer: Indexer, engine: DownloadEngine) -> Self {
        Self {
            ledger,
            indexer,
            engine,
        }
    }

    /// Index `scopes` to completion, then download everything pending unless
    /// `skip_download` is set.
    ///
    /// A cancelled run is not an error: it is recorded as interrupted and
    /// resumes from the ledger next time. Scope failures and ledger errors
    /// end the run with `Err`.
    pub async fn sync(
        &self,
        scopes: &[Scope],
        skip_download: bool,
        shutdown: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let run_id = self.ledger.start_sync_run().await?;
        let mut report = SyncReport::default();

        match self.indexer.run_scopes(scopes, &shutdown).await {
            Ok(index) => report.index = index,
            Err(IndexError::Cancelled) => report.interrupted = true,
            Err(e) => {
                tracing::error!(error = %e, "Indexing failed, skipping downloads");
                self.record_failure(run_id, &report, &e).await;
                return Err(e.into());
            }
        }

        if skip_download {
            tracing::info!("Skipping downloads");
        } else if !report.interrupted {
            let download = match self.engine.run(shutdown.clone()).await {
                Ok(download) => download,
                Err(e) => {
                    self.record_failure(run_id, &report, &e).await;
                    return Err(e.into());
                }
            };
            report.interrupted = download.interrupted;
            report.download = Some(download);
        }

        self.ledger
            .complete_sync_run(run_id, &report.stats())
            .await?;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Close the run row with the error that ended it. A ledger that cannot
    /// take the update only gets a warning; the original error wins.
    async fn record_failure(&self, run_id: i64, report: &SyncReport, error: &dyn Display) {
        let stats = SyncRunStats {
            error: Some(error.to_string()),
            ..report.stats()
        };
        if let Err(e) = self.ledger.complete_sync_run(run_id, &stats).await {
            tracing::warn!(error = %e, "Could not record the failed sync run");
        }
    }
}
