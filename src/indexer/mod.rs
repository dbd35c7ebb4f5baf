//! Metadata indexer: enumerates the remote catalog into the ledger.
//!
//! Each scope walks listing pages with an explicit cursor, committing every
//! page to the ledger before requesting the next one. A scope that fails or
//! is cancelled leaves its committed pages in place but never advances the
//! watermark or records its range as scanned.

mod error;

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

pub use error::IndexError;

use crate::catalog::{CatalogError, PageCursor, RemoteCatalog};
use crate::ledger::{ItemRecord, Ledger, Watermark};
use crate::retry::{self, RetryConfig};
use crate::types::DateRange;

/// Which part of the remote library to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// From the newest confirmed capture date up to today, stopping at the
    /// first page with nothing new that reaches back to that date.
    Incremental,
    /// The whole library.
    Full,
    /// A user-chosen window of capture dates.
    Explicit(DateRange),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Incremental => f.write_str("incremental"),
            Scope::Full => f.write_str("full"),
            Scope::Explicit(range) => write!(f, "dates {range}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub(crate) retry: RetryConfig,
    /// Explicit scopes listed at the same time.
    pub(crate) concurrent_scopes: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            concurrent_scopes: 2,
        }
    }
}

/// What one or more scopes saw.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IndexReport {
    pub pages: u64,
    pub items_seen: u64,
    pub items_new: u64,
    /// Capture-time bounds of everything listed, if anything was.
    pub observed: Option<Watermark>,
}

impl IndexReport {
    fn absorb_page(&mut self, records: &[ItemRecord], new: u64) {
        self.pages += 1;
        self.items_seen += records.len() as u64;
        self.items_new += new;
        for record in records {
            let seen = Watermark {
                min_seen: record.captured_at,
                max_seen: record.captured_at,
            };
            self.observed = Some(self.observed.map_or(seen, |w| w.merged(seen)));
        }
    }

    fn merge(&mut self, other: IndexReport) {
        self.pages += other.pages;
        self.items_seen += other.items_seen;
        self.items_new += other.items_new;
        self.observed = match (self.observed, other.observed) {
            (Some(a), Some(b)) => Some(a.merged(b)),
            (a, b) => a.or(b),
        };
    }
}

pub struct Indexer {
    ledger: Arc<dyn Ledger>,
    catalog: Arc<dyn RemoteCatalog>,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        catalog: Arc<dyn RemoteCatalog>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            ledger,
            catalog,
            config,
        }
    }

    /// Run the watermark scopes one after another, then all explicit scopes
    /// concurrently. The first scope error ends the run.
    pub async fn run_scopes(
        &self,
        scopes: &[Scope],
        shutdown: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        let mut report = IndexReport::default();

        for scope in scopes.iter().filter(|s| !matches!(s, Scope::Explicit(_))) {
            report.merge(self.run_scope(*scope, shutdown).await?);
        }

        let explicit: Vec<Scope> = scopes
            .iter()
            .copied()
            .filter(|s| matches!(s, Scope::Explicit(_)))
            .collect();
        let mut results = stream::iter(explicit)
            .map(|scope| self.run_scope(scope, shutdown))
            .buffer_unordered(self.config.concurrent_scopes.max(1));
        while let Some(result) = results.next().await {
            report.merge(result?);
        }

        Ok(report)
    }

    /// Enumerate a single scope to completion.
    pub async fn run_scope(
        &self,
        scope: Scope,
        shutdown: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        let watermark = self.ledger.get_watermark().await?;
        let window = match scope {
            Scope::Incremental => watermark.map(|w| DateRange::until_now(w.max_seen.date_naive())),
            Scope::Full => None,
            Scope::Explicit(range) => Some(range),
        };
        // Listing is newest first. An incremental scope is caught up only once
        // a page with nothing new reaches back to the confirmed maximum;
        // known items above it may come from an explicit rescan and say
        // nothing about the gap below them. Without a watermark nothing is
        // confirmed, so everything is walked.
        let confirmed_max = match scope {
            Scope::Incremental => watermark.map(|w| w.max_seen),
            _ => None,
        };

        tracing::info!(
            scope = %scope,
            window = %window.map_or_else(|| "all time".to_string(), |r| r.to_string()),
            "Indexing"
        );

        let mut report = IndexReport::default();
        let mut cursor: Option<PageCursor> = None;
        loop {
            if shutdown.is_cancelled() {
                tracing::info!(scope = %scope, pages = report.pages, "Indexing interrupted");
                return Err(IndexError::Cancelled);
            }

            let page = retry::retry_with_backoff(
                &self.config.retry,
                CatalogError::retry_action,
                || self.catalog.list(window.as_ref(), cursor.as_ref()),
            )
            .await
            .map_err(|source| IndexError::PageRetriesExhausted {
                scope: scope.to_string(),
                source,
            })?;

            let records: Vec<ItemRecord> = page.items.into_iter().map(ItemRecord::from).collect();
            let new = self.ledger.upsert_page(&records).await?;
            report.absorb_page(&records, new);
            tracing::debug!(
                scope = %scope,
                page = report.pages,
                items = records.len(),
                new,
                "Committed listing page"
            );

            let caught_up = new == 0
                && confirmed_max.is_some_and(|max| {
                    records.iter().any(|record| record.captured_at <= max)
                });
            match page.next_cursor {
                Some(_) if caught_up => {
                    tracing::debug!(scope = %scope, "Reached already indexed items");
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        match scope {
            Scope::Incremental | Scope::Full => {
                if let Some(observed) = report.observed {
                    let widened = self.ledger.set_watermark(observed).await?;
                    tracing::debug!(
                        min = %widened.min_seen,
                        max = %widened.max_seen,
                        "Watermark updated"
                    );
                }
            }
            Scope::Explicit(range) => self.ledger.record_scanned_range(&range).await?,
        }

        tracing::info!(
            scope = %scope,
            pages = report.pages,
            seen = report.items_seen,
            new = report.items_new,
            "Indexing finished"
        );
        Ok(report)
    }
}
