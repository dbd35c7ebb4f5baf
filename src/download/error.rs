use thiserror::Error;

use crate::catalog::CatalogError;
use crate::ledger::LedgerError;
use crate::retry::RetryAction;

/// Item-level download errors enabling retry classification.
///
/// `is_retryable()` separates transient remote failures (server errors, rate
/// limits, dropped connections) from ones another attempt cannot fix.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl DownloadError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Catalog(e) => e.is_retryable(),
            DownloadError::Disk(_) => false,
            DownloadError::Ledger(_) => false,
        }
    }

    pub fn retry_action(&self) -> RetryAction {
        match self {
            DownloadError::Catalog(e) => e.retry_action(),
            _ => RetryAction::Abort,
        }
    }

    /// Whether the content reference must be refreshed before retrying.
    pub fn is_expired(&self) -> bool {
        matches!(self, DownloadError::Catalog(CatalogError::Expired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limited_retryable() {
        let e = DownloadError::Catalog(CatalogError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        });
        assert!(e.is_retryable());
    }

    #[test]
    fn test_transient_retryable() {
        let e = DownloadError::Catalog(CatalogError::Transient("reset".into()));
        assert!(e.is_retryable());
    }

    #[test]
    fn test_expired_not_retryable_but_flagged() {
        let e = DownloadError::Catalog(CatalogError::Expired);
        assert!(!e.is_retryable());
        assert!(e.is_expired());
    }

    #[test]
    fn test_not_found_not_retryable() {
        let e = DownloadError::Catalog(CatalogError::NotFound("A".into()));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_disk_not_retryable() {
        let e = DownloadError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_ledger_not_retryable() {
        let e = DownloadError::Ledger(LedgerError::UnknownItem("A".into()));
        assert!(!e.is_retryable());
    }
}
