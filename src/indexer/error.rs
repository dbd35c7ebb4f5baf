use thiserror::Error;

use crate::catalog::CatalogError;
use crate::ledger::LedgerError;

/// Errors that end an indexing scope.
#[derive(Error, Debug)]
pub enum IndexError {
    /// A listing page could not be fetched. Pages committed before it stay
    /// in the ledger; the watermark is not advanced.
    #[error("Listing failed for scope {scope}: {source}")]
    PageRetriesExhausted {
        scope: String,
        #[source]
        source: CatalogError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Shutdown was requested between pages.
    #[error("Indexing cancelled")]
    Cancelled,
}
