use std::time::Duration;

use thiserror::Error;

use crate::auth::AuthError;
use crate::retry::RetryAction;

/// Errors surfaced by a remote catalog.
///
/// Classification drives policy upstream: `Transient` and `RateLimited` are
/// retried with backoff, `Expired` triggers a reference refresh, `NotFound`
/// quarantines the item.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The content reference is no longer valid.
    #[error("Content reference expired")]
    Expired,

    /// The remote no longer knows this item.
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Quota exhausted; the server may say how long to wait.
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient error: {0}")]
    Transient(String),

    /// Still unauthorized after one credential refresh.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Backoff decision for this error, honouring a server-provided delay.
    pub fn retry_action(&self) -> RetryAction {
        match self.retry_after() {
            Some(delay) => RetryAction::RetryAfter(delay),
            None if self.is_retryable() => RetryAction::Retry,
            None => RetryAction::Abort,
        }
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            // Connect, timeout and mid-body failures are all worth retrying.
            Self::Transient(e.to_string())
        }
    }
}
