//! Remote catalog client.
//!
//! [`RemoteCatalog`] is the seam between the sync engine and the photo
//! service: a date-scoped, cursor-paginated listing, a targeted re-fetch of
//! one item (used to refresh an expired content reference), and a streaming
//! content fetch.

mod error;
#[cfg(test)]
pub mod fake;
mod google;
mod types;

use async_trait::async_trait;

pub use self::error::CatalogError;
pub use self::google::GooglePhotosCatalog;
pub use self::types::{ByteStream, CatalogPage, PageCursor, RemoteItem};
use crate::types::{DateRange, ItemKind};

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// List one page of items captured within `range` (all time when
    /// `None`), continuing from `cursor`. Items come newest first.
    async fn list(
        &self,
        range: Option<&DateRange>,
        cursor: Option<&PageCursor>,
    ) -> Result<CatalogPage, CatalogError>;

    /// Re-fetch a single item, yielding a fresh content reference.
    async fn get_item(&self, id: &str) -> Result<RemoteItem, CatalogError>;

    /// Stream the original bytes behind `content_ref`.
    async fn fetch(&self, content_ref: &str, kind: ItemKind) -> Result<ByteStream, CatalogError>;
}
