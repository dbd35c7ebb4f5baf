use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;

use super::error::CatalogError;
use crate::types::ItemKind;

/// Item metadata as reported by a catalog listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    /// Time-limited base reference for fetching the bytes.
    pub content_ref: String,
    pub kind: ItemKind,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// Opaque continuation token for a listing. Only valid for the scope and
/// run that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub items: Vec<RemoteItem>,
    /// `None` once the listing is exhausted.
    pub next_cursor: Option<PageCursor>,
}

/// Streamed item content.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CatalogError>> + Send>>;
