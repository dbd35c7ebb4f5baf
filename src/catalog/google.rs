//! Google Photos Library API binding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures_util::TryStreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::CatalogError;
use super::types::{ByteStream, CatalogPage, PageCursor, RemoteItem};
use super::RemoteCatalog;
use crate::auth::AccessTokenSource;
use crate::types::{DateRange, ItemKind};

const DEFAULT_BASE_URL: &str = "https://photoslibrary.googleapis.com";

/// Maximum page size accepted by `mediaItems:search`.
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<Filters>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Filters {
    date_filter: DateFilter,
}

#[derive(Debug, Serialize)]
struct DateFilter {
    ranges: Vec<ApiDateRange>,
}

/// Inclusive on both ends, unlike [`DateRange`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiDateRange {
    start_date: ApiDate,
    end_date: ApiDate,
}

#[derive(Debug, Serialize)]
struct ApiDate {
    year: i32,
    month: u32,
    day: u32,
}

impl From<NaiveDate> for ApiDate {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }
}

impl From<&DateRange> for Filters {
    fn from(range: &DateRange) -> Self {
        Filters {
            date_filter: DateFilter {
                ranges: vec![ApiDateRange {
                    start_date: range.start.into(),
                    end_date: range.last_day().into(),
                }],
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    media_items: Vec<MediaItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItem {
    id: String,
    base_url: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    media_metadata: MediaMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaMetadata {
    creation_time: DateTime<Utc>,
    #[serde(default)]
    video: Option<serde_json::Value>,
}

impl From<MediaItem> for RemoteItem {
    fn from(item: MediaItem) -> Self {
        let is_video = item.media_metadata.video.is_some()
            || item
                .mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("video/"));
        RemoteItem {
            id: item.id,
            captured_at: item.media_metadata.creation_time,
            content_ref: item.base_url,
            kind: if is_video {
                ItemKind::Video
            } else {
                ItemKind::Photo
            },
            mime_type: item.mime_type,
            filename: item.filename,
        }
    }
}

/// Google Photos catalog over the Library REST API.
pub struct GooglePhotosCatalog {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl std::fmt::Debug for GooglePhotosCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GooglePhotosCatalog")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GooglePhotosCatalog {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL, tokens)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        base_url: &str,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Send an API request with a bearer token. A 401 refreshes the token
    /// once and resends; a second 401 is returned as `Unauthorized`.
    async fn send_authorized(
        &self,
        build: impl Fn(&str) -> RequestBuilder,
    ) -> Result<Response, CatalogError> {
        let token = self.tokens.access_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!("Access token rejected, refreshing");
        let token = self.tokens.refresh().await?;
        let response = build(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Unauthorized(body));
        }
        Ok(response)
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status shared by all endpoints.
async fn status_error(response: Response) -> CatalogError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return CatalogError::RateLimited {
            retry_after: retry_after(&response),
        };
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CatalogError::Transient(format!("HTTP {status}: {body}"))
    } else {
        CatalogError::Protocol(format!("HTTP {status}: {body}"))
    }
}

#[async_trait]
impl RemoteCatalog for GooglePhotosCatalog {
    async fn list(
        &self,
        range: Option<&DateRange>,
        cursor: Option<&PageCursor>,
    ) -> Result<CatalogPage, CatalogError> {
        let url = format!("{}/v1/mediaItems:search", self.base_url);
        let request = SearchRequest {
            page_size: PAGE_SIZE,
            page_token: cursor.map(|c| c.0.as_str()),
            filters: range.map(Filters::from),
        };

        let response = self
            .send_authorized(|token| self.http.post(&url).bearer_auth(token).json(&request))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let page: SearchResponse = response.json().await?;
        tracing::debug!(
            items = page.media_items.len(),
            has_next = page.next_page_token.is_some(),
            "Listed catalog page"
        );
        Ok(CatalogPage {
            items: page.media_items.into_iter().map(RemoteItem::from).collect(),
            next_cursor: page
                .next_page_token
                .filter(|t| !t.is_empty())
                .map(PageCursor),
        })
    }

    async fn get_item(&self, id: &str) -> Result<RemoteItem, CatalogError> {
        let url = format!("{}/v1/mediaItems/{id}", self.base_url);
        let response = self
            .send_authorized(|token| self.http.get(&url).bearer_auth(token))
            .await?;

        match response.status() {
            status if status.is_success() => {
                let item: MediaItem = response.json().await?;
                Ok(item.into())
            }
            // The API answers 400 INVALID_ARGUMENT for ids it no longer knows.
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(CatalogError::NotFound(id.to_string()))
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn fetch(&self, content_ref: &str, kind: ItemKind) -> Result<ByteStream, CatalogError> {
        let suffix = match kind {
            ItemKind::Photo => "d",
            ItemKind::Video => "dv",
        };
        let url = format!("{content_ref}={suffix}");
        let response = self.http.get(&url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(Box::pin(
                response.bytes_stream().map_err(CatalogError::from),
            )),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(CatalogError::Expired)
            }
            _ => Err(status_error(response).await),
        }
    }
}
