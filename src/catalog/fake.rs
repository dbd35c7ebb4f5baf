//! Scripted in-memory catalog for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;

use super::{ByteStream, CatalogError, CatalogPage, PageCursor, RemoteCatalog, RemoteItem};
use crate::types::{DateRange, ItemKind};

/// Build a remote item whose reference is `mem://<id>/0`.
pub fn remote_item(id: &str, captured_at: &str, kind: ItemKind) -> RemoteItem {
    let captured_at: DateTime<Utc> = captured_at.parse().unwrap();
    RemoteItem {
        id: id.to_string(),
        captured_at,
        content_ref: format!("mem://{id}/0"),
        kind,
        mime_type: Some(match kind {
            ItemKind::Photo => "image/jpeg".to_string(),
            ItemKind::Video => "video/mp4".to_string(),
        }),
        filename: Some(format!("{id}.orig")),
    }
}

/// The bytes the fake serves for `id`.
pub fn content_of(id: &str) -> Vec<u8> {
    format!("content of {id}").into_bytes()
}

#[derive(Default)]
struct State {
    items: Vec<RemoteItem>,
    list_failures: VecDeque<CatalogError>,
    /// Listing calls that succeed before `list_failures` apply.
    fail_after: usize,
    fetch_failures: HashMap<String, VecDeque<CatalogError>>,
    expired_refs: HashSet<String>,
    broken_streams: HashSet<String>,
    generations: HashMap<String, u32>,
    listed: Vec<Option<DateRange>>,
    get_item_calls: usize,
    fetch_calls: usize,
}

/// Catalog that lists newest-first like the real service, paginates by
/// offset and serves deterministic content.
pub struct FakeCatalog {
    page_size: usize,
    state: Mutex<State>,
}

impl FakeCatalog {
    pub fn new(items: Vec<RemoteItem>, page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(State {
                items,
                ..State::default()
            }),
        }
    }

    pub fn add_item(&self, item: RemoteItem) {
        self.state.lock().unwrap().items.push(item);
    }

    /// Make the item disappear remotely.
    pub fn remove_item(&self, id: &str) {
        self.state.lock().unwrap().items.retain(|i| i.id != id);
    }

    /// Fail the next `list` calls with these errors, in order.
    pub fn fail_next_lists(&self, errors: Vec<CatalogError>) {
        let listed = self.list_calls();
        self.fail_lists_after(listed, errors);
    }

    /// Let the first `successful_calls` listings (counted from creation)
    /// succeed, then fail with these errors in order.
    pub fn fail_lists_after(&self, successful_calls: usize, errors: Vec<CatalogError>) {
        let mut state = self.state.lock().unwrap();
        state.fail_after = successful_calls;
        state.list_failures.extend(errors);
    }

    /// Fail the next fetches of `id` with these errors, in order.
    pub fn fail_fetches(&self, id: &str, errors: Vec<CatalogError>) {
        self.state
            .lock()
            .unwrap()
            .fetch_failures
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Treat `content_ref` as expired.
    pub fn expire_ref(&self, content_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .expired_refs
            .insert(content_ref.to_string());
    }

    /// Make fetches of `id` fail after the first chunk.
    pub fn break_stream(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .broken_streams
            .insert(id.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().listed.len()
    }

    pub fn listed_ranges(&self) -> Vec<Option<DateRange>> {
        self.state.lock().unwrap().listed.clone()
    }

    pub fn get_item_calls(&self) -> usize {
        self.state.lock().unwrap().get_item_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }
}

fn id_from_ref(content_ref: &str) -> Option<&str> {
    content_ref.strip_prefix("mem://")?.split('/').next()
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn list(
        &self,
        range: Option<&DateRange>,
        cursor: Option<&PageCursor>,
    ) -> Result<CatalogPage, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.listed.push(range.copied());
        if state.listed.len() > state.fail_after {
            if let Some(err) = state.list_failures.pop_front() {
                return Err(err);
            }
        }

        let mut matching: Vec<RemoteItem> = state
            .items
            .iter()
            .filter(|i| range.map_or(true, |r| r.contains(&i.captured_at)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then(a.id.cmp(&b.id)));

        let offset: usize = cursor.map_or(0, |c| c.0.parse().unwrap());
        let end = (offset + self.page_size).min(matching.len());
        let items = matching.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < matching.len()).then(|| PageCursor(end.to_string()));
        Ok(CatalogPage { items, next_cursor })
    }

    async fn get_item(&self, id: &str) -> Result<RemoteItem, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.get_item_calls += 1;
        let mut item = state
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let generation = state.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        item.content_ref = format!("mem://{id}/{generation}");
        Ok(item)
    }

    async fn fetch(&self, content_ref: &str, _kind: ItemKind) -> Result<ByteStream, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_calls += 1;
        let id = id_from_ref(content_ref)
            .ok_or_else(|| CatalogError::Protocol(format!("bad ref {content_ref}")))?
            .to_string();

        if state.expired_refs.contains(content_ref) {
            return Err(CatalogError::Expired);
        }
        if let Some(err) = state.fetch_failures.get_mut(&id).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let content = content_of(&id);
        let (head, tail) = content.split_at(content.len() / 2);
        let mut chunks = vec![Ok(Bytes::copy_from_slice(head))];
        if state.broken_streams.contains(&id) {
            chunks.push(Err(CatalogError::Transient("connection reset".to_string())));
        } else {
            chunks.push(Ok(Bytes::copy_from_slice(tail)));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }
}
