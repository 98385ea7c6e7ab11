//! Cursor-paginated document fetching with a page cache.
//!
//! Every (table, component, filter) combination has its own cache entry
//! keyed by a structural [`PageKey`]. Cursors are only ever sent back with
//! the key they were issued under, so changing the filter starts over from
//! the first page. At most one fetch per key is in flight; a fetch whose key
//! stopped being the active one while it ran still lands in its own entry
//! but is reported as [`FetchOutcome::Superseded`].
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
};

use anyhow::Context;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{
    Value as JsonValue,
    json,
};
use value::{
    DocumentId,
    DynamicValue,
    TableDocument,
    TableName,
};

use crate::{
    banner::ErrorBanner,
    filters::{
        FilterExpression,
        wire_token,
    },
    rpc::{
        ComponentId,
        DeploymentRpc,
        component_arg,
        system_udfs,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table: TableName,
    pub component: Option<ComponentId>,
    /// Wire form of the active filter; `None` when unfiltered.
    pub filter: Option<FilterExpression>,
}

impl PageKey {
    pub fn new(
        table: TableName,
        component: Option<ComponentId>,
        expression: &FilterExpression,
    ) -> Self {
        let wire = expression.wire_form();
        Self {
            table,
            component,
            filter: (!wire.is_unfiltered()).then_some(wire),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchState {
    /// Nothing fetched yet; the next fetch starts from cursor `None`.
    Idle,
    Ready { next_cursor: String },
    Done,
}

#[derive(Debug)]
pub struct PaginatedEntry {
    pub pages: Vec<Vec<TableDocument>>,
    pub state: FetchState,
    pub in_flight: bool,
    pub last_error: Option<String>,
    generation: u64,
}

impl PaginatedEntry {
    fn new(generation: u64) -> Self {
        Self {
            pages: vec![],
            state: FetchState::Idle,
            in_flight: false,
            last_error: None,
            generation,
        }
    }

    fn documents(&self) -> impl Iterator<Item = &TableDocument> {
        self.pages.iter().flatten()
    }
}

#[derive(Default)]
pub struct PageCache {
    entries: HashMap<PageKey, PaginatedEntry>,
    next_generation: u64,
}

impl PageCache {
    pub fn get(&self, key: &PageKey) -> Option<&PaginatedEntry> {
        self.entries.get(key)
    }

    fn entry(&mut self, key: &PageKey) -> &mut PaginatedEntry {
        let next_generation = &mut self.next_generation;
        self.entries.entry(key.clone()).or_insert_with(|| {
            *next_generation += 1;
            PaginatedEntry::new(*next_generation)
        })
    }

    pub fn invalidate_table(&mut self, table: &TableName) {
        self.entries.retain(|key, _| &key.table != table);
    }

    /// Rewrites patched documents in every entry of `table`, then drops the
    /// ones that no longer satisfy that entry's filter.
    pub fn apply_patch(
        &mut self,
        table: &TableName,
        ids: &[DocumentId],
        fields: &BTreeMap<String, DynamicValue>,
    ) {
        for (key, entry) in self.entries.iter_mut() {
            if &key.table != table {
                continue;
            }
            for page in entry.pages.iter_mut() {
                for document in page.iter_mut() {
                    if ids.contains(document.id()) {
                        document.apply_patch(fields);
                    }
                }
                if let Some(filter) = &key.filter {
                    page.retain(|d| !ids.contains(d.id()) || filter.matches(d));
                }
            }
        }
    }

    pub fn remove_documents(&mut self, table: &TableName, ids: &[DocumentId]) {
        for (key, entry) in self.entries.iter_mut() {
            if &key.table != table {
                continue;
            }
            for page in entry.pages.iter_mut() {
                page.retain(|d| !ids.contains(d.id()));
            }
        }
    }
}

pub type SharedPageCache = Arc<Mutex<PageCache>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { count: usize },
    /// A fetch for the active key is already running.
    InFlight,
    /// The key has been fully read; nothing was requested.
    Done,
    /// The active key changed, or the entry was invalidated, while the fetch
    /// ran.
    Superseded,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    page: Vec<JsonValue>,
    is_done: bool,
    continue_cursor: String,
}

/// Clears the in-flight flag if a fetch is dropped before it finishes.
struct InFlightGuard<'a> {
    cache: &'a Mutex<PageCache>,
    key: &'a PageKey,
    generation: u64,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut cache = self.cache.lock();
        if let Some(entry) = cache
            .entries
            .get_mut(self.key)
            .filter(|e| e.generation == self.generation)
        {
            entry.in_flight = false;
        }
    }
}

pub struct DocumentFetcher<R: DeploymentRpc> {
    rpc: Arc<R>,
    cache: SharedPageCache,
    active: Mutex<Option<PageKey>>,
    page_size: usize,
    banner: ErrorBanner,
}

impl<R: DeploymentRpc> DocumentFetcher<R> {
    pub fn new(rpc: Arc<R>, banner: ErrorBanner) -> Self {
        Self::with_page_size(rpc, banner, *common::knobs::PANEL_PAGE_SIZE)
    }

    pub fn with_page_size(rpc: Arc<R>, banner: ErrorBanner, page_size: usize) -> Self {
        Self {
            rpc,
            cache: Arc::new(Mutex::new(PageCache::default())),
            active: Mutex::new(None),
            page_size,
            banner,
        }
    }

    pub fn cache(&self) -> &SharedPageCache {
        &self.cache
    }

    pub fn rpc(&self) -> &Arc<R> {
        &self.rpc
    }

    pub fn banner(&self) -> &ErrorBanner {
        &self.banner
    }

    /// Makes `(table, component, expression)` the active view. A key that was
    /// never fetched starts from the first page.
    pub fn select(
        &self,
        table: TableName,
        component: Option<ComponentId>,
        expression: &FilterExpression,
    ) -> PageKey {
        let key = PageKey::new(table, component, expression);
        self.cache.lock().entry(&key);
        *self.active.lock() = Some(key.clone());
        key
    }

    pub fn active_key(&self) -> Option<PageKey> {
        self.active.lock().clone()
    }

    fn require_active(&self) -> anyhow::Result<PageKey> {
        self.active_key().ok_or_else(|| {
            ErrorMetadata::bad_request("NoTableSelected", "Select a table first").into()
        })
    }

    /// Fetches the page after the last one cached for the active key.
    pub async fn fetch_next_page(&self) -> anyhow::Result<FetchOutcome> {
        let key = self.require_active()?;
        let (cursor, generation) = {
            let mut cache = self.cache.lock();
            let entry = cache.entry(&key);
            let cursor = match &entry.state {
                FetchState::Done => return Ok(FetchOutcome::Done),
                _ if entry.in_flight => return Ok(FetchOutcome::InFlight),
                FetchState::Idle => None,
                FetchState::Ready { next_cursor } => Some(next_cursor.clone()),
            };
            entry.in_flight = true;
            (cursor, entry.generation)
        };
        let mut guard = InFlightGuard {
            cache: &self.cache,
            key: &key,
            generation,
            armed: true,
        };
        tracing::debug!(
            "Fetching {} (cursor {:?}, filtered: {})",
            key.table,
            cursor,
            key.filter.is_some()
        );
        let result = self.fetch_page(&key, cursor.as_deref(), generation).await;

        guard.armed = false;
        let mut cache = self.cache.lock();
        let Some(entry) = cache
            .entries
            .get_mut(&key)
            .filter(|e| e.generation == generation)
        else {
            return Ok(FetchOutcome::Superseded);
        };
        entry.in_flight = false;
        let (documents, next_cursor) = match result {
            Ok(page) => page,
            Err(e) => {
                entry.last_error = Some(e.to_string());
                drop(cache);
                // A failure for a view the user already left stays on its
                // entry and off the banner.
                if self.active_key().as_ref() != Some(&key) {
                    tracing::debug!("Dropping error for inactive view of {}: {e:#}", key.table);
                    return Ok(FetchOutcome::Superseded);
                }
                self.banner.report(&e);
                return Err(e);
            },
        };
        let count = documents.len();
        entry.last_error = None;
        entry.pages.push(documents);
        entry.state = match next_cursor {
            Some(next_cursor) => FetchState::Ready { next_cursor },
            None => FetchState::Done,
        };
        drop(cache);
        if self.active_key().as_ref() != Some(&key) {
            return Ok(FetchOutcome::Superseded);
        }
        Ok(FetchOutcome::Fetched { count })
    }

    async fn fetch_page(
        &self,
        key: &PageKey,
        cursor: Option<&str>,
        generation: u64,
    ) -> anyhow::Result<(Vec<TableDocument>, Option<String>)> {
        let filters = match &key.filter {
            Some(filter) => Some(wire_token(filter)?),
            None => None,
        }
        .flatten();
        let args = json!({
            "paginationOpts": {
                "numItems": self.page_size,
                "cursor": cursor,
                "id": generation,
            },
            "table": &*key.table,
            "filters": filters,
            "componentId": component_arg(key.component.as_ref()),
        });
        let result = self
            .rpc
            .query(system_udfs::PAGINATED_TABLE_DOCUMENTS, args)
            .await?;
        let response: PageResponse =
            serde_json::from_value(result).context("Unexpected paginated documents response")?;
        let documents = response
            .page
            .into_iter()
            .map(|d| TableDocument::from_json(&key.table, d))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let next_cursor = (!response.is_done).then_some(response.continue_cursor);
        Ok((documents, next_cursor))
    }

    /// Fetches pages until the active key is exhausted or at least `limit`
    /// documents are cached.
    pub async fn load_all(&self, limit: usize) -> anyhow::Result<Vec<TableDocument>> {
        loop {
            if self.documents().len() >= limit {
                break;
            }
            match self.fetch_next_page().await? {
                FetchOutcome::Fetched { .. } => {},
                FetchOutcome::Done | FetchOutcome::InFlight | FetchOutcome::Superseded => break,
            }
        }
        let mut documents = self.documents();
        documents.truncate(limit);
        Ok(documents)
    }

    /// All cached documents of the active key, pages concatenated.
    pub fn documents(&self) -> Vec<TableDocument> {
        let Some(key) = self.active_key() else {
            return vec![];
        };
        self.cache
            .lock()
            .get(&key)
            .map(|e| e.documents().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_done(&self) -> bool {
        self.with_active_entry(|e| e.state == FetchState::Done)
            .unwrap_or(false)
    }

    pub fn is_loading(&self) -> bool {
        self.with_active_entry(|e| e.in_flight).unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<String> {
        self.with_active_entry(|e| e.last_error.clone()).flatten()
    }

    pub fn page_count(&self) -> usize {
        self.with_active_entry(|e| e.pages.len()).unwrap_or(0)
    }

    fn with_active_entry<T>(&self, f: impl FnOnce(&PaginatedEntry) -> T) -> Option<T> {
        let key = self.active_key()?;
        self.cache.lock().get(&key).map(f)
    }
}
