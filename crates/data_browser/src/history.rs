//! Per-table filter history with linear undo/redo.
//!
//! The history itself lives behind a [`HistoryBackend`] (normally the
//! deployment's `filterHistory` functions). [`HistoryClient`] funnels every
//! operation for a scope through one worker task so that pushes, undos and
//! redos issued in quick succession are applied in the order they were made.
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::json;
use tokio::sync::{
    mpsc,
    oneshot,
};
use value::TableName;

use crate::{
    filters::{
        FilterExpression,
        SortConfig,
    },
    rpc::{
        DeploymentRpc,
        system_udfs,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HistoryScope {
    pub user_id: String,
    pub table: TableName,
}

impl HistoryScope {
    pub fn new(user_id: impl Into<String>, table: TableName) -> Self {
        Self {
            user_id: user_id.into(),
            table,
        }
    }
}

impl fmt::Display for HistoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}:table:{}", self.user_id, self.table)
    }
}

/// What one history entry restores.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    pub filters: FilterExpression,
    #[serde(rename = "sortConfig", default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
    /// Index of the current entry; `None` before the first one.
    pub position: Option<usize>,
    pub length: usize,
}

#[async_trait]
pub trait HistoryBackend: Send + Sync + 'static {
    /// Appends `snapshot` after the current entry, discarding any entries
    /// that could have been redone.
    async fn push(&self, scope: &HistoryScope, snapshot: FilterSnapshot) -> anyhow::Result<()>;
    /// Moves back `count` entries. `None` once the pointer is before the
    /// first entry.
    async fn undo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>>;
    /// Moves forward up to `count` entries. `None` when already at the head.
    async fn redo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>>;
    async fn status(&self, scope: &HistoryScope) -> anyhow::Result<HistoryStatus>;
}

/// One scope's entries and the pointer into them.
#[derive(Default)]
pub(crate) struct ScopeLog {
    entries: Vec<FilterSnapshot>,
    position: Option<usize>,
}

impl ScopeLog {
    pub(crate) fn push(&mut self, snapshot: FilterSnapshot) {
        let keep = self.position.map_or(0, |p| p + 1);
        self.entries.truncate(keep);
        self.entries.push(snapshot);
        self.position = Some(self.entries.len() - 1);
    }

    pub(crate) fn undo(&mut self, count: usize) -> Option<FilterSnapshot> {
        let position = self.position?;
        self.position = position.checked_sub(count);
        self.position.map(|p| self.entries[p].clone())
    }

    pub(crate) fn redo(&mut self, count: usize) -> Option<FilterSnapshot> {
        let next = self.position.map_or(0, |p| p + 1);
        if next >= self.entries.len() || count == 0 {
            return None;
        }
        let target = (next + count - 1).min(self.entries.len() - 1);
        self.position = Some(target);
        Some(self.entries[target].clone())
    }

    pub(crate) fn status(&self) -> HistoryStatus {
        let next = self.position.map_or(0, |p| p + 1);
        HistoryStatus {
            can_undo: self.position.is_some(),
            can_redo: next < self.entries.len(),
            position: self.position,
            length: self.entries.len(),
        }
    }
}

/// Keeps every scope's log in memory. Used by the CLI when the deployment
/// has no history functions, and by tests.
#[derive(Default)]
pub struct InMemoryHistoryBackend {
    logs: Mutex<HashMap<HistoryScope, ScopeLog>>,
}

impl InMemoryHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryBackend for InMemoryHistoryBackend {
    async fn push(&self, scope: &HistoryScope, snapshot: FilterSnapshot) -> anyhow::Result<()> {
        self.logs
            .lock()
            .entry(scope.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn undo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        Ok(self
            .logs
            .lock()
            .get_mut(scope)
            .and_then(|log| log.undo(count)))
    }

    async fn redo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        Ok(self
            .logs
            .lock()
            .get_mut(scope)
            .and_then(|log| log.redo(count)))
    }

    async fn status(&self, scope: &HistoryScope) -> anyhow::Result<HistoryStatus> {
        Ok(self
            .logs
            .lock()
            .get(scope)
            .map(ScopeLog::status)
            .unwrap_or_default())
    }
}

/// History stored by the deployment's `filterHistory` functions.
pub struct RpcHistoryBackend<R: DeploymentRpc> {
    rpc: Arc<R>,
}

impl<R: DeploymentRpc> RpcHistoryBackend<R> {
    pub fn new(rpc: Arc<R>) -> Self {
        Self { rpc }
    }

    fn parse_snapshot(
        path: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        serde_json::from_value(value).with_context(|| {
            ErrorMetadata::bad_request(
                "InvalidHistoryEntry",
                format!("{path} returned an unreadable filter state"),
            )
        })
    }
}

#[async_trait]
impl<R: DeploymentRpc> HistoryBackend for RpcHistoryBackend<R> {
    async fn push(&self, scope: &HistoryScope, snapshot: FilterSnapshot) -> anyhow::Result<()> {
        self.rpc
            .mutation(
                system_udfs::FILTER_HISTORY_PUSH,
                json!({"scope": scope.to_string(), "state": snapshot}),
            )
            .await?;
        Ok(())
    }

    async fn undo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        let value = self
            .rpc
            .mutation(
                system_udfs::FILTER_HISTORY_UNDO,
                json!({"scope": scope.to_string(), "count": count}),
            )
            .await?;
        Self::parse_snapshot(system_udfs::FILTER_HISTORY_UNDO, value)
    }

    async fn redo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        let value = self
            .rpc
            .mutation(
                system_udfs::FILTER_HISTORY_REDO,
                json!({"scope": scope.to_string(), "count": count}),
            )
            .await?;
        Self::parse_snapshot(system_udfs::FILTER_HISTORY_REDO, value)
    }

    async fn status(&self, scope: &HistoryScope) -> anyhow::Result<HistoryStatus> {
        let value = self
            .rpc
            .query(
                system_udfs::FILTER_HISTORY_STATUS,
                json!({"scope": scope.to_string()}),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

pub enum HistoryRequest {
    Push(FilterSnapshot, oneshot::Sender<anyhow::Result<()>>),
    Undo(usize, oneshot::Sender<anyhow::Result<Option<FilterSnapshot>>>),
    Redo(usize, oneshot::Sender<anyhow::Result<Option<FilterSnapshot>>>),
    Status(oneshot::Sender<anyhow::Result<HistoryStatus>>),
}

async fn history_worker(
    scope: HistoryScope,
    backend: Arc<dyn HistoryBackend>,
    mut requests: mpsc::UnboundedReceiver<HistoryRequest>,
) {
    tracing::debug!("Starting history worker for {scope}");
    while let Some(request) = requests.recv().await {
        // A dropped reply receiver only means the caller went away.
        match request {
            HistoryRequest::Push(snapshot, tx) => {
                let _ = tx.send(backend.push(&scope, snapshot).await);
            },
            HistoryRequest::Undo(count, tx) => {
                let _ = tx.send(backend.undo(&scope, count).await);
            },
            HistoryRequest::Redo(count, tx) => {
                let _ = tx.send(backend.redo(&scope, count).await);
            },
            HistoryRequest::Status(tx) => {
                let _ = tx.send(backend.status(&scope).await);
            },
        }
    }
    tracing::debug!("History worker for {scope} exiting");
}

/// Serialises history operations per scope. Cheap to clone; clones share
/// workers.
#[derive(Clone)]
pub struct HistoryClient {
    backend: Arc<dyn HistoryBackend>,
    workers: Arc<Mutex<HashMap<HistoryScope, mpsc::UnboundedSender<HistoryRequest>>>>,
}

impl HistoryClient {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            backend,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn worker(&self, scope: &HistoryScope) -> mpsc::UnboundedSender<HistoryRequest> {
        let mut workers = self.workers.lock();
        if let Some(tx) = workers.get(scope).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(history_worker(scope.clone(), self.backend.clone(), rx));
        workers.insert(scope.clone(), tx.clone());
        tx
    }

    async fn request<T>(
        &self,
        scope: &HistoryScope,
        make_request: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> HistoryRequest,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.worker(scope)
            .send(make_request(tx))
            .map_err(|_| anyhow::anyhow!("History worker for {scope} is gone"))?;
        rx.await
            .with_context(|| format!("History worker for {scope} dropped the request"))?
    }

    pub async fn push(&self, scope: &HistoryScope, snapshot: FilterSnapshot) -> anyhow::Result<()> {
        self.request(scope, |tx| HistoryRequest::Push(snapshot, tx))
            .await
    }

    pub async fn undo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        self.request(scope, |tx| HistoryRequest::Undo(count, tx))
            .await
    }

    pub async fn redo(
        &self,
        scope: &HistoryScope,
        count: usize,
    ) -> anyhow::Result<Option<FilterSnapshot>> {
        self.request(scope, |tx| HistoryRequest::Redo(count, tx))
            .await
    }

    pub async fn status(&self, scope: &HistoryScope) -> anyhow::Result<HistoryStatus> {
        self.request(scope, HistoryRequest::Status).await
    }
}

/// The filter sheet of one table: what is being edited and what is applied.
pub struct TableFilterState {
    scope: HistoryScope,
    history: HistoryClient,
    pub draft: FilterSnapshot,
    applied: FilterSnapshot,
}

impl TableFilterState {
    pub fn new(scope: HistoryScope, history: HistoryClient) -> Self {
        Self {
            scope,
            history,
            draft: FilterSnapshot::default(),
            applied: FilterSnapshot::default(),
        }
    }

    /// Starts from a previously applied state without recording it.
    pub fn restore(&mut self, snapshot: FilterSnapshot) {
        self.draft = snapshot.clone();
        self.applied = snapshot;
    }

    pub fn scope(&self) -> &HistoryScope {
        &self.scope
    }

    pub fn applied(&self) -> &FilterSnapshot {
        &self.applied
    }

    pub fn has_unapplied_edits(&self) -> bool {
        self.draft != self.applied
    }

    /// Records the draft in history and makes it the applied state.
    pub async fn apply(&mut self) -> anyhow::Result<&FilterSnapshot> {
        self.draft.filters.validate()?;
        self.history
            .push(&self.scope, self.draft.clone())
            .await?;
        self.applied = self.draft.clone();
        Ok(&self.applied)
    }

    /// Steps back one entry. Unapplied edits are discarded; stepping past the
    /// first entry leaves the table unfiltered.
    pub async fn undo(&mut self) -> anyhow::Result<&FilterSnapshot> {
        let snapshot = self.history.undo(&self.scope, 1).await?;
        self.restore(snapshot.unwrap_or_default());
        Ok(&self.applied)
    }

    /// Steps forward one entry. At the head nothing changes, unapplied
    /// edits included.
    pub async fn redo(&mut self) -> anyhow::Result<&FilterSnapshot> {
        if let Some(snapshot) = self.history.redo(&self.scope, 1).await? {
            self.restore(snapshot);
        }
        Ok(&self.applied)
    }

    pub async fn status(&self) -> anyhow::Result<HistoryStatus> {
        self.history.status(&self.scope).await
    }
}
