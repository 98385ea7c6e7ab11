//! An in-memory deployment that serves the system functions the browser
//! calls, with knobs for injecting failures and holding queries open.
use std::{
    cmp::Ordering,
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{
    Value as JsonValue,
    json,
};
use tokio::sync::Semaphore;
use value::{
    CREATION_TIME_FIELD,
    DynamicValue,
    ID_FIELD,
    TableDocument,
    TableName,
    sorting::cmp_fields,
};

use crate::{
    filters::{
        self,
        FilterExpression,
        FilterToken,
        IndexSelection,
        Order,
    },
    history::{
        FilterSnapshot,
        ScopeLog,
    },
    rpc::{
        ComponentId,
        DeploymentRpc,
        system_udfs,
    },
    tables::Shape,
};

struct FakeTable {
    number: u32,
    documents: Vec<TableDocument>,
    shape: Option<Shape>,
    indexes: JsonValue,
}

#[derive(Default)]
struct FakeState {
    tables: BTreeMap<TableName, FakeTable>,
    next_table_number: u32,
    next_document: u64,
    queries: Vec<(String, JsonValue)>,
    mutation_count: usize,
    query_failures: VecDeque<ErrorMetadata>,
    mutation_failures: VecDeque<ErrorMetadata>,
    gate: Option<Arc<Semaphore>>,
    history: HashMap<String, ScopeLog>,
}

#[derive(Default)]
pub struct FakeDeployment {
    state: Mutex<FakeState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaginationOpts {
    num_items: usize,
    cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageArgs {
    pagination_opts: PaginationOpts,
    table: String,
    filters: Option<FilterToken>,
}

fn field_error(path: &str, e: impl std::fmt::Display) -> anyhow::Error {
    ErrorMetadata::bad_request("FunctionFailed", format!("Invalid arguments for {path}: {e}"))
        .into()
}

fn parse_args<T: for<'de> Deserialize<'de>>(path: &str, args: JsonValue) -> anyhow::Result<T> {
    serde_json::from_value(args).map_err(|e| field_error(path, e))
}

impl FakeDeployment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) `table` with `documents` in backend JSON form.
    pub fn add_table(&self, table: &str, documents: Vec<JsonValue>) -> anyhow::Result<()> {
        let name: TableName = table.parse()?;
        let documents = documents
            .into_iter()
            .map(|d| TableDocument::from_json(&name, d))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut state = self.state.lock();
        state.next_table_number += 1;
        let number = 10000 + state.next_table_number;
        state.tables.insert(
            name,
            FakeTable {
                number,
                documents,
                shape: None,
                indexes: json!([]),
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        let name: TableName = table.parse()?;
        self.state
            .lock()
            .tables
            .remove(&name)
            .with_context(|| format!("No table {table}"))?;
        Ok(())
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut FakeTable) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let name: TableName = table.parse()?;
        let mut state = self.state.lock();
        let table = state.tables.get_mut(&name).ok_or_else(|| {
            ErrorMetadata::bad_request("FunctionFailed", format!("Table {name} not found"))
        })?;
        f(table)
    }

    pub fn set_shape(&self, table: &str, shape: Shape) -> anyhow::Result<()> {
        self.with_table(table, |t| {
            t.shape = Some(shape);
            Ok(())
        })
    }

    /// Index list exactly as `_system/frontend/indexes` returns it.
    pub fn add_raw_indexes(&self, table: &str, indexes: JsonValue) -> anyhow::Result<()> {
        self.with_table(table, |t| {
            t.indexes = indexes;
            Ok(())
        })
    }

    pub fn document(&self, table: &str, id: &str) -> anyhow::Result<TableDocument> {
        self.with_table(table, |t| {
            t.documents
                .iter()
                .find(|d| d.id().id() == id)
                .cloned()
                .ok_or_else(|| ErrorMetadata::not_found("DocumentNotFound", id.to_string()).into())
        })
    }

    /// Arguments of every paginated documents query, oldest first.
    pub fn page_queries(&self) -> Vec<JsonValue> {
        self.state
            .lock()
            .queries
            .iter()
            .filter(|(path, _)| path == system_udfs::PAGINATED_TABLE_DOCUMENTS)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutation_count
    }

    pub fn fail_next_query(&self, error: ErrorMetadata) {
        self.state.lock().query_failures.push_back(error);
    }

    pub fn fail_next_mutation(&self, error: ErrorMetadata) {
        self.state.lock().mutation_failures.push_back(error);
    }

    /// Makes every subsequent query wait for a permit on the returned
    /// semaphore, which starts with none.
    pub fn pause_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().gate = Some(gate.clone());
        gate
    }

    fn page(&self, args: JsonValue) -> anyhow::Result<JsonValue> {
        let path = system_udfs::PAGINATED_TABLE_DOCUMENTS;
        let args: PageArgs = parse_args(path, args)?;
        let table: TableName = args.table.parse()?;
        let expression = match &args.filters {
            Some(token) => filters::deserialize(token)?,
            None => FilterExpression::default(),
        };
        let token = args.filters.as_ref().map(|t| t.as_str()).unwrap_or("");
        let offset = match &args.pagination_opts.cursor {
            None => 0,
            Some(cursor) => parse_cursor(cursor, &table, token)?,
        };

        let state = self.state.lock();
        let documents = state
            .tables
            .get(&table)
            .map(|t| t.documents.clone())
            .unwrap_or_default();
        drop(state);
        let mut documents: Vec<_> = documents
            .into_iter()
            .filter(|d| expression.matches(d) && matches_search(&expression, d))
            .collect();
        sort_for_expression(&mut documents, &expression);

        let end = (offset + args.pagination_opts.num_items).min(documents.len());
        let page: Vec<_> = documents[offset.min(end)..end]
            .iter()
            .map(|d| d.to_json())
            .collect();
        Ok(json!({
            "page": page,
            "isDone": end >= documents.len(),
            "continueCursor": format!("{table}:{end}:{token}"),
        }))
    }

    fn mutate(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        let mut state = self.state.lock();
        match path {
            system_udfs::PATCH_DOCUMENTS_FIELDS => {
                #[derive(Deserialize)]
                struct Args {
                    table: String,
                    ids: Vec<String>,
                    fields: DynamicValue,
                }
                let args: Args = parse_args(path, args)?;
                let DynamicValue::Object(fields) = args.fields else {
                    return Err(field_error(path, "fields must be an object"));
                };
                let table = state_table(&mut state, &args.table)?;
                for id in &args.ids {
                    let document = table
                        .documents
                        .iter_mut()
                        .find(|d| d.id().id() == id)
                        .ok_or_else(|| field_error(path, format!("no document {id}")))?;
                    document.apply_patch(&fields);
                }
                Ok(JsonValue::Null)
            },
            system_udfs::DELETE_DOCUMENTS => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Target {
                    id: String,
                    table_name: String,
                }
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Args {
                    to_delete: Vec<Target>,
                }
                let args: Args = parse_args(path, args)?;
                for target in args.to_delete {
                    let table = state_table(&mut state, &target.table_name)?;
                    table.documents.retain(|d| d.id().id() != target.id);
                }
                Ok(JsonValue::Null)
            },
            system_udfs::ADD_DOCUMENT => {
                #[derive(Deserialize)]
                struct Args {
                    table: String,
                    documents: Vec<DynamicValue>,
                }
                let args: Args = parse_args(path, args)?;
                let name: TableName = args.table.parse()?;
                let mut ids = vec![];
                for document in args.documents {
                    let DynamicValue::Object(mut fields) = document else {
                        return Err(field_error(path, "documents must be objects"));
                    };
                    state.next_document += 1;
                    let id = format!("new{}", state.next_document);
                    let table = state_table(&mut state, &args.table)?;
                    let creation_time = table
                        .documents
                        .iter()
                        .map(|d| d.creation_time())
                        .fold(0.0, f64::max)
                        + 1.0;
                    fields.insert(ID_FIELD.to_string(), DynamicValue::from(id.as_str()));
                    fields.insert(
                        CREATION_TIME_FIELD.to_string(),
                        DynamicValue::from(creation_time),
                    );
                    table
                        .documents
                        .push(TableDocument::from_fields(&name, fields)?);
                    ids.push(id);
                }
                Ok(json!(ids))
            },
            system_udfs::FILTER_HISTORY_PUSH => {
                #[derive(Deserialize)]
                struct Args {
                    scope: String,
                    state: FilterSnapshot,
                }
                let args: Args = parse_args(path, args)?;
                state
                    .history
                    .entry(args.scope)
                    .or_default()
                    .push(args.state);
                Ok(JsonValue::Null)
            },
            system_udfs::FILTER_HISTORY_UNDO | system_udfs::FILTER_HISTORY_REDO => {
                #[derive(Deserialize)]
                struct Args {
                    scope: String,
                    count: usize,
                }
                let args: Args = parse_args(path, args)?;
                let log = state.history.entry(args.scope).or_default();
                let snapshot = if path == system_udfs::FILTER_HISTORY_UNDO {
                    log.undo(args.count)
                } else {
                    log.redo(args.count)
                };
                Ok(serde_json::to_value(snapshot)?)
            },
            _ => Err(field_error(path, "unknown mutation")),
        }
    }

    fn read(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        match path {
            system_udfs::PAGINATED_TABLE_DOCUMENTS => self.page(args),
            system_udfs::GET_TABLE_MAPPING => {
                let state = self.state.lock();
                let mapping: serde_json::Map<_, _> = state
                    .tables
                    .iter()
                    .map(|(name, t)| (t.number.to_string(), json!(name.to_string())))
                    .collect();
                Ok(JsonValue::Object(mapping))
            },
            system_udfs::INDEXES => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Args {
                    table_name: String,
                }
                let args: Args = parse_args(path, args)?;
                let name: TableName = args.table_name.parse()?;
                Ok(self
                    .state
                    .lock()
                    .tables
                    .get(&name)
                    .map(|t| t.indexes.clone())
                    .unwrap_or(JsonValue::Null))
            },
            system_udfs::FILTER_HISTORY_STATUS => {
                #[derive(Deserialize)]
                struct Args {
                    scope: String,
                }
                let args: Args = parse_args(path, args)?;
                let status = self
                    .state
                    .lock()
                    .history
                    .get(&args.scope)
                    .map(ScopeLog::status)
                    .unwrap_or_default();
                Ok(serde_json::to_value(status)?)
            },
            _ => Err(field_error(path, "unknown query")),
        }
    }
}

fn state_table<'a>(state: &'a mut FakeState, table: &str) -> anyhow::Result<&'a mut FakeTable> {
    let name: TableName = table.parse()?;
    state.tables.get_mut(&name).ok_or_else(|| {
        ErrorMetadata::bad_request("FunctionFailed", format!("Table {name} not found")).into()
    })
}

/// Cursors are `{table}:{offset}:{filter token}` and only valid for the
/// query that issued them.
fn parse_cursor(cursor: &str, table: &TableName, token: &str) -> anyhow::Result<usize> {
    let invalid = || ErrorMetadata::bad_request("InvalidCursor", format!("Invalid cursor {cursor}"));
    let mut parts = cursor.splitn(3, ':');
    let (Some(cursor_table), Some(offset), Some(cursor_token)) =
        (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!(invalid());
    };
    if cursor_table != &**table || cursor_token != token {
        anyhow::bail!(invalid());
    }
    offset.parse().with_context(invalid)
}

fn matches_search(expression: &FilterExpression, document: &TableDocument) -> bool {
    let Some(IndexSelection::Search(search)) = &expression.index else {
        return true;
    };
    let terms: Vec<String> = search
        .search
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    document.fields().values().any(|value| match value {
        DynamicValue::String(s) => {
            let s = s.to_lowercase();
            terms.iter().any(|t| s.contains(t.as_str()))
        },
        _ => false,
    })
}

/// Index order (index fields then creation time) when a database index is
/// selected, creation time otherwise.
fn sort_for_expression(documents: &mut [TableDocument], expression: &FilterExpression) {
    let mut fields: Vec<String> = match &expression.index {
        Some(IndexSelection::Database(index)) => {
            let mut fields = vec![];
            for clause in &index.clauses {
                if !fields.iter().any(|f| f == clause.field()) {
                    fields.push(clause.field().to_string());
                }
            }
            fields
        },
        _ => vec![],
    };
    fields.push(CREATION_TIME_FIELD.to_string());
    documents.sort_by(|a, b| {
        let ordering = fields
            .iter()
            .map(|f| cmp_fields(a.get_path(f), b.get_path(f)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.id().cmp(b.id()));
        match expression.order_or_default() {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        }
    });
}

#[async_trait]
impl DeploymentRpc for FakeDeployment {
    async fn query(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        let gate = {
            let mut state = self.state.lock();
            state.queries.push((path.to_string(), args.clone()));
            state.gate.clone()
        };
        if let Some(gate) = gate {
            gate.acquire().await?;
        }
        // Failures queued while a query waits on the gate apply to it.
        if let Some(e) = self.state.lock().query_failures.pop_front() {
            return Err(e.into());
        }
        self.read(path, args)
    }

    async fn mutation(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        {
            let mut state = self.state.lock();
            state.mutation_count += 1;
            if let Some(e) = state.mutation_failures.pop_front() {
                return Err(e.into());
            }
        }
        self.mutate(path, args)
    }

    async fn shapes(&self, _component: Option<&ComponentId>) -> anyhow::Result<JsonValue> {
        let state = self.state.lock();
        let mut shapes = serde_json::Map::new();
        for (name, table) in &state.tables {
            if let Some(shape) = &table.shape {
                shapes.insert(name.to_string(), serde_json::to_value(shape)?);
            }
        }
        Ok(JsonValue::Object(shapes))
    }
}
