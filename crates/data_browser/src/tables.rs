//! Table list, inferred table shapes and index listing for a deployment.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Context;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Value as JsonValue,
    json,
};
use value::{
    DynamicValue,
    TableName,
};

use crate::rpc::{
    ComponentId,
    DeploymentRpc,
    component_arg,
    system_udfs,
};

/// Inferred shape of a table or field, in the format of `/api/shapes2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Shape {
    /// Still being computed by the deployment; accepts anything.
    Unknown,
    /// The table is empty.
    Never,
    #[serde(rename_all = "camelCase")]
    Id {
        table_name: String,
    },
    Null,
    Int64,
    #[serde(rename_all = "camelCase")]
    Float64 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        float64_range: Option<JsonValue>,
    },
    Boolean,
    String,
    Bytes,
    Object {
        fields: Vec<ObjectFieldShape>,
    },
    #[serde(rename_all = "camelCase")]
    Record {
        key_shape: Box<Shape>,
        value_shape: RecordValueShape,
    },
    Array {
        shape: Box<Shape>,
    },
    Set {
        shape: Box<Shape>,
    },
    #[serde(rename_all = "camelCase")]
    Map {
        key_shape: Box<Shape>,
        value_shape: Box<Shape>,
    },
    Union {
        shapes: Vec<Shape>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFieldShape {
    pub field_name: String,
    pub optional: bool,
    pub shape: Shape,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordValueShape {
    pub optional: bool,
    pub shape: Box<Shape>,
}

impl Shape {
    /// Does `value` fit this shape? Sets and maps are legacy types that no
    /// editable value can have.
    pub fn accepts(&self, value: &DynamicValue) -> bool {
        match (self, value) {
            (Shape::Unknown, _) => true,
            (Shape::Never, _) => false,
            (Shape::Null, DynamicValue::Null) => true,
            (Shape::Int64, DynamicValue::Int64(_)) => true,
            (Shape::Float64 { .. }, DynamicValue::Float64(_)) => true,
            (Shape::Boolean, DynamicValue::Boolean(_)) => true,
            (Shape::String, DynamicValue::String(_) | DynamicValue::Id(_)) => true,
            (Shape::Bytes, DynamicValue::Bytes(_)) => true,
            (Shape::Id { table_name }, DynamicValue::Id(id)) => &**id.table() == table_name,
            // A typed-in id cannot be checked against its table client-side.
            (Shape::Id { .. }, DynamicValue::String(_)) => true,
            (Shape::Array { shape }, DynamicValue::Array(elements)) => {
                elements.iter().all(|e| shape.accepts(e))
            },
            (Shape::Object { fields }, DynamicValue::Object(object)) => {
                let required_present = fields
                    .iter()
                    .filter(|f| !f.optional)
                    .all(|f| object.contains_key(&f.field_name));
                let all_known = object.iter().all(|(name, v)| {
                    fields
                        .iter()
                        .find(|f| &f.field_name == name)
                        .is_some_and(|f| f.shape.accepts(v))
                });
                required_present && all_known
            },
            (
                Shape::Record {
                    key_shape,
                    value_shape,
                },
                DynamicValue::Object(object),
            ) => object.iter().all(|(k, v)| {
                key_shape.accepts(&DynamicValue::String(k.clone())) && value_shape.shape.accepts(v)
            }),
            (Shape::Union { shapes }, v) => shapes.iter().any(|s| s.accepts(v)),
            _ => false,
        }
    }

    /// Shape of a top-level field of a document shape.
    pub fn field_shape(&self, field: &str) -> Option<&Shape> {
        match self {
            Shape::Object { fields } => fields
                .iter()
                .find(|f| f.field_name == field)
                .map(|f| &f.shape),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Shape::Unknown => "any".into(),
            Shape::Never => "never".into(),
            Shape::Id { table_name } => format!("Id<{table_name}>"),
            Shape::Null => "null".into(),
            Shape::Int64 => "bigint".into(),
            Shape::Float64 { .. } => "number".into(),
            Shape::Boolean => "boolean".into(),
            Shape::String => "string".into(),
            Shape::Bytes => "bytes".into(),
            Shape::Object { .. } => "object".into(),
            Shape::Record { .. } => "record".into(),
            Shape::Array { shape } => format!("Array<{}>", shape.describe()),
            Shape::Set { shape } => format!("Set<{}>", shape.describe()),
            Shape::Map { .. } => "map".into(),
            Shape::Union { shapes } => shapes
                .iter()
                .map(|s| s.describe())
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

/// Checks an inline edit against the inferred shape of the edited field.
pub fn validate_field_edit(shape: &Shape, value: &DynamicValue) -> anyhow::Result<()> {
    if !shape.accepts(value) {
        anyhow::bail!(ErrorMetadata::bad_request(
            "TypeMismatch",
            format!(
                "Expected {}, got {} {value}",
                shape.describe(),
                value.type_name()
            )
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexKind {
    Database {
        fields: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Search {
        search_field: String,
        filter_fields: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Vector {
        vector_field: String,
        dimensions: u32,
        filter_fields: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub table: TableName,
    pub name: String,
    pub kind: IndexKind,
    /// `None` once the index is ready to serve queries.
    pub backfill_state: Option<String>,
}

#[derive(Deserialize)]
struct IndexJson {
    name: String,
    fields: JsonValue,
    #[serde(default)]
    backfill: Option<BackfillJson>,
}

#[derive(Deserialize)]
struct BackfillJson {
    state: String,
}

fn parse_index(table: &TableName, index: IndexJson) -> anyhow::Result<IndexDescriptor> {
    let kind = match index.fields {
        JsonValue::Array(_) => IndexKind::Database {
            fields: serde_json::from_value(index.fields)?,
        },
        fields => serde_json::from_value(fields)
            .with_context(|| format!("Unrecognized index definition for {}", index.name))?,
    };
    Ok(IndexDescriptor {
        table: table.clone(),
        name: index.name,
        kind,
        backfill_state: index
            .backfill
            .map(|b| b.state)
            .filter(|s| s != "done"),
    })
}

/// Lists the indexes defined on `table`.
pub async fn list_indexes<R: DeploymentRpc>(
    rpc: &R,
    table: &TableName,
    component: Option<&ComponentId>,
) -> anyhow::Result<Vec<IndexDescriptor>> {
    let result = rpc
        .query(
            system_udfs::INDEXES,
            json!({"tableName": &**table, "tableNamespace": component_arg(component)}),
        )
        .await?;
    let indexes: Vec<IndexJson> = match result {
        JsonValue::Null => vec![],
        other => serde_json::from_value(other).context("Unexpected index list")?,
    };
    indexes
        .into_iter()
        .map(|index| parse_index(table, index))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableSchema {
    pub name: TableName,
    /// `None` when the shape has not been computed yet.
    pub shape: Option<Shape>,
}

struct TablesState {
    tables: BTreeMap<TableName, TableSchema>,
    selected: Option<TableName>,
}

/// Cached table list plus shapes for one deployment component, and the
/// currently selected table.
pub struct TablesCache<R: DeploymentRpc> {
    rpc: Arc<R>,
    component: Option<ComponentId>,
    state: Mutex<TablesState>,
}

impl<R: DeploymentRpc> TablesCache<R> {
    pub fn new(rpc: Arc<R>, component: Option<ComponentId>) -> Self {
        Self {
            rpc,
            component,
            state: Mutex::new(TablesState {
                tables: BTreeMap::new(),
                selected: None,
            }),
        }
    }

    /// Refetches table names and shapes and replaces the cached schema map.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let component = self.component.as_ref();
        let (mapping, shapes) = futures::try_join!(
            self.rpc.query(
                system_udfs::GET_TABLE_MAPPING,
                json!({"componentId": component_arg(component)})
            ),
            self.rpc.shapes(component),
        )?;

        let mut tables = BTreeMap::new();
        let mapping: BTreeMap<String, String> =
            serde_json::from_value(mapping).context("Unexpected table mapping")?;
        for name in mapping.into_values() {
            match name.parse::<TableName>() {
                Ok(name) => {
                    tables.insert(name.clone(), TableSchema { name, shape: None });
                },
                Err(e) => tracing::warn!("Skipping table with invalid name {name:?}: {e}"),
            }
        }
        let shapes: BTreeMap<String, JsonValue> =
            serde_json::from_value(shapes).context("Unexpected shapes response")?;
        for (name, shape_json) in shapes {
            let Ok(name) = name.parse::<TableName>() else {
                continue;
            };
            let shape = match serde_json::from_value::<Shape>(shape_json) {
                Ok(shape) => Some(shape),
                Err(e) => {
                    tracing::warn!("Ignoring unparseable shape for {name}: {e}");
                    None
                },
            };
            tables
                .entry(name.clone())
                .or_insert(TableSchema { name, shape: None })
                .shape = shape;
        }
        tracing::debug!("Loaded {} tables", tables.len());
        self.state.lock().tables = tables;
        Ok(())
    }

    pub fn tables(&self) -> Vec<TableSchema> {
        self.state.lock().tables.values().cloned().collect()
    }

    pub fn table(&self, name: &TableName) -> Option<TableSchema> {
        self.state.lock().tables.get(name).cloned()
    }

    pub fn selected(&self) -> Option<TableName> {
        self.state.lock().selected.clone()
    }

    pub fn select(&self, table: TableName) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(&table) {
            anyhow::bail!(ErrorMetadata::not_found(
                "TableNotFound",
                format!("Table {table} does not exist")
            ));
        }
        state.selected = Some(table);
        Ok(())
    }

    /// Picks the table to show: the current selection if it still exists,
    /// else `preferred` (usually the persisted last table), else the first
    /// user table, else the first table of any kind.
    pub fn auto_select(&self, preferred: Option<&TableName>) -> Option<TableName> {
        let mut state = self.state.lock();
        let tables = &state.tables;
        let choice = state
            .selected
            .clone()
            .filter(|t| tables.contains_key(t))
            .or_else(|| preferred.filter(|t| tables.contains_key(*t)).cloned())
            .or_else(|| tables.keys().find(|t| !t.is_system()).cloned())
            .or_else(|| tables.keys().next().cloned());
        state.selected = choice.clone();
        choice
    }

    pub async fn indexes(&self, table: &TableName) -> anyhow::Result<Vec<IndexDescriptor>> {
        list_indexes(&*self.rpc, table, self.component.as_ref()).await
    }
}
