use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde_json::Value as JsonValue;

use crate::{
    DynamicValue,
    TableName,
};

pub const ID_FIELD: &str = "_id";
pub const CREATION_TIME_FIELD: &str = "_creationTime";

/// Reference to a document in a table. The `id` part is opaque to the client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId {
    table: TableName,
    id: String,
}

impl DocumentId {
    pub fn new(table: TableName, id: impl Into<String>) -> Self {
        Self {
            table,
            id: id.into(),
        }
    }

    /// Validates a user-supplied id string for `table`.
    pub fn parse(table: &TableName, id: &str) -> anyhow::Result<Self> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidId",
                format!("Invalid document id for table {table}: {id:?}")
            ));
        }
        Ok(Self::new(table.clone(), id))
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// Ids sort among strings by their text, so the text has to come first here
// too for the order to stay transitive.
impl Ord for DocumentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.table.cmp(&other.table))
    }
}

impl PartialOrd for DocumentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A document as returned by the deployment: arbitrary fields plus the
/// system fields `_id` and `_creationTime`, which are always present.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableDocument {
    id: DocumentId,
    fields: BTreeMap<String, DynamicValue>,
}

impl TableDocument {
    /// Builds a document from backend JSON, re-typing `_id` as an id of
    /// `table`.
    pub fn from_json(table: &TableName, json: JsonValue) -> anyhow::Result<Self> {
        let DynamicValue::Object(fields) = DynamicValue::try_from(json)
            .with_context(|| format!("Invalid document in table {table}"))?
        else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidDocument",
                format!("Document in table {table} is not an object")
            ));
        };
        Self::from_fields(table, fields)
    }

    pub fn from_fields(
        table: &TableName,
        mut fields: BTreeMap<String, DynamicValue>,
    ) -> anyhow::Result<Self> {
        let id = match fields.get(ID_FIELD) {
            Some(DynamicValue::String(s)) => DocumentId::parse(table, s)?,
            Some(DynamicValue::Id(id)) => id.clone(),
            _ => anyhow::bail!(ErrorMetadata::bad_request(
                "MissingId",
                format!("Document in table {table} has no {ID_FIELD}")
            )),
        };
        match fields.get(CREATION_TIME_FIELD) {
            Some(DynamicValue::Float64(_)) => {},
            Some(DynamicValue::Int64(n)) => {
                let n = *n as f64;
                fields.insert(CREATION_TIME_FIELD.to_string(), DynamicValue::Float64(n));
            },
            _ => anyhow::bail!(ErrorMetadata::bad_request(
                "MissingCreationTime",
                format!("Document {id} in table {table} has no numeric {CREATION_TIME_FIELD}")
            )),
        }
        fields.insert(ID_FIELD.to_string(), DynamicValue::Id(id.clone()));
        Ok(Self { id, fields })
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn creation_time(&self) -> f64 {
        match self.fields.get(CREATION_TIME_FIELD) {
            Some(DynamicValue::Float64(t)) => *t,
            _ => 0.0,
        }
    }

    pub fn get(&self, field: &str) -> Option<&DynamicValue> {
        self.fields.get(field)
    }

    /// Looks up a dotted field path such as `address.city`.
    pub fn get_path(&self, path: &str) -> Option<&DynamicValue> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let value = self.fields.get(head)?;
        match rest {
            Some(rest) => value.get_path(rest),
            None => Some(value),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, DynamicValue> {
        &self.fields
    }

    /// Overwrites user fields. System fields are left untouched; callers
    /// reject edits to them before reaching this point.
    pub fn apply_patch(&mut self, patch: &BTreeMap<String, DynamicValue>) {
        for (field, value) in patch {
            if field.starts_with('_') {
                continue;
            }
            self.fields.insert(field.clone(), value.clone());
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::from(DynamicValue::Object(self.fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::TableDocument;
    use crate::{
        DocumentId,
        DynamicValue,
        TableName,
        dyn_obj,
    };

    #[test]
    fn test_from_json_retypes_id() -> anyhow::Result<()> {
        let users: TableName = "users".parse()?;
        let doc = TableDocument::from_json(
            &users,
            json!({"_id": "k57abc", "_creationTime": 1700000000000.0, "age": 30.0}),
        )?;
        assert_eq!(doc.id(), &DocumentId::new(users.clone(), "k57abc"));
        assert_eq!(
            doc.get("_id"),
            Some(&DynamicValue::Id(DocumentId::new(users, "k57abc")))
        );
        assert_eq!(doc.creation_time(), 1700000000000.0);
        assert_eq!(
            doc.to_json(),
            json!({"_id": "k57abc", "_creationTime": 1700000000000.0, "age": 30.0})
        );
        Ok(())
    }

    #[test]
    fn test_system_fields_required() -> anyhow::Result<()> {
        let users: TableName = "users".parse()?;
        let err = TableDocument::from_json(&users, json!({"_creationTime": 1.0})).unwrap_err();
        assert!(err.is_bad_request());
        let err = TableDocument::from_json(&users, json!({"_id": "abc"})).unwrap_err();
        assert!(err.is_bad_request());
        let err = TableDocument::from_json(&users, json!([1, 2])).unwrap_err();
        assert!(err.is_bad_request());
        Ok(())
    }

    #[test]
    fn test_apply_patch_skips_system_fields() -> anyhow::Result<()> {
        let users: TableName = "users".parse()?;
        let mut doc =
            TableDocument::from_json(&users, json!({"_id": "a1", "_creationTime": 1.0}))?;
        let DynamicValue::Object(patch) = dyn_obj!("_id" => "b2", "name" => "Ada") else {
            unreachable!()
        };
        doc.apply_patch(&patch);
        assert_eq!(doc.id().id(), "a1");
        assert_eq!(doc.get_path("name"), Some(&DynamicValue::from("Ada")));
        Ok(())
    }
}
