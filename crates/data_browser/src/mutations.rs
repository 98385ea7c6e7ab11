//! Document edits. Changes are sent to the deployment first; the page cache
//! is only touched once the deployment accepted them.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use errors::ErrorMetadata;
use serde_json::{
    Value as JsonValue,
    json,
};
use value::{
    DocumentId,
    DynamicValue,
    TableName,
};

use crate::{
    banner::ErrorBanner,
    pagination::{
        DocumentFetcher,
        SharedPageCache,
    },
    rpc::{
        ComponentId,
        DeploymentRpc,
        component_arg,
        system_udfs,
    },
    tables::{
        Shape,
        validate_field_edit,
    },
};

/// User-supplied field names may not touch system fields or use the
/// reserved `$` prefix.
fn check_user_field(field: &str) -> anyhow::Result<()> {
    if field.is_empty() {
        anyhow::bail!(ErrorMetadata::bad_request(
            "EmptyFieldName",
            "Field names cannot be empty"
        ));
    }
    if field.starts_with('_') {
        anyhow::bail!(ErrorMetadata::bad_request(
            "SystemFieldImmutable",
            format!("{field} is a system field and cannot be edited")
        ));
    }
    if field.starts_with('$') {
        anyhow::bail!(ErrorMetadata::bad_request(
            "ReservedFieldName",
            format!("Field name {field} starts with a '$', which is reserved")
        ));
    }
    Ok(())
}

fn fields_json(fields: &BTreeMap<String, DynamicValue>) -> anyhow::Result<JsonValue> {
    let mut out = serde_json::Map::new();
    for (field, value) in fields {
        check_user_field(field)?;
        out.insert(field.clone(), value.to_json());
    }
    Ok(JsonValue::Object(out))
}

fn parse_ids(table: &TableName, ids: &[&str]) -> anyhow::Result<Vec<DocumentId>> {
    if ids.is_empty() {
        anyhow::bail!(ErrorMetadata::bad_request(
            "NoDocumentsSelected",
            "Select at least one document"
        ));
    }
    ids.iter().map(|id| DocumentId::parse(table, id)).collect()
}

pub struct DocumentMutator<R: DeploymentRpc> {
    rpc: Arc<R>,
    cache: SharedPageCache,
    banner: ErrorBanner,
}

impl<R: DeploymentRpc> DocumentMutator<R> {
    pub fn new(rpc: Arc<R>, cache: SharedPageCache, banner: ErrorBanner) -> Self {
        Self { rpc, cache, banner }
    }

    /// A mutator that keeps `fetcher`'s pages in sync.
    pub fn for_fetcher(fetcher: &DocumentFetcher<R>) -> Self {
        Self::new(
            fetcher.rpc().clone(),
            fetcher.cache().clone(),
            fetcher.banner().clone(),
        )
    }

    fn surface<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &result {
            self.banner.report(e);
        }
        result
    }

    /// Sets `fields` on every document in `ids` with a single call. Cached
    /// pages are rewritten in place; documents that stop matching their
    /// page's filter are dropped from it.
    pub async fn patch(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        ids: &[&str],
        fields: BTreeMap<String, DynamicValue>,
    ) -> anyhow::Result<()> {
        let result = self.patch_inner(table, component, ids, fields).await;
        self.surface(result)
    }

    async fn patch_inner(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        ids: &[&str],
        fields: BTreeMap<String, DynamicValue>,
    ) -> anyhow::Result<()> {
        let ids = parse_ids(table, ids)?;
        let args = json!({
            "table": &**table,
            "componentId": component_arg(component),
            "ids": ids.iter().map(|id| id.id()).collect::<Vec<_>>(),
            "fields": fields_json(&fields)?,
        });
        self.rpc
            .mutation(system_udfs::PATCH_DOCUMENTS_FIELDS, args)
            .await?;
        tracing::info!("Patched {} document(s) in {table}", ids.len());
        self.cache.lock().apply_patch(table, &ids, &fields);
        Ok(())
    }

    /// An inline edit of one field, checked against the table's shape when
    /// one is known.
    pub async fn edit_field(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        id: &str,
        field: &str,
        value: DynamicValue,
        shape: Option<&Shape>,
    ) -> anyhow::Result<()> {
        if let Some(field_shape) = shape.and_then(|s| s.field_shape(field)) {
            let checked = validate_field_edit(field_shape, &value);
            self.surface(checked)?;
        }
        self.patch(
            table,
            component,
            &[id],
            BTreeMap::from([(field.to_string(), value)]),
        )
        .await
    }

    pub async fn delete(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        ids: &[&str],
    ) -> anyhow::Result<()> {
        let result = self.delete_inner(table, component, ids).await;
        self.surface(result)
    }

    async fn delete_inner(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        ids: &[&str],
    ) -> anyhow::Result<()> {
        let ids = parse_ids(table, ids)?;
        let to_delete: Vec<_> = ids
            .iter()
            .map(|id| json!({"id": id.id(), "tableName": &**table}))
            .collect();
        self.rpc
            .mutation(
                system_udfs::DELETE_DOCUMENTS,
                json!({"toDelete": to_delete, "componentId": component_arg(component)}),
            )
            .await?;
        tracing::info!("Deleted {} document(s) from {table}", ids.len());
        self.cache.lock().remove_documents(table, &ids);
        Ok(())
    }

    /// Inserts a document. Every cached view of the table starts over from
    /// its first page, since the new document's position is unknown.
    pub async fn add(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        document: BTreeMap<String, DynamicValue>,
    ) -> anyhow::Result<()> {
        let result = self.add_inner(table, component, document).await;
        self.surface(result)
    }

    async fn add_inner(
        &self,
        table: &TableName,
        component: Option<&ComponentId>,
        document: BTreeMap<String, DynamicValue>,
    ) -> anyhow::Result<()> {
        let args = json!({
            "table": &**table,
            "documents": [fields_json(&document)?],
            "componentId": component_arg(component),
        });
        self.rpc.mutation(system_udfs::ADD_DOCUMENT, args).await?;
        tracing::info!("Added a document to {table}");
        self.cache.lock().invalidate_table(table);
        Ok(())
    }
}
