use common::local_store::{
    LocalStore,
    StoreKey,
};
use serde::{
    Deserialize,
    Serialize,
};
use value::TableName;

use crate::filters::{
    FilterExpression,
    SortConfig,
};

/// How a table was last displayed on this machine, restored when the table
/// is opened again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableViewSettings {
    #[serde(default)]
    pub filters: FilterExpression,
    #[serde(default)]
    pub sort: Option<SortConfig>,
    /// Column order; `None` shows every field of the shape.
    #[serde(default)]
    pub visible_fields: Option<Vec<String>>,
}

impl TableViewSettings {
    fn key(deployment: &str, table: &TableName) -> StoreKey {
        StoreKey::TableView {
            deployment: deployment.to_string(),
            table: table.to_string(),
        }
    }

    pub fn load(
        store: &LocalStore,
        deployment: &str,
        table: &TableName,
    ) -> anyhow::Result<Self> {
        Ok(store
            .get_json(&Self::key(deployment, table))?
            .unwrap_or_default())
    }

    pub fn save(
        &self,
        store: &LocalStore,
        deployment: &str,
        table: &TableName,
    ) -> anyhow::Result<()> {
        store.set_json(&Self::key(deployment, table), self)
    }

    pub fn clear(store: &LocalStore, deployment: &str, table: &TableName) -> anyhow::Result<()> {
        store.remove(&Self::key(deployment, table))
    }
}

#[cfg(test)]
mod tests {
    use common::local_store::LocalStore;
    use pretty_assertions::assert_eq;

    use super::TableViewSettings;
    use crate::filters::{
        FilterClause,
        FilterExpression,
        FilterOp,
        Order,
        SortConfig,
    };

    #[test]
    fn test_settings_are_per_deployment_and_table() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        let users = "users".parse()?;
        let settings = TableViewSettings {
            filters: FilterExpression::new(vec![FilterClause::new("age", FilterOp::Lt, 30.0)]),
            sort: Some(SortConfig::new("name", Order::Desc)),
            visible_fields: Some(vec!["name".into(), "age".into()]),
        };
        settings.save(&store, "happy-otter-123", &users)?;

        assert_eq!(TableViewSettings::load(&store, "happy-otter-123", &users)?, settings);
        assert_eq!(
            TableViewSettings::load(&store, "sad-badger-456", &users)?,
            TableViewSettings::default()
        );
        assert_eq!(
            TableViewSettings::load(&store, "happy-otter-123", &"posts".parse()?)?,
            TableViewSettings::default()
        );

        TableViewSettings::clear(&store, "happy-otter-123", &users)?;
        assert_eq!(
            TableViewSettings::load(&store, "happy-otter-123", &users)?,
            TableViewSettings::default()
        );
        Ok(())
    }
}
