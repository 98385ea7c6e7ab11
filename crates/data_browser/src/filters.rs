//! Filter and sort expressions for a table view.
//!
//! A [`FilterExpression`] is what the user edits in the filter sheet. Its
//! wire form (disabled clauses dropped) is JSON, base64 encoded into a
//! [`FilterToken`] that the paginated documents query takes as its `filters`
//! argument.
use std::{
    cmp::Ordering,
    fmt,
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use value::{
    CREATION_TIME_FIELD,
    DynamicValue,
    TableDocument,
    sorting::cmp_fields,
};

use crate::tables::{
    IndexDescriptor,
    IndexKind,
};

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// The field's type name equals the clause value.
    #[serde(rename = "type")]
    #[strum(serialize = "type")]
    IsType,
    #[serde(rename = "notype")]
    #[strum(serialize = "notype")]
    IsNotType,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterClause {
    /// Identifies the row in the filter sheet. Not part of the wire form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub field: String,
    pub op: FilterOp,
    pub value: DynamicValue,
    pub enabled: bool,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<DynamicValue>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            field: field.into(),
            op,
            value: value.into(),
            enabled: true,
        }
    }

    pub fn disabled(self) -> Self {
        Self {
            enabled: false,
            ..self
        }
    }

    pub fn matches(&self, document: &TableDocument) -> bool {
        let field = document.get_path(&self.field);
        match self.op {
            FilterOp::Eq => field == Some(&self.value),
            FilterOp::Neq => field != Some(&self.value),
            FilterOp::Gt => cmp_fields(field, Some(&self.value)) == Ordering::Greater,
            FilterOp::Gte => cmp_fields(field, Some(&self.value)) != Ordering::Less,
            FilterOp::Lt => cmp_fields(field, Some(&self.value)) == Ordering::Less,
            FilterOp::Lte => cmp_fields(field, Some(&self.value)) != Ordering::Greater,
            FilterOp::IsType => is_type(field, &self.value),
            FilterOp::IsNotType => !is_type(field, &self.value),
        }
    }
}

/// Type name of a possibly-missing field, as compared by `type` filters.
pub fn field_type_name(field: Option<&DynamicValue>) -> &'static str {
    field.map_or("undefined", |v| v.type_name())
}

fn is_type(field: Option<&DynamicValue>, expected: &DynamicValue) -> bool {
    match expected {
        DynamicValue::String(name) => field_type_name(field) == name,
        _ => false,
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeBound {
    pub value: DynamicValue,
    pub inclusive: bool,
}

/// One constraint on an index field.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexFilterClause {
    Eq {
        field: String,
        value: DynamicValue,
        enabled: bool,
    },
    Range {
        field: String,
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
        enabled: bool,
    },
}

impl IndexFilterClause {
    pub fn field(&self) -> &str {
        match self {
            IndexFilterClause::Eq { field, .. } | IndexFilterClause::Range { field, .. } => field,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            IndexFilterClause::Eq { enabled, .. } | IndexFilterClause::Range { enabled, .. } => {
                *enabled
            },
        }
    }

    pub fn matches(&self, document: &TableDocument) -> bool {
        let field = document.get_path(self.field());
        match self {
            IndexFilterClause::Eq { value, .. } => field == Some(value),
            IndexFilterClause::Range { lower, upper, .. } => {
                let above_lower = lower.as_ref().is_none_or(|b| {
                    match cmp_fields(field, Some(&b.value)) {
                        Ordering::Greater => true,
                        Ordering::Equal => b.inclusive,
                        Ordering::Less => false,
                    }
                });
                let below_upper = upper.as_ref().is_none_or(|b| {
                    match cmp_fields(field, Some(&b.value)) {
                        Ordering::Less => true,
                        Ordering::Equal => b.inclusive,
                        Ordering::Greater => false,
                    }
                });
                above_lower && below_upper
            },
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexFilter {
    pub name: String,
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(strategy = "proptest::collection::vec(proptest::arbitrary::any::<IndexFilterClause>(), 0..3)")
    )]
    pub clauses: Vec<IndexFilterClause>,
}

impl IndexFilter {
    /// Checks the enabled clauses form a valid index range: equality
    /// constraints on a prefix of the index fields, optionally followed by a
    /// single range constraint on the next field.
    pub fn validate(&self, index: &IndexDescriptor) -> anyhow::Result<()> {
        let IndexKind::Database { fields } = &index.kind else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NotADatabaseIndex",
                format!("{} is not a database index", index.name)
            ));
        };
        let mut index_fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        if index_fields.last() != Some(&CREATION_TIME_FIELD) {
            index_fields.push(CREATION_TIME_FIELD);
        }
        let enabled: Vec<&IndexFilterClause> = self.clauses.iter().filter(|c| c.enabled()).collect();
        for (i, clause) in enabled.iter().enumerate() {
            let expected = index_fields.get(i).copied();
            if expected != Some(clause.field()) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidIndexRange",
                    match expected {
                        Some(expected) => format!(
                            "Index {} must be filtered on {expected} before {}",
                            index.name,
                            clause.field()
                        ),
                        None => format!(
                            "Index {} has no field left for {}",
                            index.name,
                            clause.field()
                        ),
                    }
                ));
            }
            if matches!(clause, IndexFilterClause::Range { .. }) && i + 1 != enabled.len() {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidIndexRange",
                    format!(
                        "Only the last filtered field of index {} may use a range",
                        index.name
                    )
                ));
            }
        }
        Ok(())
    }
}

/// Equality constraint on a search index filter field.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilterClause {
    pub field: String,
    pub value: DynamicValue,
    pub enabled: bool,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchIndexFilter {
    pub name: String,
    pub search: String,
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(strategy = "proptest::collection::vec(proptest::arbitrary::any::<SearchFilterClause>(), 0..3)")
    )]
    pub clauses: Vec<SearchFilterClause>,
}

impl SearchIndexFilter {
    pub fn validate(&self, index: &IndexDescriptor) -> anyhow::Result<()> {
        let IndexKind::Search { filter_fields, .. } = &index.kind else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NotASearchIndex",
                format!("{} is not a search index", index.name)
            ));
        };
        if self.search.trim().is_empty() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "EmptySearch",
                "Enter text to search for"
            ));
        }
        for clause in self.clauses.iter().filter(|c| c.enabled) {
            if !filter_fields.contains(&clause.field) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidSearchFilter",
                    format!(
                        "{} is not a filter field of search index {}",
                        clause.field, index.name
                    )
                ));
            }
        }
        Ok(())
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexSelection {
    Database(IndexFilter),
    Search(SearchIndexFilter),
}

impl IndexSelection {
    pub fn name(&self) -> &str {
        match self {
            IndexSelection::Database(f) => &f.name,
            IndexSelection::Search(f) => &f.name,
        }
    }

    pub fn validate(&self, index: &IndexDescriptor) -> anyhow::Result<()> {
        match self {
            IndexSelection::Database(f) => f.validate(index),
            IndexSelection::Search(f) => f.validate(index),
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterExpression {
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(strategy = "proptest::collection::vec(proptest::arbitrary::any::<FilterClause>(), 0..4)")
    )]
    pub clauses: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexSelection>,
}

/// Opaque, URL-unsafe base64 of a [`FilterExpression`]'s wire form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterToken(String);

impl FilterToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FilterToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for FilterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FilterExpression {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self {
            clauses,
            order: None,
            index: None,
        }
    }

    pub fn with_order(self, order: Order) -> Self {
        Self {
            order: Some(order),
            ..self
        }
    }

    pub fn with_index(self, index: IndexSelection) -> Self {
        Self {
            index: Some(index),
            ..self
        }
    }

    /// The expression sent to the deployment: disabled clauses are dropped,
    /// everywhere they can appear, and clause ids are cleared.
    pub fn wire_form(&self) -> FilterExpression {
        let index = self.index.as_ref().map(|index| match index {
            IndexSelection::Database(f) => IndexSelection::Database(IndexFilter {
                name: f.name.clone(),
                clauses: f.clauses.iter().filter(|c| c.enabled()).cloned().collect(),
            }),
            IndexSelection::Search(f) => IndexSelection::Search(SearchIndexFilter {
                name: f.name.clone(),
                search: f.search.clone(),
                clauses: f.clauses.iter().filter(|c| c.enabled).cloned().collect(),
            }),
        });
        FilterExpression {
            clauses: self
                .clauses
                .iter()
                .filter(|c| c.enabled)
                .map(|c| FilterClause {
                    id: String::new(),
                    ..c.clone()
                })
                .collect(),
            order: self.order,
            index,
        }
    }

    /// No enabled clauses, no index and no explicit order: the table in its
    /// default creation-time order.
    pub fn is_unfiltered(&self) -> bool {
        self.order.is_none() && self.index.is_none() && !self.clauses.iter().any(|c| c.enabled)
    }

    pub fn order_or_default(&self) -> Order {
        self.order.unwrap_or_default()
    }

    /// Evaluates the enabled ad-hoc clauses and index equality/range clauses
    /// against a document. Search relevance is the deployment's business and
    /// is not checked here.
    pub fn matches(&self, document: &TableDocument) -> bool {
        let clauses_match = self
            .clauses
            .iter()
            .filter(|c| c.enabled)
            .all(|c| c.matches(document));
        let index_matches = match &self.index {
            None => true,
            Some(IndexSelection::Database(f)) => f
                .clauses
                .iter()
                .filter(|c| c.enabled())
                .all(|c| c.matches(document)),
            Some(IndexSelection::Search(f)) => f
                .clauses
                .iter()
                .filter(|c| c.enabled)
                .all(|c| document.get_path(&c.field) == Some(&c.value)),
        };
        clauses_match && index_matches
    }

    /// Rejects clauses that can never be evaluated, e.g. a `type` filter
    /// whose value is not a type name.
    pub fn validate(&self) -> anyhow::Result<()> {
        for clause in self.clauses.iter().filter(|c| c.enabled) {
            if clause.field.is_empty() {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "EmptyFilterField",
                    "Choose a field to filter on"
                ));
            }
            if matches!(clause.op, FilterOp::IsType | FilterOp::IsNotType)
                && !matches!(clause.value, DynamicValue::String(_))
            {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidTypeFilter",
                    format!(
                        "Filter on {} expects a type name, got {}",
                        clause.field, clause.value
                    )
                ));
            }
        }
        Ok(())
    }
}

pub fn serialize(expression: &FilterExpression) -> anyhow::Result<FilterToken> {
    let json = serde_json::to_vec(&expression.wire_form())?;
    Ok(FilterToken(base64::encode(json)))
}

pub fn deserialize(token: &FilterToken) -> anyhow::Result<FilterExpression> {
    let invalid = || ErrorMetadata::bad_request("InvalidFilterToken", "Invalid filter token");
    let bytes = base64::decode(token.as_str()).with_context(invalid)?;
    serde_json::from_slice(&bytes).with_context(invalid)
}

/// The `filters` argument of the paginated documents query: `None` when the
/// expression filters nothing.
pub fn wire_token(expression: &FilterExpression) -> anyhow::Result<Option<FilterToken>> {
    if expression.wire_form().is_unfiltered() {
        return Ok(None);
    }
    serialize(expression).map(Some)
}

/// Interprets text typed into a filter value box: JSON if it parses as a
/// value, the raw text otherwise.
pub fn parse_free_text(text: &str) -> DynamicValue {
    serde_json::from_str::<JsonValue>(text)
        .ok()
        .and_then(|json| DynamicValue::try_from(json).ok())
        .unwrap_or_else(|| DynamicValue::String(text.to_string()))
}

/// Client-side sort applied to already fetched documents. Never affects
/// pagination cursors.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: String,
    pub direction: Order,
}

impl SortConfig {
    pub fn new(field: impl Into<String>, direction: Order) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Sorting on `_creationTime` is what the deployment orders by already,
    /// so it becomes the query's `order` instead of a client-side sort.
    pub fn server_order(&self) -> Option<Order> {
        (self.field == CREATION_TIME_FIELD).then_some(self.direction)
    }
}

/// Stable sort of `documents` by a (possibly nested) field.
pub fn sort_documents(documents: &mut [TableDocument], sort: &SortConfig) {
    documents.sort_by(|a, b| {
        let ordering = cmp_fields(a.get_path(&sort.field), b.get_path(&sort.field));
        match sort.direction {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use value::{
        DynamicValue,
        TableDocument,
        TableName,
        dyn_obj,
    };

    use super::{
        FilterClause,
        FilterExpression,
        FilterOp,
        FilterToken,
        IndexFilter,
        IndexFilterClause,
        IndexSelection,
        Order,
        RangeBound,
        SearchFilterClause,
        SearchIndexFilter,
        SortConfig,
        deserialize,
        parse_free_text,
        serialize,
        sort_documents,
        wire_token,
    };
    use crate::tables::{
        IndexDescriptor,
        IndexKind,
    };

    fn doc(id: &str, creation_time: f64, fields: serde_json::Value) -> TableDocument {
        let mut json = fields;
        json["_id"] = json!(id);
        json["_creationTime"] = json!(creation_time);
        TableDocument::from_json(&"users".parse().unwrap(), json).unwrap()
    }

    fn by_owner_index() -> IndexDescriptor {
        IndexDescriptor {
            table: TableName::from_str("messages").unwrap(),
            name: "by_channel_author".into(),
            kind: IndexKind::Database {
                fields: vec!["channel".into(), "author".into()],
            },
            backfill_state: None,
        }
    }

    #[test]
    fn test_op_wire_names() -> anyhow::Result<()> {
        for (op, name) in [
            (FilterOp::Eq, "eq"),
            (FilterOp::Gte, "gte"),
            (FilterOp::IsType, "type"),
            (FilterOp::IsNotType, "notype"),
        ] {
            assert_eq!(serde_json::to_value(op)?, json!(name));
            assert_eq!(op.to_string(), name);
            assert_eq!(FilterOp::from_str(name)?, op);
        }
        Ok(())
    }

    #[test]
    fn test_clause_semantics() {
        let adult = doc("a1", 1.0, json!({"age": 30.0, "name": "Ada"}));
        let child = doc("a2", 2.0, json!({"age": 9.0}));
        let unknown = doc("a3", 3.0, json!({}));

        let gte = FilterClause::new("age", FilterOp::Gte, 18.0);
        assert!(gte.matches(&adult));
        assert!(!gte.matches(&child));
        assert!(!gte.matches(&unknown));

        // A missing field sorts before every value.
        let lt = FilterClause::new("age", FilterOp::Lt, 18.0);
        assert!(lt.matches(&unknown));

        let neq = FilterClause::new("name", FilterOp::Neq, "Ada");
        assert!(!neq.matches(&adult));
        assert!(neq.matches(&child));

        let is_number = FilterClause::new("age", FilterOp::IsType, "number");
        assert!(is_number.matches(&adult));
        assert!(!is_number.matches(&unknown));
        let not_undefined = FilterClause::new("age", FilterOp::IsNotType, "undefined");
        assert!(!not_undefined.matches(&unknown));
        assert!(not_undefined.matches(&child));
    }

    #[test]
    fn test_disabled_clauses_are_ignored() {
        let expr = FilterExpression::new(vec![
            FilterClause::new("age", FilterOp::Gte, 18.0),
            FilterClause::new("age", FilterOp::Eq, 1000.0).disabled(),
        ]);
        assert!(expr.matches(&doc("a1", 1.0, json!({"age": 30.0}))));
    }

    #[test]
    fn test_wire_token() -> anyhow::Result<()> {
        assert_eq!(wire_token(&FilterExpression::default())?, None);
        let only_disabled =
            FilterExpression::new(vec![FilterClause::new("age", FilterOp::Gte, 18.0).disabled()]);
        assert_eq!(wire_token(&only_disabled)?, None);

        let expr = FilterExpression::new(vec![FilterClause::new("age", FilterOp::Gte, 18.0)])
            .with_order(Order::Desc);
        let token = wire_token(&expr)?.unwrap();
        assert_eq!(deserialize(&token)?, expr.wire_form());
        assert!(deserialize(&token)?.clauses.iter().all(|c| c.id.is_empty()));

        // The same filter typed in again gets fresh clause ids but the same
        // token.
        let retyped = FilterExpression::new(vec![FilterClause::new("age", FilterOp::Gte, 18.0)])
            .with_order(Order::Desc);
        assert_ne!(retyped.clauses[0].id, expr.clauses[0].id);
        assert_eq!(wire_token(&retyped)?, Some(token));
        Ok(())
    }

    #[test]
    fn test_bad_tokens() {
        for bad in ["%%%", "bm90IGpzb24="] {
            let err = deserialize(&FilterToken::from(bad.to_string())).unwrap_err();
            assert!(err.is_bad_request());
        }
    }

    #[test]
    fn test_parse_free_text() {
        assert_eq!(parse_free_text("18"), DynamicValue::from(18.0));
        assert_eq!(parse_free_text("true"), DynamicValue::from(true));
        assert_eq!(parse_free_text("\"18\""), DynamicValue::from("18"));
        assert_eq!(parse_free_text("Ada"), DynamicValue::from("Ada"));
        assert_eq!(parse_free_text("{\"$bad\": 1}"), DynamicValue::from("{\"$bad\": 1}"));
        assert_eq!(
            parse_free_text("{\"city\": \"Paris\"}"),
            dyn_obj!("city" => "Paris")
        );
    }

    #[test]
    fn test_index_range_validation() {
        let index = by_owner_index();
        let eq = |field: &str| IndexFilterClause::Eq {
            field: field.into(),
            value: "x".into(),
            enabled: true,
        };
        let range = |field: &str| IndexFilterClause::Range {
            field: field.into(),
            lower: Some(RangeBound {
                value: "a".into(),
                inclusive: true,
            }),
            upper: None,
            enabled: true,
        };
        let filter = |clauses| IndexFilter {
            name: index.name.clone(),
            clauses,
        };

        assert!(filter(vec![]).validate(&index).is_ok());
        assert!(filter(vec![eq("channel"), range("author")]).validate(&index).is_ok());
        assert!(
            filter(vec![eq("channel"), eq("author"), range("_creationTime")])
                .validate(&index)
                .is_ok()
        );
        for bad in [
            vec![eq("author")],
            vec![range("channel"), eq("author")],
            vec![eq("channel"), eq("author"), eq("_creationTime"), eq("extra")],
        ] {
            let err = filter(bad).validate(&index).unwrap_err();
            assert!(err.is_bad_request());
        }
        // Disabled clauses don't count towards the prefix.
        let mut disabled_channel = eq("channel");
        if let IndexFilterClause::Eq { enabled, .. } = &mut disabled_channel {
            *enabled = false;
        }
        assert!(filter(vec![disabled_channel, eq("author")]).validate(&index).is_err());
    }

    #[test]
    fn test_index_clauses_filter_documents() {
        let expr = FilterExpression::default().with_index(IndexSelection::Database(IndexFilter {
            name: "by_age".into(),
            clauses: vec![IndexFilterClause::Range {
                field: "age".into(),
                lower: Some(RangeBound {
                    value: 18.0.into(),
                    inclusive: false,
                }),
                upper: Some(RangeBound {
                    value: 65.0.into(),
                    inclusive: true,
                }),
                enabled: true,
            }],
        }));
        assert!(!expr.matches(&doc("a", 1.0, json!({"age": 18.0}))));
        assert!(expr.matches(&doc("b", 1.0, json!({"age": 65.0}))));
        assert!(!expr.matches(&doc("c", 1.0, json!({"age": 66.0}))));
    }

    #[test]
    fn test_search_validation() -> anyhow::Result<()> {
        let index = IndexDescriptor {
            table: "messages".parse()?,
            name: "search_body".into(),
            kind: IndexKind::Search {
                search_field: "body".into(),
                filter_fields: vec!["channel".into()],
            },
            backfill_state: None,
        };
        let mut search = SearchIndexFilter {
            name: "search_body".into(),
            search: "hello".into(),
            clauses: vec![SearchFilterClause {
                field: "channel".into(),
                value: "general".into(),
                enabled: true,
            }],
        };
        search.validate(&index)?;
        search.clauses[0].field = "author".into();
        assert!(search.validate(&index).unwrap_err().is_bad_request());
        search.clauses.clear();
        search.search = "  ".into();
        assert!(search.validate(&index).unwrap_err().is_bad_request());
        assert!(
            IndexSelection::Search(search)
                .validate(&by_owner_index())
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_validate_type_filters() {
        let expr = FilterExpression::new(vec![FilterClause::new("age", FilterOp::IsType, 5.0)]);
        assert!(expr.validate().unwrap_err().is_bad_request());
        let expr =
            FilterExpression::new(vec![FilterClause::new("age", FilterOp::IsType, 5.0).disabled()]);
        assert!(expr.validate().is_ok());
    }

    #[test]
    fn test_sort_documents() {
        let mut docs = vec![
            doc("a", 1.0, json!({"name": "b"})),
            doc("b", 2.0, json!({})),
            doc("c", 3.0, json!({"name": "a"})),
        ];
        sort_documents(&mut docs, &SortConfig::new("name", Order::Asc));
        let ids: Vec<&str> = docs.iter().map(|d| d.id().id()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        sort_documents(&mut docs, &SortConfig::new("_creationTime", Order::Desc));
        let ids: Vec<&str> = docs.iter().map(|d| d.id().id()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(
            SortConfig::new("_creationTime", Order::Desc).server_order(),
            Some(Order::Desc)
        );
        assert_eq!(SortConfig::new("name", Order::Desc).server_order(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_token_roundtrips_modulo_disabled(expr in any::<FilterExpression>()) {
            let token = serialize(&expr).unwrap();
            prop_assert_eq!(deserialize(&token).unwrap(), expr.wire_form());
            // Disabling a clause changes the draft but not the token.
            if let Some(first) = expr.clauses.first() {
                let mut extra = expr.clone();
                extra.clauses.push(first.clone().disabled());
                prop_assert_eq!(serialize(&extra).unwrap(), token);
            }
        }
    }
}
