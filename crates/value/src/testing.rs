//! Proptest strategies for value types.
use proptest::prelude::*;

use crate::{
    DynamicValue,
    TableName,
};

/// Values that survive a JSON round trip. `Id`s are left out since they
/// export as plain strings.
pub fn json_value_strategy() -> impl Strategy<Value = DynamicValue> {
    let leaf = prop_oneof![
        Just(DynamicValue::Null),
        any::<i64>().prop_map(DynamicValue::Int64),
        any::<f64>().prop_map(DynamicValue::Float64),
        any::<bool>().prop_map(DynamicValue::Boolean),
        "[a-zA-Z0-9 ]{0,8}".prop_map(DynamicValue::String),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(DynamicValue::Bytes),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(DynamicValue::Array),
            prop::collection::btree_map("[a-z][a-z0-9_]{0,5}", inner, 0..4)
                .prop_map(DynamicValue::Object),
        ]
    })
}

impl Arbitrary for DynamicValue {
    type Parameters = ();
    type Strategy = BoxedStrategy<DynamicValue>;

    fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
        json_value_strategy().boxed()
    }
}

pub fn table_name_strategy() -> impl Strategy<Value = TableName> {
    "[a-z][a-z0-9_]{0,10}".prop_filter_map("Generated invalid TableName", |s| s.parse().ok())
}

impl Arbitrary for TableName {
    type Parameters = ();
    type Strategy = BoxedStrategy<TableName>;

    fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
        table_name_strategy().boxed()
    }
}
