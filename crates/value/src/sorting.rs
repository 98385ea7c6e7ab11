//! Total order on [`DynamicValue`]s, matching how the backend orders index
//! keys: values are ranked by a type tag first and only compared by content
//! within a tag.
//!
//! A missing field ("undefined") sorts before every value. Callers model it
//! as `None` and compare `Option<&DynamicValue>`, whose derived order already
//! puts `None` first.
use std::cmp::Ordering;

use crate::DynamicValue;

const NULL_TAG: u8 = 0x3;
const INT64_TAG: u8 = 0x8;
const FLOAT64_TAG: u8 = 0xD;
const BOOLEAN_TAG: u8 = 0xE;
const STRING_TAG: u8 = 0x10;
const BYTES_TAG: u8 = 0x11;
const ARRAY_TAG: u8 = 0x12;
const OBJECT_TAG: u8 = 0x15;

fn type_tag(value: &DynamicValue) -> u8 {
    match value {
        DynamicValue::Null => NULL_TAG,
        DynamicValue::Int64(_) => INT64_TAG,
        DynamicValue::Float64(_) => FLOAT64_TAG,
        DynamicValue::Boolean(_) => BOOLEAN_TAG,
        // Ids are strings on the wire and sort among them.
        DynamicValue::String(_) | DynamicValue::Id(_) => STRING_TAG,
        DynamicValue::Bytes(_) => BYTES_TAG,
        DynamicValue::Array(_) => ARRAY_TAG,
        DynamicValue::Object(_) => OBJECT_TAG,
    }
}

impl Ord for DynamicValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_tag = type_tag(self).cmp(&type_tag(other));
        if by_tag.is_ne() {
            return by_tag;
        }
        match (self, other) {
            (DynamicValue::Null, DynamicValue::Null) => Ordering::Equal,
            (DynamicValue::Int64(a), DynamicValue::Int64(b)) => a.cmp(b),
            (DynamicValue::Float64(a), DynamicValue::Float64(b)) => a.total_cmp(b),
            (DynamicValue::Boolean(a), DynamicValue::Boolean(b)) => a.cmp(b),
            (DynamicValue::Bytes(a), DynamicValue::Bytes(b)) => a.cmp(b),
            (DynamicValue::Array(a), DynamicValue::Array(b)) => a.cmp(b),
            (DynamicValue::Object(a), DynamicValue::Object(b)) => a.iter().cmp(b.iter()),
            (DynamicValue::Id(a), DynamicValue::Id(b)) => a.cmp(b),
            // A string and an id with the same text are still distinct
            // values; the string goes first.
            (DynamicValue::String(a), DynamicValue::Id(b)) => {
                a.as_str().cmp(b.id()).then(Ordering::Less)
            },
            (DynamicValue::Id(a), DynamicValue::String(b)) => {
                a.id().cmp(b.as_str()).then(Ordering::Greater)
            },
            (DynamicValue::String(a), DynamicValue::String(b)) => a.cmp(b),
            _ => unreachable!("values with equal type tags have matching variants"),
        }
    }
}

impl PartialOrd for DynamicValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compares two possibly-missing field values.
pub fn cmp_fields(a: Option<&DynamicValue>, b: Option<&DynamicValue>) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use proptest::prelude::*;

    use super::cmp_fields;
    use crate::{
        DocumentId,
        DynamicValue,
        dyn_array,
        dyn_obj,
    };

    #[test]
    fn test_type_order() -> anyhow::Result<()> {
        let ascending = vec![
            DynamicValue::Null,
            DynamicValue::from(i64::MIN),
            DynamicValue::from(1000i64),
            DynamicValue::from(f64::NEG_INFINITY),
            DynamicValue::from(-1.0),
            DynamicValue::from(0.5),
            DynamicValue::from(f64::NAN),
            DynamicValue::from(false),
            DynamicValue::from(true),
            DynamicValue::from(""),
            DynamicValue::from("abc"),
            DynamicValue::Id(DocumentId::new("users".parse()?, "abc")),
            DynamicValue::from("abd"),
            DynamicValue::Bytes(vec![]),
            DynamicValue::Bytes(vec![0]),
            dyn_array![],
            dyn_array![1.0],
            dyn_array![1.0, 2.0],
            dyn_array![2.0],
            dyn_obj!(),
            dyn_obj!("a" => 1.0),
            dyn_obj!("a" => 2.0),
            dyn_obj!("b" => 0.0),
        ];
        for (i, a) in ascending.iter().enumerate() {
            for (j, b) in ascending.iter().enumerate() {
                assert_eq!(a.cmp(b), i.cmp(&j), "{a} vs {b}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_missing_sorts_first() {
        assert_eq!(
            cmp_fields(None, Some(&DynamicValue::Null)),
            Ordering::Less
        );
        assert_eq!(cmp_fields(None, None), Ordering::Equal);
    }

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_order_is_total(a in any::<DynamicValue>(), b in any::<DynamicValue>()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            prop_assert_eq!(a.cmp(&a), Ordering::Equal);
            prop_assert_eq!(a == b, a.cmp(&b).is_eq());
        }
    }
}
