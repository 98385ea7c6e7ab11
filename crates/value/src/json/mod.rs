//! Bijection between a subset of JSON values and [`DynamicValue`]s, in the
//! format the deployment uses for exports and system function results.
//!
//! 1) JSON numbers are mapped to `Float64`s. Floats that JSON cannot carry
//!    (NaN, infinities, negative zero) are encoded as their little endian
//!    bytes in base64: {"$float": "..."}.
//! 2) Int64 integers are encoded as their little endian representation in
//!    base64: {"$integer": "..."}.
//! 3) Bytes are encoded as base64: {"$bytes": "..."}.
//! 4) Objects are not allowed to have keys starting with "$".
//! 5) Ids are exported as plain strings. Decoding yields a `String`;
//!    [`crate::TableDocument`] re-types its `_id` field.

use std::{
    collections::BTreeMap,
    num::FpCategory,
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::Value as JsonValue;

use crate::DynamicValue;

const INTEGER_KEY: &str = "$integer";
const FLOAT_KEY: &str = "$float";
const BYTES_KEY: &str = "$bytes";

fn is_special_float(n: f64) -> bool {
    (n == 0.0 && n.is_sign_negative())
        || matches!(n.classify(), FpCategory::Infinite | FpCategory::Nan)
}

fn invalid_json(msg: String) -> ErrorMetadata {
    ErrorMetadata::bad_request("InvalidValueJson", msg)
}

fn decode_base64_field(key: &str, value: JsonValue) -> anyhow::Result<Vec<u8>> {
    let JsonValue::String(s) = value else {
        anyhow::bail!(invalid_json(format!("{key} must be a base64 string")));
    };
    base64::decode(s.as_bytes()).with_context(|| invalid_json(format!("Invalid base64 in {key}")))
}

fn decode_le_bytes(key: &str, value: JsonValue) -> anyhow::Result<[u8; 8]> {
    let bytes = decode_base64_field(key, value)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| invalid_json(format!("{key} must be 8 bytes, got {}", b.len())).into())
}

impl TryFrom<JsonValue> for DynamicValue {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let r = match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::from(b),
            JsonValue::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| invalid_json(format!("Unsupported JSON number {n}")))?;
                Self::from(n)
            },
            JsonValue::String(s) => Self::from(s),
            JsonValue::Array(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for a in arr {
                    out.push(Self::try_from(a)?);
                }
                Self::Array(out)
            },
            JsonValue::Object(map) => {
                let mut fields = BTreeMap::new();
                let is_single = map.len() == 1;
                for (key, value) in map {
                    if is_single {
                        match &key[..] {
                            INTEGER_KEY => {
                                return Ok(Self::Int64(i64::from_le_bytes(decode_le_bytes(
                                    INTEGER_KEY,
                                    value,
                                )?)));
                            },
                            FLOAT_KEY => {
                                let n = f64::from_le_bytes(decode_le_bytes(FLOAT_KEY, value)?);
                                if !is_special_float(n) {
                                    anyhow::bail!(invalid_json(format!(
                                        "Float64 {n} should be encoded as a number"
                                    )));
                                }
                                return Ok(Self::Float64(n));
                            },
                            BYTES_KEY => {
                                return Ok(Self::Bytes(decode_base64_field(BYTES_KEY, value)?));
                            },
                            _ => {},
                        }
                    }
                    if key.starts_with('$') {
                        anyhow::bail!(invalid_json(format!(
                            "Field name {key:?} starts with a '$', which is reserved"
                        )));
                    }
                    fields.insert(key, Self::try_from(value)?);
                }
                Self::Object(fields)
            },
        };
        Ok(r)
    }
}

impl From<DynamicValue> for JsonValue {
    fn from(value: DynamicValue) -> Self {
        value.to_json()
    }
}

impl DynamicValue {
    pub fn to_json(&self) -> JsonValue {
        let tagged = |key: &str, encoded: String| {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), JsonValue::String(encoded));
            JsonValue::Object(map)
        };
        match self {
            DynamicValue::Null => JsonValue::Null,
            DynamicValue::Int64(n) => tagged(INTEGER_KEY, base64::encode(n.to_le_bytes())),
            DynamicValue::Float64(n) => {
                if is_special_float(*n) {
                    return tagged(FLOAT_KEY, base64::encode(n.to_le_bytes()));
                }
                serde_json::Number::from_f64(*n)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            },
            DynamicValue::Boolean(b) => JsonValue::Bool(*b),
            DynamicValue::String(s) => JsonValue::String(s.clone()),
            DynamicValue::Bytes(b) => tagged(BYTES_KEY, base64::encode(b)),
            DynamicValue::Array(a) => JsonValue::Array(a.iter().map(|v| v.to_json()).collect()),
            DynamicValue::Object(o) => JsonValue::Object(
                o.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            DynamicValue::Id(id) => JsonValue::String(id.id().to_string()),
        }
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DynamicValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        DynamicValue::try_from(json).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{
        Value as JsonValue,
        json,
    };

    use crate::{
        DynamicValue,
        dyn_array,
        dyn_obj,
    };

    #[test]
    fn test_export_format() -> anyhow::Result<()> {
        let value = dyn_obj!(
            "count" => 1i64,
            "ratio" => 0.25,
            "inf" => f64::INFINITY,
            "blob" => DynamicValue::Bytes(vec![1, 2, 3]),
            "tags" => dyn_array!["a", true],
            "none" => DynamicValue::Null,
        );
        let expected = json!({
            "count": {"$integer": "AQAAAAAAAAA="},
            "ratio": 0.25,
            "inf": {"$float": "AAAAAAAA8H8="},
            "blob": {"$bytes": "AQID"},
            "tags": ["a", true],
            "none": null,
        });
        assert_eq!(value.to_json(), expected);
        assert_eq!(DynamicValue::try_from(expected)?, value);
        Ok(())
    }

    #[test]
    fn test_rejects_reserved_keys() {
        for bad in [
            json!({"$foo": 1}),
            json!({"a": 1, "$integer": "AQAAAAAAAAA="}),
            json!({"$float": "AAAAAAAA8D8="}),
            json!({"$integer": "AQ=="}),
            json!({"$bytes": 5}),
        ] {
            let err = DynamicValue::try_from(bad.clone()).unwrap_err();
            assert!(err.is_bad_request(), "{bad}");
        }
    }

    #[test]
    fn test_integers_in_json_are_floats() -> anyhow::Result<()> {
        assert_eq!(DynamicValue::try_from(json!(18))?, DynamicValue::Float64(18.0));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_json_roundtrips(value in any::<DynamicValue>()) {
            let json = JsonValue::from(value.clone());
            let text = serde_json::to_string(&json).unwrap();
            let parsed: DynamicValue = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(parsed, value);
        }
    }
}
