//! Values stored in deployment documents, as seen by the data browser.
//!
//! A [`DynamicValue`] is a closed union mirroring the backend's value types.
//! It converts to and from the backend's JSON export format (see [`json`]) and
//! carries a total order (see [`sorting`]) so fetched pages can be sorted and
//! filtered client-side.

mod document;
pub mod json;
mod macros;
pub mod sorting;
mod table_name;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{
    collections::BTreeMap,
    fmt,
    hash::{
        Hash,
        Hasher,
    },
};

pub use crate::{
    document::{
        CREATION_TIME_FIELD,
        DocumentId,
        ID_FIELD,
        TableDocument,
    },
    table_name::{
        IDENTIFIER_REQUIREMENTS,
        MAX_IDENTIFIER_LEN,
        METADATA_PREFIX,
        TableName,
        check_valid_identifier,
    },
};

#[derive(Clone, Debug)]
pub enum DynamicValue {
    Null,
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<DynamicValue>),
    Object(BTreeMap<String, DynamicValue>),
    /// Reference to a document. Exported to JSON as its plain string form.
    Id(DocumentId),
}

impl DynamicValue {
    /// Name of the value's type, as used by `type`/`notype` filters.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Int64(_) => "bigint",
            DynamicValue::Float64(_) => "number",
            DynamicValue::Boolean(_) => "boolean",
            DynamicValue::String(_) => "string",
            DynamicValue::Bytes(_) => "bytes",
            DynamicValue::Array(_) => "array",
            DynamicValue::Object(_) => "object",
            DynamicValue::Id(_) => "id",
        }
    }

    /// String contents of a `String` or the id part of an `Id`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            DynamicValue::Id(id) => Some(id.id()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, DynamicValue>> {
        match self {
            DynamicValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Follows a dotted field path (`address.city`) through nested objects.
    pub fn get_path(&self, path: &str) -> Option<&DynamicValue> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for DynamicValue {}

impl Hash for DynamicValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            DynamicValue::Null => {},
            DynamicValue::Int64(n) => n.hash(state),
            DynamicValue::Float64(n) => n.to_bits().hash(state),
            DynamicValue::Boolean(b) => b.hash(state),
            DynamicValue::String(s) => s.hash(state),
            DynamicValue::Bytes(b) => b.hash(state),
            DynamicValue::Array(a) => a.hash(state),
            DynamicValue::Object(o) => o.hash(state),
            DynamicValue::Id(id) => id.hash(state),
        }
    }
}

impl fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Null => write!(f, "null"),
            DynamicValue::Int64(n) => write!(f, "{n}n"),
            DynamicValue::Float64(n) => write!(f, "{n:?}"),
            DynamicValue::Boolean(b) => write!(f, "{b}"),
            DynamicValue::String(s) => write!(f, "{s:?}"),
            DynamicValue::Bytes(b) => write!(f, "b\"{}\"", base64::encode(b)),
            DynamicValue::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            },
            DynamicValue::Object(o) => {
                write!(f, "{{")?;
                for (i, (k, v)) in o.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            },
            DynamicValue::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<i64> for DynamicValue {
    fn from(n: i64) -> Self {
        DynamicValue::Int64(n)
    }
}

impl From<f64> for DynamicValue {
    fn from(n: f64) -> Self {
        DynamicValue::Float64(n)
    }
}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        DynamicValue::Boolean(b)
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::String(s.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        DynamicValue::String(s)
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(a: Vec<DynamicValue>) -> Self {
        DynamicValue::Array(a)
    }
}

impl From<BTreeMap<String, DynamicValue>> for DynamicValue {
    fn from(o: BTreeMap<String, DynamicValue>) -> Self {
        DynamicValue::Object(o)
    }
}

impl From<DocumentId> for DynamicValue {
    fn from(id: DocumentId) -> Self {
        DynamicValue::Id(id)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DynamicValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use crate::{
        DynamicValue,
        dyn_obj,
    };

    #[test]
    fn test_type_names() {
        let cases = [
            (DynamicValue::Null, "null"),
            (DynamicValue::from(1i64), "bigint"),
            (DynamicValue::from(1.5), "number"),
            (DynamicValue::from(true), "boolean"),
            (DynamicValue::from("x"), "string"),
            (DynamicValue::Bytes(vec![1]), "bytes"),
            (DynamicValue::Array(vec![]), "array"),
            (dyn_obj!(), "object"),
        ];
        for (value, name) in cases {
            assert_eq!(value.type_name(), name);
        }
    }

    #[test]
    fn test_get_path() {
        let doc = dyn_obj!("address" => dyn_obj!("city" => "Paris"), "age" => 30.0);
        assert_eq!(
            doc.get_path("address.city"),
            Some(&DynamicValue::from("Paris"))
        );
        assert_eq!(doc.get_path("age"), Some(&DynamicValue::from(30.0)));
        assert_eq!(doc.get_path("age.years"), None);
        assert_eq!(doc.get_path("missing"), None);
    }

    #[test]
    fn test_floats_hash_by_bits() {
        let mut set = HashSet::new();
        set.insert(DynamicValue::from(f64::NAN));
        set.insert(DynamicValue::from(f64::NAN));
        set.insert(DynamicValue::from(0.0));
        set.insert(DynamicValue::from(-0.0));
        assert_eq!(set.len(), 3);
    }
}
