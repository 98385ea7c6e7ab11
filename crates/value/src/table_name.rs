use std::{
    fmt::{
        self,
        Debug,
    },
    ops::Deref,
    str::FromStr,
};

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

/// A table is a system table if and only if it has this prefix.
pub const METADATA_PREFIX: &str = "_";

pub const MAX_IDENTIFIER_LEN: usize = 64;

pub const IDENTIFIER_REQUIREMENTS: &str =
    "Identifiers must start with a letter or underscore, contain only letters, digits and \
     underscores, and be at most 64 characters long.";

pub fn check_valid_identifier(s: &str) -> anyhow::Result<()> {
    let mut chars = s.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            s.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    };
    if !valid || s == METADATA_PREFIX {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidIdentifier",
            format!("Invalid identifier {s:?}. {IDENTIFIER_REQUIREMENTS}")
        ));
    }
    Ok(())
}

/// Name of a table in a deployment.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_valid_identifier(s)?;
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for TableName {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        check_valid_identifier(&s)?;
        Ok(Self(s))
    }
}

impl Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Deref for TableName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<TableName> for String {
    fn from(t: TableName) -> Self {
        t.0
    }
}

impl TableName {
    /// Is this table in the system namespace?
    pub fn is_system(&self) -> bool {
        self.0.starts_with(METADATA_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::TableName;

    #[test]
    fn test_table_names() -> anyhow::Result<()> {
        assert!(!"users".parse::<TableName>()?.is_system());
        assert!("_storage".parse::<TableName>()?.is_system());
        for bad in ["", "_", "1users", "user-profiles", "ünicode", &"a".repeat(65)] {
            let err = bad.parse::<TableName>().unwrap_err();
            assert!(err.is_bad_request(), "{bad:?}");
        }
        let parsed: TableName = serde_json::from_str("\"messages\"")?;
        assert_eq!(&*parsed, "messages");
        assert!(serde_json::from_str::<TableName>("\"no spaces\"").is_err());
        Ok(())
    }
}
