use std::str::FromStr;

use anyhow::Context;

/// Parses `key=value` command line arguments (e.g. `--set age=21`). Only the
/// first `=` separates key from value, so values may contain `=`.
pub fn parse_key_value<K, V>(s: &str) -> anyhow::Result<(K, V)>
where
    K: FromStr<Err: Into<anyhow::Error>>,
    V: FromStr<Err: Into<anyhow::Error>>,
{
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid key=value: no `=` found in `{s}`"))?;
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "invalid key=value: empty key in `{s}`");
    Ok((
        key.parse::<K>()
            .map_err(Into::<anyhow::Error>::into)
            .with_context(|| format!("Failed to parse key {key}"))?,
        value
            .parse::<V>()
            .map_err(Into::<anyhow::Error>::into)
            .with_context(|| format!("Failed to parse value {value}"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::parse_key_value;

    #[test]
    fn test_parse_key_value() -> anyhow::Result<()> {
        let (k, v): (String, String) = parse_key_value("age=21")?;
        assert_eq!((k.as_str(), v.as_str()), ("age", "21"));

        let (k, v): (String, String) = parse_key_value("query=a=b")?;
        assert_eq!((k.as_str(), v.as_str()), ("query", "a=b"));

        let (_, n): (String, u32) = parse_key_value("count=7")?;
        assert_eq!(n, 7);

        assert!(parse_key_value::<String, String>("novalue").is_err());
        assert!(parse_key_value::<String, String>(" =1").is_err());
        assert!(parse_key_value::<String, u32>("count=x").is_err());
        Ok(())
    }
}
