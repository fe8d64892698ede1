use crate::TargetError;
use std::collections::BTreeMap;
use std::path::Path;

pub type TargetProperties = BTreeMap<String, String>;

/// Load target properties from TOML. Nested tables flatten into dotted
/// keys, so `[azure] location = "x"` and `"azure.location" = "x"` are the
/// same property.
pub fn load_properties(path: &Path) -> Result<TargetProperties, TargetError> {
    let content = std::fs::read_to_string(path)?;
    parse_properties(&content)
}

pub fn parse_properties(content: &str) -> Result<TargetProperties, TargetError> {
    let table: toml::Table =
        content
            .parse()
            .map_err(|e: toml::de::Error| TargetError::InvalidProperty {
                key: "<file>".to_owned(),
                reason: e.to_string(),
            })?;
    let mut out = TargetProperties::new();
    flatten("", &table, &mut out)?;
    Ok(out)
}

fn flatten(
    prefix: &str,
    table: &toml::Table,
    out: &mut TargetProperties,
) -> Result<(), TargetError> {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&full, inner, out)?,
            toml::Value::String(s) => {
                out.insert(full, s.clone());
            }
            toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                out.insert(full, value.to_string());
            }
            toml::Value::Array(_) | toml::Value::Datetime(_) => {
                return Err(TargetError::InvalidProperty {
                    key: full,
                    reason: "expected a string, number or boolean".to_owned(),
                });
            }
        }
    }
    Ok(())
}

/// The value of `key`, trimmed; missing or blank values are an error.
pub fn require<'a>(properties: &'a TargetProperties, key: &str) -> Result<&'a str, TargetError> {
    properties
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TargetError::MissingProperty(key.to_owned()))
}

/// Parse an optional numeric property.
pub fn optional_u64(properties: &TargetProperties, key: &str) -> Result<Option<u64>, TargetError> {
    properties
        .get(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| TargetError::InvalidProperty {
                key: key.to_owned(),
                reason: format!("'{raw}' is not a non-negative integer"),
            })
        })
        .transpose()
}
