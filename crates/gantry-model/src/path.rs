use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Slash-joined, root-anchored path of an instance: `/vm/tomcat/war`.
///
/// The first segment names the root instance (one machine), every further
/// segment a nested child. Paths are unique within an application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstancePath(String);

/// Validate a single instance name: 1-64 characters of `[a-zA-Z0-9_.-]`.
pub fn validate_instance_name(name: &str) -> Result<(), ModelError> {
    if name.is_empty() || name.len() > 64 {
        return Err(ModelError::InvalidName(format!(
            "instance name '{name}' must be 1-64 characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(ModelError::InvalidName(format!(
            "instance name '{name}' must match [a-zA-Z0-9_.-]"
        )));
    }
    Ok(())
}

impl InstancePath {
    /// Path of a root instance.
    pub fn root(name: &str) -> Result<Self, ModelError> {
        validate_instance_name(name)?;
        Ok(Self(format!("/{name}")))
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(ModelError::InvalidPath(raw.to_owned()));
        };
        if rest.is_empty() {
            return Err(ModelError::InvalidPath(raw.to_owned()));
        }
        for segment in rest.split('/') {
            validate_instance_name(segment)
                .map_err(|_| ModelError::InvalidPath(raw.to_owned()))?;
        }
        Ok(Self(raw.to_owned()))
    }

    /// Path of a direct child of this instance.
    pub fn child(&self, name: &str) -> Result<Self, ModelError> {
        validate_instance_name(name)?;
        Ok(Self(format!("{}/{name}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// First segment: the name of the root instance this path lives under.
    pub fn root_name(&self) -> &str {
        self.0[1..].split('/').next().unwrap_or_default()
    }

    pub fn root_path(&self) -> InstancePath {
        InstancePath(format!("/{}", self.root_name()))
    }

    pub fn parent(&self) -> Option<InstancePath> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            None
        } else {
            Some(InstancePath(self.0[..idx].to_owned()))
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 1
    }

    /// Number of segments; 1 for a root instance.
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }

    /// True when `other` is strictly below this path.
    pub fn is_ancestor_of(&self, other: &InstancePath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for InstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InstancePath {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InstancePath> for String {
    fn from(path: InstancePath) -> Self {
        path.0
    }
}

impl std::str::FromStr for InstancePath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
