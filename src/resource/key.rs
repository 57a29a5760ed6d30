//! Logical resource identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::kind::ResourceKind;

/// Stable identity of a resource: its kind plus a logical name that is unique
/// within that kind.
///
/// Serialized as `<kind>.<name>`, e.g. `subnet.ipv6_only_subnet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name.
    pub name: String,
}

impl ResourceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid resource key '{s}': expected <kind>.<name>"))?;
        if name.is_empty() || name.contains('.') {
            return Err(format!("Invalid resource name in key '{s}'"));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = ResourceKey::new(ResourceKind::RouteTable, "public_route_table_dualstack");
        assert_eq!(key.to_string(), "route_table.public_route_table_dualstack");
        let parsed: ResourceKey = key.to_string().parse().expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_rejects_garbage() {
        assert!("vpc".parse::<ResourceKey>().is_err());
        assert!("vpc.".parse::<ResourceKey>().is_err());
        assert!("bucket.logs".parse::<ResourceKey>().is_err());
        assert!("vpc.a.b".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_key_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ResourceKey::new(ResourceKind::Vpc, "lab"), 1);
        let json = serde_json::to_string(&map).expect("serialize");
        assert_eq!(json, r#"{"vpc.lab":1}"#);
        let back: std::collections::BTreeMap<ResourceKey, i32> =
            serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, map);
    }
}
