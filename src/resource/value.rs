//! Property values and references between resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::key::ResourceKey;

/// Output attributes reported by a provider.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// A desired property value.
///
/// In YAML a reference is written `{ ref: subnet.lab.id }`, a lookup
/// `{ lookup: almalinux_9_x86_64 }` and a variable `{ var: ssh_key_name }`.
/// Anything else is a literal. Lookups and variables are substituted while
/// the graph is built, so graph nodes only hold literals and references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Reference to another resource's output attribute.
    Reference(Reference),
    /// Reference to a resolved lookup.
    Lookup(LookupRef),
    /// Reference to a configuration variable.
    Variable(VariableRef),
    /// Literal value.
    Literal(serde_json::Value),
}

/// Reference to an output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    /// Referenced attribute.
    #[serde(rename = "ref")]
    pub path: AttributePath,
    /// Optional sub-prefix carved out of the referenced CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidrsubnet: Option<CidrSubnet>,
}

/// `<kind>.<name>.<attribute>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributePath {
    /// Referenced resource.
    pub target: ResourceKey,
    /// Referenced output attribute.
    pub attribute: String,
}

/// Parameters of a `cidrsubnet` transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CidrSubnet {
    /// Bits added to the prefix length.
    pub newbits: u8,
    /// Index of the sub-prefix.
    pub netnum: u64,
}

/// Reference to a lookup result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LookupRef {
    /// Lookup name.
    pub lookup: String,
}

/// Reference to a configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableRef {
    /// Variable name.
    pub var: String,
}

impl PropertyValue {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a plain reference to `target.attribute`.
    #[must_use]
    pub fn reference(target: ResourceKey, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference {
            path: AttributePath {
                target,
                attribute: attribute.into(),
            },
            cidrsubnet: None,
        })
    }

    /// Creates a lookup reference.
    #[must_use]
    pub fn lookup(name: impl Into<String>) -> Self {
        Self::Lookup(LookupRef {
            lookup: name.into(),
        })
    }

    /// Creates a variable reference.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(VariableRef { var: name.into() })
    }

    /// Returns the reference, if this value is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }
}

impl Reference {
    /// Adds a `cidrsubnet` transform.
    #[must_use]
    pub const fn with_cidrsubnet(mut self, newbits: u8, netnum: u64) -> Self {
        self.cidrsubnet = Some(CidrSubnet { newbits, netnum });
        self
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

impl TryFrom<String> for AttributePath {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (key, attribute) = s
            .rsplit_once('.')
            .ok_or_else(|| format!("Invalid reference '{s}': expected <kind>.<name>.<attribute>"))?;
        if attribute.is_empty() {
            return Err(format!("Invalid reference '{s}': empty attribute"));
        }
        Ok(Self {
            target: key.parse()?,
            attribute: attribute.to_string(),
        })
    }
}

impl From<AttributePath> for String {
    fn from(path: AttributePath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(r) => match r.cidrsubnet {
                Some(c) => write!(f, "cidrsubnet({}, {}, {})", r.path, c.newbits, c.netnum),
                None => write!(f, "{}", r.path),
            },
            Self::Lookup(l) => write!(f, "lookup({})", l.lookup),
            Self::Variable(v) => write!(f, "var({})", v.var),
            Self::Literal(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[test]
    fn test_parse_reference_from_yaml() {
        let yaml = "ref: vpc.ipv6_only_testing.ipv6_cidr_block\ncidrsubnet:\n  newbits: 8\n  netnum: 1\n";
        let value: PropertyValue = serde_yaml::from_str(yaml).expect("parse");
        let expected = PropertyValue::Reference(
            Reference {
                path: AttributePath {
                    target: ResourceKey::new(ResourceKind::Vpc, "ipv6_only_testing"),
                    attribute: String::from("ipv6_cidr_block"),
                },
                cidrsubnet: None,
            }
            .with_cidrsubnet(8, 1),
        );
        assert_eq!(value, expected);
    }

    #[test]
    fn test_parse_lookup_variable_and_literals() {
        let lookup: PropertyValue = serde_yaml::from_str("lookup: rhel_9_x86_64").expect("lookup");
        assert_eq!(lookup, PropertyValue::lookup("rhel_9_x86_64"));

        let var: PropertyValue = serde_yaml::from_str("var: ssh_key_name").expect("var");
        assert_eq!(var, PropertyValue::variable("ssh_key_name"));

        let tags: PropertyValue = serde_yaml::from_str("Name: jumphost").expect("tags");
        assert_eq!(
            tags,
            PropertyValue::literal(serde_json::json!({ "Name": "jumphost" }))
        );

        let port: PropertyValue = serde_yaml::from_str("22").expect("port");
        assert_eq!(port, PropertyValue::literal(22));
    }

    #[test]
    fn test_reference_json_shape() {
        let value = PropertyValue::reference(ResourceKey::new(ResourceKind::Subnet, "lab"), "id");
        let json = serde_json::to_value(&value).expect("serialize");
        assert_eq!(json, serde_json::json!({ "ref": "subnet.lab.id" }));
    }

    #[test]
    fn test_display() {
        let value = PropertyValue::Reference(
            Reference {
                path: AttributePath {
                    target: ResourceKey::new(ResourceKind::Vpc, "v"),
                    attribute: String::from("ipv6_cidr_block"),
                },
                cidrsubnet: None,
            }
            .with_cidrsubnet(8, 0),
        );
        assert_eq!(value.to_string(), "cidrsubnet(vpc.v.ipv6_cidr_block, 8, 0)");
    }
}
