//! Resource kinds and their per-kind schema.
//!
//! The provisioning engines this replaces keep this table hidden in their
//! provider schemas. Here it is explicit: every property of every kind has a
//! declared change policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a change to a property is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// The provider can change the value on the live object.
    UpdateInPlace,
    /// A change forces the object to be replaced.
    Replace,
    /// The value may be set once; any later change is an error.
    Immutable,
}

/// Schema entry for a single property.
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    /// Property name.
    pub name: &'static str,
    /// Change policy.
    pub policy: ChangePolicy,
    /// Whether the property must be declared.
    pub required: bool,
}

/// Schema for a resource kind.
#[derive(Debug)]
pub struct KindSchema {
    /// Accepted properties.
    pub properties: &'static [PropertySpec],
    /// Output attributes every successful apply must report.
    pub outputs: &'static [&'static str],
    /// Whether a replacement may exist alongside the instance it replaces.
    pub create_before_destroy: bool,
}

/// The resource kinds a lab topology is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network.
    Vpc,
    /// Internet gateway.
    InternetGateway,
    /// Attachment of an internet gateway to a VPC.
    VpcGatewayAttachment,
    /// Route table.
    RouteTable,
    /// Single route in a route table.
    Route,
    /// Subnet (dual-stack or IPv6-only).
    Subnet,
    /// Association between a subnet and a route table.
    SubnetRouteTableAssociation,
    /// Ingress rule on a security group.
    SecurityGroupIngress,
    /// Compute instance.
    Instance,
}

const fn update(name: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        policy: ChangePolicy::UpdateInPlace,
        required: false,
    }
}

const fn replace(name: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        policy: ChangePolicy::Replace,
        required: false,
    }
}

const fn required(spec: PropertySpec) -> PropertySpec {
    PropertySpec {
        required: true,
        ..spec
    }
}

const fn immutable(name: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        policy: ChangePolicy::Immutable,
        required: false,
    }
}

static VPC: KindSchema = KindSchema {
    properties: &[
        required(replace("cidr_block")),
        update("assign_generated_ipv6_cidr_block"),
        update("tags"),
    ],
    outputs: &["id", "cidr_block", "ipv6_cidr_block", "default_security_group_id"],
    create_before_destroy: true,
};

static INTERNET_GATEWAY: KindSchema = KindSchema {
    properties: &[update("tags")],
    outputs: &["id"],
    create_before_destroy: true,
};

// A VPC accepts a single gateway attachment.
static VPC_GATEWAY_ATTACHMENT: KindSchema = KindSchema {
    properties: &[
        required(replace("vpc_id")),
        required(replace("internet_gateway_id")),
    ],
    outputs: &["id"],
    create_before_destroy: false,
};

static ROUTE_TABLE: KindSchema = KindSchema {
    properties: &[required(replace("vpc_id")), update("tags")],
    outputs: &["id", "route_table_id"],
    create_before_destroy: true,
};

// Two routes for the same destination cannot coexist in one table.
static ROUTE: KindSchema = KindSchema {
    properties: &[
        required(replace("route_table_id")),
        replace("destination_cidr_block"),
        replace("destination_ipv6_cidr_block"),
        required(update("gateway_id")),
    ],
    outputs: &["id"],
    create_before_destroy: false,
};

// Overlapping CIDRs are rejected, so a subnet is destroyed before it is rebuilt.
static SUBNET: KindSchema = KindSchema {
    properties: &[
        required(replace("vpc_id")),
        replace("availability_zone"),
        replace("cidr_block"),
        replace("ipv6_cidr_block"),
        immutable("ipv6_native"),
        update("assign_ipv6_address_on_creation"),
        update("tags"),
    ],
    outputs: &["id", "subnet_id", "availability_zone"],
    create_before_destroy: false,
};

static SUBNET_ROUTE_TABLE_ASSOCIATION: KindSchema = KindSchema {
    properties: &[
        required(replace("subnet_id")),
        required(update("route_table_id")),
    ],
    outputs: &["id"],
    create_before_destroy: false,
};

static SECURITY_GROUP_INGRESS: KindSchema = KindSchema {
    properties: &[
        required(replace("group_id")),
        required(replace("ip_protocol")),
        replace("cidr_ip"),
        replace("cidr_ipv6"),
        replace("from_port"),
        replace("to_port"),
        update("description"),
    ],
    outputs: &["id"],
    create_before_destroy: false,
};

static INSTANCE: KindSchema = KindSchema {
    properties: &[
        required(replace("ami")),
        required(update("instance_type")),
        required(replace("subnet_id")),
        replace("key_name"),
        replace("associate_public_ip_address"),
        update("metadata_options"),
        update("tags"),
    ],
    outputs: &["id", "private_ip", "ipv6_addresses"],
    create_before_destroy: true,
};

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Vpc,
        Self::InternetGateway,
        Self::VpcGatewayAttachment,
        Self::RouteTable,
        Self::Route,
        Self::Subnet,
        Self::SubnetRouteTableAssociation,
        Self::SecurityGroupIngress,
        Self::Instance,
    ];

    /// Returns the schema for this kind.
    #[must_use]
    pub const fn schema(self) -> &'static KindSchema {
        match self {
            Self::Vpc => &VPC,
            Self::InternetGateway => &INTERNET_GATEWAY,
            Self::VpcGatewayAttachment => &VPC_GATEWAY_ATTACHMENT,
            Self::RouteTable => &ROUTE_TABLE,
            Self::Route => &ROUTE,
            Self::Subnet => &SUBNET,
            Self::SubnetRouteTableAssociation => &SUBNET_ROUTE_TABLE_ASSOCIATION,
            Self::SecurityGroupIngress => &SECURITY_GROUP_INGRESS,
            Self::Instance => &INSTANCE,
        }
    }

    /// Returns the snake-case name used in configuration and state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::InternetGateway => "internet_gateway",
            Self::VpcGatewayAttachment => "vpc_gateway_attachment",
            Self::RouteTable => "route_table",
            Self::Route => "route",
            Self::Subnet => "subnet",
            Self::SubnetRouteTableAssociation => "subnet_route_table_association",
            Self::SecurityGroupIngress => "security_group_ingress",
            Self::Instance => "instance",
        }
    }

    /// Returns the id prefix a provider uses for this kind.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::InternetGateway => "igw",
            Self::VpcGatewayAttachment => "igw-attach",
            Self::RouteTable => "rtb",
            Self::Route => "r",
            Self::Subnet => "subnet",
            Self::SubnetRouteTableAssociation => "rtbassoc",
            Self::SecurityGroupIngress => "sgr",
            Self::Instance => "i",
        }
    }
}

impl KindSchema {
    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Returns true if the kind reports the given output attribute.
    #[must_use]
    pub fn has_output(&self, attribute: &str) -> bool {
        self.outputs.contains(&attribute)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown resource kind: {s}"))
    }
}

impl fmt::Display for ChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UpdateInPlace => "update",
            Self::Replace => "replace",
            Self::Immutable => "immutable",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_subnet_policy_table() {
        let schema = ResourceKind::Subnet.schema();
        assert_eq!(
            schema.property("availability_zone").map(|p| p.policy),
            Some(ChangePolicy::Replace)
        );
        assert_eq!(
            schema.property("tags").map(|p| p.policy),
            Some(ChangePolicy::UpdateInPlace)
        );
        assert_eq!(
            schema.property("ipv6_native").map(|p| p.policy),
            Some(ChangePolicy::Immutable)
        );
        assert!(schema.property("vpc_id").is_some_and(|p| p.required));
        assert!(!schema.create_before_destroy);
    }

    #[test]
    fn test_every_kind_outputs_an_id() {
        for kind in ResourceKind::ALL {
            assert!(kind.schema().has_output("id"), "{kind} must output id");
        }
    }
}
