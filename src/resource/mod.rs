//! Typed resource model.
//!
//! Every declaration names one of a fixed set of resource kinds. Each kind
//! carries a schema: the properties it accepts, how a change to each one is
//! applied, the output attributes the provider must report, and whether a
//! replacement may coexist with the instance it replaces.

mod cidr;
mod key;
mod kind;
mod value;

pub use cidr::cidr_subnet;
pub use key::ResourceKey;
pub use kind::{ChangePolicy, KindSchema, PropertySpec, ResourceKind};
pub use value::{AttributePath, Attributes, CidrSubnet, PropertyValue, Reference};
