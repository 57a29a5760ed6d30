//! Provider interface.
//!
//! A [`Provider`] performs one create, update or delete of one resource per
//! call and answers read-only lookups. The engine never talks to a cloud
//! directly; it only sees this trait.

mod lookup;
mod retry;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{LookupConfig, LookupKind};
use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceKey};

pub use lookup::resolve_lookups;
pub use retry::{Attempted, RetryPolicy};
pub use simulated::{Fault, SimulatedProvider};

/// The provider-side step of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Create a new object.
    Create,
    /// Modify an existing object in place.
    Update,
    /// Destroy an existing object.
    Delete,
}

/// A fully resolved request for one provider step.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// Logical identity of the resource.
    pub key: ResourceKey,
    /// What to do.
    pub step: Step,
    /// Resolved desired properties. Empty for deletes.
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Outputs recorded for the existing object, including its `id`.
    /// `None` for creates.
    pub prior: Option<Attributes>,
}

/// A read-only lookup query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    /// Lookup name, for error messages.
    pub name: String,
    /// Kind of object looked up.
    pub kind: LookupKind,
    /// Accepted owners. Empty accepts any owner.
    pub owners: Vec<String>,
    /// Attribute filters with `*` wildcards.
    pub filters: BTreeMap<String, Vec<String>>,
    /// Pick the most recent match.
    pub most_recent: bool,
}

/// Abstract infrastructure provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies one step and returns the object's output attributes.
    ///
    /// For deletes the returned attributes are ignored.
    async fn apply(&self, request: ApplyRequest) -> Result<Attributes, ProviderError>;

    /// Resolves a lookup to an object id.
    async fn lookup(&self, query: LookupQuery) -> Result<String, ProviderError>;
}

impl ApplyRequest {
    /// Returns the existing object's id, if any.
    #[must_use]
    pub fn prior_id(&self) -> Option<&str> {
        self.prior
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(serde_json::Value::as_str)
    }
}

impl From<&LookupConfig> for LookupQuery {
    fn from(config: &LookupConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            owners: config.owners.clone(),
            filters: config.filters.clone(),
            most_recent: config.most_recent,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{step}")
    }
}
