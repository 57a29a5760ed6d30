//! Diff engine for comparing desired vs last-applied state.
//!
//! Desired properties are compared with the properties recorded in the
//! snapshot when the resource was last applied, never with provider
//! outputs. Each changed property is classified by its kind's policy.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::resource::{ChangePolicy, PropertyValue, ResourceKey};
use crate::state::{SnapshotEntry, StateSnapshot};

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// What has to happen to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Resource needs to be created.
    Create,
    /// Resource is modified in place.
    Update,
    /// Resource is destroyed and created again.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Property that differs.
    pub property: String,
    /// Recorded value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
    /// Whether the change forces a replacement.
    pub forces_replace: bool,
    /// The value references a resource that is being created or replaced,
    /// so it is only known after apply.
    pub known_after_apply: bool,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource identity.
    pub key: ResourceKey,
    /// Action to take.
    pub action: Action,
    /// Details about the changed properties.
    pub details: Vec<DiffDetail>,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Desired resources in declaration order, then removed resources in
    /// their recorded order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between the desired graph and the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ImmutablePropertyChanged`] if a property that is
    /// immutable once set would change.
    pub fn compute(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<DiffResult> {
        let mut actions: HashMap<&ResourceKey, Action> = HashMap::new();
        let mut by_order: Vec<Option<ResourceDiff>> = vec![None; graph.len()];

        // Dependencies first, so references to created or replaced nodes
        // are known when their dependents are compared.
        for node in graph.topological_nodes() {
            let diff = match snapshot.get(&node.key) {
                None => Self::create_diff(node),
                Some(entry) => Self::compare(node, entry, &actions)?,
            };
            debug!("{}: {}", node.key, diff.action);
            actions.insert(&node.key, diff.action);
            by_order[node.order] = Some(diff);
        }

        let mut result = DiffResult {
            diffs: by_order.into_iter().flatten().collect(),
            ..DiffResult::default()
        };

        for (key, _) in snapshot.entries_in_order() {
            if !graph.contains(key) {
                debug!("{key}: delete (removed from configuration)");
                result.diffs.push(ResourceDiff {
                    key: key.clone(),
                    action: Action::Delete,
                    details: Vec::new(),
                });
            }
        }

        for diff in &result.diffs {
            match diff.action {
                Action::Create => result.creates += 1,
                Action::Update => result.updates += 1,
                Action::Replace => result.replaces += 1,
                Action::Delete => result.deletes += 1,
                Action::NoOp => result.unchanged += 1,
            }
        }

        Ok(result)
    }

    fn create_diff(node: &ResourceNode) -> ResourceDiff {
        ResourceDiff {
            key: node.key.clone(),
            action: Action::Create,
            details: node
                .properties
                .iter()
                .map(|(property, value)| DiffDetail {
                    property: property.clone(),
                    old_value: None,
                    new_value: Some(value.to_string()),
                    forces_replace: false,
                    known_after_apply: value.as_reference().is_some(),
                })
                .collect(),
        }
    }

    fn compare(
        node: &ResourceNode,
        entry: &SnapshotEntry,
        actions: &HashMap<&ResourceKey, Action>,
    ) -> Result<ResourceDiff> {
        let schema = node.key.kind.schema();
        let names: BTreeSet<&String> = node
            .properties
            .keys()
            .chain(entry.properties.keys())
            .collect();

        let mut details = Vec::new();
        let mut replace = false;

        for name in names {
            let desired = node.properties.get(name);
            let recorded = entry.properties.get(name);

            let pending = desired
                .and_then(PropertyValue::as_reference)
                .is_some_and(|r| {
                    matches!(
                        actions.get(&r.path.target),
                        Some(Action::Create | Action::Replace)
                    )
                });
            if desired == recorded && !pending {
                continue;
            }

            let policy = schema
                .property(name)
                .map_or(ChangePolicy::UpdateInPlace, |p| p.policy);
            let forces_replace = match policy {
                ChangePolicy::Replace => true,
                ChangePolicy::UpdateInPlace => false,
                // Setting a previously unset value is allowed.
                ChangePolicy::Immutable if recorded.is_none() => false,
                ChangePolicy::Immutable => {
                    return Err(PlanError::ImmutablePropertyChanged {
                        resource: node.key.clone(),
                        property: name.clone(),
                    }
                    .into());
                }
            };
            replace |= forces_replace;

            details.push(DiffDetail {
                property: name.clone(),
                old_value: recorded.map(ToString::to_string),
                new_value: desired.map(ToString::to_string),
                forces_replace,
                known_after_apply: pending,
            });
        }

        let action = if replace {
            Action::Replace
        } else if details.is_empty() {
            Action::NoOp
        } else {
            Action::Update
        };

        Ok(ResourceDiff {
            key: node.key.clone(),
            action,
            details,
        })
    }
}

impl DiffResult {
    /// Returns true if any resource changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Looks up the diff for a resource.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.key == key)
    }

    /// Returns the action for a resource, `NoOp` if unknown.
    #[must_use]
    pub fn action_of(&self, key: &ResourceKey) -> Action {
        self.get(key).map_or(Action::NoOp, |d| d.action)
    }
}

impl ResourceDiff {
    /// Names of the changed properties.
    #[must_use]
    pub fn changed(&self) -> Vec<&str> {
        self.details.iter().map(|d| d.property.as_str()).collect()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{action}")
    }
}
