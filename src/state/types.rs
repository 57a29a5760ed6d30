//! State types for tracking applied resources.
//!
//! A [`StateSnapshot`] is the last committed picture of what exists: one
//! [`SnapshotEntry`] per logical resource with its provider-assigned id,
//! the desired properties it was applied with and its resolved outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::resource::{Attributes, PropertyValue, ResourceKey, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of runs kept in the history.
pub const MAX_HISTORY: usize = 100;

/// The complete committed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: u32,
    /// Incremented on every commit.
    pub serial: u64,
    /// Identifies a chain of snapshots descending from one initial state.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Fingerprint of the last fully converged desired graph.
    #[serde(default)]
    pub fingerprint: String,
    /// Applied resources keyed by `<kind>.<name>`.
    #[serde(default)]
    pub resources: BTreeMap<ResourceKey, SnapshotEntry>,
    /// Superseded objects whose delete has not been confirmed yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedObject>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// State of a single applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name.
    pub name: String,
    /// Provider-assigned id.
    pub id: String,
    /// Declaration order when last applied.
    pub order: usize,
    /// Desired properties as last applied, references unresolved.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Resolved output attributes.
    #[serde(default)]
    pub outputs: Attributes,
    /// Resources this one referenced when last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An object replaced by a newer one for the same key but still present
/// at the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeposedObject {
    /// Logical resource the object used to back.
    pub key: ResourceKey,
    /// Provider-assigned id.
    pub id: String,
    /// Outputs of the object when it was superseded.
    #[serde(default)]
    pub outputs: Attributes,
    /// When the replacement was recorded.
    pub deposed_at: DateTime<Utc>,
}

/// How a committed run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every operation succeeded.
    Complete,
    /// Some operations failed or were skipped.
    Partial,
    /// The run was cancelled before every operation started.
    Cancelled,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: String,
    /// When the run was committed.
    pub timestamp: DateTime<Utc>,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Fingerprint of the desired graph the run applied.
    pub fingerprint: String,
    /// Resources changed by the run.
    pub changed: Vec<String>,
    /// Resources that failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            fingerprint: String::new(),
            resources: BTreeMap::new(),
            deposed: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets an entry by key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&SnapshotEntry> {
        self.resources.get(key)
    }

    /// Adds or replaces an entry.
    pub fn upsert(&mut self, key: ResourceKey, entry: SnapshotEntry) {
        self.resources.insert(key, entry);
        self.last_updated = Utc::now();
    }

    /// Removes an entry by key.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<SnapshotEntry> {
        let result = self.resources.remove(key);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Records a superseded object until its delete is confirmed.
    pub fn depose(&mut self, key: ResourceKey, entry: &SnapshotEntry) {
        if self.deposed.iter().any(|d| d.key == key && d.id == entry.id) {
            return;
        }
        self.deposed.push(DeposedObject {
            key,
            id: entry.id.clone(),
            outputs: entry.outputs.clone(),
            deposed_at: Utc::now(),
        });
        self.last_updated = Utc::now();
    }

    /// Gets a deposed object by key and id.
    #[must_use]
    pub fn get_deposed(&self, key: &ResourceKey, id: &str) -> Option<&DeposedObject> {
        self.deposed.iter().find(|d| &d.key == key && d.id == id)
    }

    /// Forgets a deposed object once it is gone.
    pub fn remove_deposed(&mut self, key: &ResourceKey, id: &str) -> Option<DeposedObject> {
        let pos = self.deposed.iter().position(|d| &d.key == key && d.id == id)?;
        self.last_updated = Utc::now();
        Some(self.deposed.remove(pos))
    }

    /// Returns the number of recorded resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns entries in their recorded declaration order.
    #[must_use]
    pub fn entries_in_order(&self) -> Vec<(&ResourceKey, &SnapshotEntry)> {
        let mut entries: Vec<_> = self.resources.iter().collect();
        entries.sort_by(|a, b| a.1.order.cmp(&b.1.order).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// Returns the recorded resources that depended on `key`.
    #[must_use]
    pub fn dependents_of(&self, key: &ResourceKey) -> Vec<&ResourceKey> {
        self.resources
            .iter()
            .filter(|(_, e)| e.dependencies.contains(key))
            .map(|(k, _)| k)
            .collect()
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{outcome}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: ResourceKind, name: &str, order: usize, deps: Vec<ResourceKey>) -> SnapshotEntry {
        let now = Utc::now();
        SnapshotEntry {
            kind,
            name: name.to_string(),
            id: format!("{}-{name}", kind.id_prefix()),
            order,
            properties: BTreeMap::new(),
            outputs: Attributes::new(),
            dependencies: deps,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_serialized_layout_is_keyed_by_logical_name() {
        let mut snapshot = StateSnapshot::new("lab", "dev");
        let key = ResourceKey::new(ResourceKind::Vpc, "main");
        snapshot.upsert(key, entry(ResourceKind::Vpc, "main", 0, vec![]));

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["version"], 1);
        assert_eq!(json["resources"]["vpc.main"]["id"], "vpc-main");

        assert!(json.get("deposed").is_none());

        let parsed: StateSnapshot = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_deposed_objects_are_tracked_by_id() {
        let key = ResourceKey::new(ResourceKind::Instance, "box");
        let old = entry(ResourceKind::Instance, "box", 0, vec![]);
        let mut snapshot = StateSnapshot::new("lab", "dev");

        snapshot.depose(key.clone(), &old);
        snapshot.depose(key.clone(), &old);
        assert_eq!(snapshot.deposed.len(), 1);
        assert_eq!(snapshot.get_deposed(&key, "i-box").map(|d| d.id.as_str()), Some("i-box"));

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["deposed"][0]["key"], "instance.box");
        let parsed: StateSnapshot = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.deposed, snapshot.deposed);

        assert!(snapshot.remove_deposed(&key, "i-other").is_none());
        assert!(snapshot.remove_deposed(&key, "i-box").is_some());
        assert!(snapshot.deposed.is_empty());
    }

    #[test]
    fn test_entries_in_order_and_dependents() {
        let vpc = ResourceKey::new(ResourceKind::Vpc, "main");
        let mut snapshot = StateSnapshot::new("lab", "dev");
        snapshot.upsert(
            ResourceKey::new(ResourceKind::Subnet, "a"),
            entry(ResourceKind::Subnet, "a", 1, vec![vpc.clone()]),
        );
        snapshot.upsert(vpc.clone(), entry(ResourceKind::Vpc, "main", 0, vec![]));

        let order: Vec<String> = snapshot
            .entries_in_order()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(order, vec!["vpc.main", "subnet.a"]);
        assert_eq!(
            snapshot.dependents_of(&vpc),
            vec![&ResourceKey::new(ResourceKind::Subnet, "a")]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("lab", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(RunHistoryEntry {
                run_id: i.to_string(),
                timestamp: Utc::now(),
                outcome: RunOutcome::Complete,
                fingerprint: String::new(),
                changed: vec![],
                failed: vec![],
                error: None,
            });
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].run_id, "5");
    }
}
