//! Configuration types for a lab topology.
//!
//! This module defines the structs that map to the `v6lab.yaml` file. The
//! file fully describes the desired state: resources, the lookups and
//! variables they use, and how the engine should converge them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{PropertyValue, ResourceKey, ResourceKind};

/// The root configuration structure for a topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State storage configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Input variables. A `null` value marks a variable that must be
    /// provided through the environment.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Read-only lookups resolved before planning.
    #[serde(default)]
    pub lookups: Vec<LookupConfig>,
    /// Resource declarations, in order.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Settings for the bundled simulated provider.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "lab").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding the state file, relative to the config file.
    #[serde(default)]
    pub path: Option<String>,
}

/// Execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum operations in flight. Defaults to available parallelism.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// A read-only lookup, such as finding the newest machine image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupConfig {
    /// Name used by `{ lookup: <name> }` values.
    pub name: String,
    /// Kind of object looked up.
    #[serde(default)]
    pub kind: LookupKind,
    /// Accepted owner account ids. Empty accepts any owner.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Attribute filters; each attribute must match one of the patterns.
    /// Patterns may use `*` as a wildcard.
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
    /// Pick the most recent candidate when several match.
    #[serde(default = "default_true")]
    pub most_recent: bool,
}

/// Kinds of lookups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    /// Machine image.
    #[default]
    Image,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name, unique within the kind.
    pub name: String,
    /// Desired properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Settings for the simulated provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Machine images the simulated provider can find.
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

/// A machine image known to the simulated provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    /// Image id.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Owner account id.
    pub owner: String,
    /// CPU architecture (`x86_64`, `arm64`).
    pub architecture: String,
    /// Creation date, ISO 8601. Compared lexicographically.
    pub creation_date: String,
}

fn default_environment() -> String {
    String::from("lab")
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ResourceDeclaration {
    /// Returns the declaration's logical identity.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.name.clone())
    }
}

impl TopologyConfig {
    /// Returns the number of declared resources of a kind.
    #[must_use]
    pub fn count_of(&self, kind: ResourceKind) -> usize {
        self.resources.iter().filter(|r| r.kind == kind).count()
    }
}
