//! Graph construction from resource declarations.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::config::ResourceDeclaration;
use crate::error::{BuildError, PlanError, Result};
use crate::resource::{PropertyValue, ResourceKey};

use super::cycle::topological_order;

/// A desired resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical identity.
    pub key: ResourceKey,
    /// Position in the declaration list.
    pub order: usize,
    /// Desired properties with lookups and variables substituted.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// "`from`'s property `property` references an output of `to`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Dependent resource.
    pub from: ResourceKey,
    /// Dependency.
    pub to: ResourceKey,
    /// Property holding the reference.
    pub property: String,
}

/// Immutable, acyclic desired-state graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceKey, usize>,
    edges: Vec<Edge>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

/// Accumulates declarations into a [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    declarations: Vec<ResourceDeclaration>,
    lookups: BTreeMap<String, String>,
    variables: BTreeMap<String, serde_json::Value>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provides resolved lookup ids, keyed by lookup name.
    #[must_use]
    pub fn with_lookups(mut self, lookups: BTreeMap<String, String>) -> Self {
        self.lookups = lookups;
        self
    }

    /// Provides variable values. A `null` value counts as unset.
    #[must_use]
    pub fn with_variables(mut self, variables: BTreeMap<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Adds a declaration.
    #[must_use]
    pub fn declare(mut self, declaration: ResourceDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Adds several declarations, keeping their order.
    #[must_use]
    pub fn declare_all(mut self, declarations: impl IntoIterator<Item = ResourceDeclaration>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] for duplicate names, schema violations,
    /// unresolved lookups or variables and dangling references, and
    /// [`PlanError::CycleDetected`] if the references form a cycle.
    pub fn build(self) -> Result<ResourceGraph> {
        let mut seen: HashSet<ResourceKey> = HashSet::new();
        for decl in &self.declarations {
            if decl.name.is_empty() || decl.name.contains('.') {
                return Err(BuildError::InvalidName {
                    kind: decl.kind.to_string(),
                    name: decl.name.clone(),
                }
                .into());
            }
            if !seen.insert(decl.key()) {
                return Err(BuildError::DuplicateName {
                    kind: decl.kind.to_string(),
                    name: decl.name.clone(),
                }
                .into());
            }
        }

        let mut nodes = Vec::with_capacity(self.declarations.len());
        for (order, decl) in self.declarations.iter().enumerate() {
            nodes.push(self.build_node(order, decl)?);
        }

        let index: HashMap<ResourceKey, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.key.clone(), i))
            .collect();

        let mut edges = Vec::new();
        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for (property, value) in &node.properties {
                let Some(reference) = value.as_reference() else {
                    continue;
                };
                let target = &reference.path.target;
                let Some(&target_idx) = index.get(target) else {
                    return Err(BuildError::DanglingReference {
                        resource: node.key.clone(),
                        property: property.clone(),
                        target: target.clone(),
                    }
                    .into());
                };
                if !target.kind.schema().has_output(&reference.path.attribute) {
                    return Err(BuildError::UnknownAttribute {
                        resource: node.key.clone(),
                        property: property.clone(),
                        target: target.clone(),
                        attribute: reference.path.attribute.clone(),
                    }
                    .into());
                }
                dependencies[i].insert(target_idx);
                edges.push(Edge {
                    from: node.key.clone(),
                    to: target.clone(),
                    property: property.clone(),
                });
            }
        }

        let dependencies: Vec<Vec<usize>> = dependencies
            .into_iter()
            .map(|d| d.into_iter().collect())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        if let Err(cycle) = topological_order(&dependencies, |i| i) {
            return Err(PlanError::CycleDetected {
                cycle: cycle.iter().map(|&i| nodes[i].key.to_string()).collect(),
            }
            .into());
        }

        debug!(
            "Built resource graph: {} nodes, {} edges",
            nodes.len(),
            edges.len()
        );

        Ok(ResourceGraph {
            nodes,
            index,
            edges,
            dependencies,
            dependents,
        })
    }

    /// Checks one declaration against its kind's schema and substitutes
    /// lookups and variables.
    fn build_node(&self, order: usize, decl: &ResourceDeclaration) -> Result<ResourceNode> {
        let key = decl.key();
        let schema = decl.kind.schema();

        if let Some(property) = decl.properties.keys().find(|p| schema.property(p).is_none()) {
            return Err(BuildError::UnknownProperty {
                resource: key,
                property: property.clone(),
            }
            .into());
        }
        if let Some(spec) = schema
            .properties
            .iter()
            .find(|p| p.required && !decl.properties.contains_key(p.name))
        {
            return Err(BuildError::MissingProperty {
                resource: key,
                property: spec.name.to_string(),
            }
            .into());
        }

        let mut properties = BTreeMap::new();
        for (property, value) in &decl.properties {
            let resolved = match value {
                PropertyValue::Lookup(l) => match self.lookups.get(&l.lookup) {
                    Some(id) => PropertyValue::literal(id.clone()),
                    None => {
                        return Err(BuildError::UnresolvedLookup {
                            resource: key,
                            property: property.clone(),
                            lookup: l.lookup.clone(),
                        }
                        .into());
                    }
                },
                PropertyValue::Variable(v) => match self.variables.get(&v.var) {
                    Some(value) if !value.is_null() => PropertyValue::Literal(value.clone()),
                    _ => {
                        return Err(BuildError::UnresolvedVariable {
                            resource: key,
                            property: property.clone(),
                            variable: v.var.clone(),
                        }
                        .into());
                    }
                },
                other => other.clone(),
            };
            properties.insert(property.clone(), resolved);
        }

        Ok(ResourceNode {
            key,
            order,
            properties,
        })
    }
}

impl ResourceGraph {
    /// Returns the number of nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns all nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns all edges.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Looks up a node by key.
    #[must_use]
    pub fn node(&self, key: &ResourceKey) -> Option<&ResourceNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph contains the key.
    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the keys `key` depends on.
    #[must_use]
    pub fn dependencies(&self, key: &ResourceKey) -> Vec<&ResourceKey> {
        self.index.get(key).map_or_else(Vec::new, |&i| {
            self.dependencies[i].iter().map(|&d| &self.nodes[d].key).collect()
        })
    }

    /// Returns the keys that depend on `key`.
    #[must_use]
    pub fn dependents(&self, key: &ResourceKey) -> Vec<&ResourceKey> {
        self.index.get(key).map_or_else(Vec::new, |&i| {
            self.dependents[i].iter().map(|&d| &self.nodes[d].key).collect()
        })
    }

    /// Returns the nodes so that every node follows its dependencies, ties
    /// broken by declaration order.
    #[must_use]
    pub fn topological_nodes(&self) -> Vec<&ResourceNode> {
        // Acyclicity is checked by the builder.
        topological_order(&self.dependencies, |i| i)
            .unwrap_or_else(|_| (0..self.nodes.len()).collect())
            .into_iter()
            .map(|i| &self.nodes[i])
            .collect()
    }
}
