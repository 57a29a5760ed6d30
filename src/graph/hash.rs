//! Graph fingerprinting for change detection.
//!
//! The fingerprint is recorded in the state snapshot so `plan` can say
//! whether the desired graph changed since the last committed run.

use sha2::{Digest, Sha256};

use super::builder::{ResourceGraph, ResourceNode};

/// Hasher for computing desired-graph fingerprints.
#[derive(Debug, Default)]
pub struct GraphHasher;

impl GraphHasher {
    /// Creates a new graph hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole desired graph.
    ///
    /// Independent of declaration order: nodes are hashed sorted by key.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut nodes: Vec<&ResourceNode> = graph.nodes().iter().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut hasher = Sha256::new();
        for node in nodes {
            hasher.update(self.hash_node(node).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single node's identity and desired properties.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();
        hasher.update(node.key.to_string().as_bytes());
        hasher.update([0]);

        // BTreeMap iteration and serde_json objects are both key-sorted.
        for (name, value) in &node.properties {
            hasher.update(name.as_bytes());
            hasher.update([b'=']);
            hasher.update(
                serde_json::to_string(value)
                    .unwrap_or_default()
                    .as_bytes(),
            );
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    /// Returns a short form of a hash for display.
    #[must_use]
    pub fn short(hash: &str) -> &str {
        &hash[..8.min(hash.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::graph::GraphBuilder;
    use crate::resource::{PropertyValue, ResourceKind};
    use std::collections::BTreeMap;

    fn vpc(name: &str, cidr: &str) -> ResourceDeclaration {
        ResourceDeclaration {
            kind: ResourceKind::Vpc,
            name: name.to_string(),
            properties: BTreeMap::from([(
                String::from("cidr_block"),
                PropertyValue::literal(cidr),
            )]),
        }
    }

    #[test]
    fn test_hash_is_deterministic_and_order_independent() {
        let hasher = GraphHasher::new();
        let a = GraphBuilder::new()
            .declare(vpc("a", "10.0.0.0/16"))
            .declare(vpc("b", "10.1.0.0/16"))
            .build()
            .expect("build");
        let b = GraphBuilder::new()
            .declare(vpc("b", "10.1.0.0/16"))
            .declare(vpc("a", "10.0.0.0/16"))
            .build()
            .expect("build");

        assert_eq!(hasher.hash_graph(&a), hasher.hash_graph(&b));
        assert_eq!(hasher.hash_graph(&a).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_properties() {
        let hasher = GraphHasher::new();
        let a = GraphBuilder::new()
            .declare(vpc("a", "10.0.0.0/16"))
            .build()
            .expect("build");
        let b = GraphBuilder::new()
            .declare(vpc("a", "10.2.0.0/16"))
            .build()
            .expect("build");

        assert_ne!(hasher.hash_graph(&a), hasher.hash_graph(&b));
    }

    #[test]
    fn test_short() {
        assert_eq!(GraphHasher::short("0123456789abcdef"), "01234567");
        assert_eq!(GraphHasher::short("abc"), "abc");
    }
}
