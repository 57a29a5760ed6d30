//! Folding execution outcomes into the next snapshot.
//!
//! The committer works on a copy of the snapshot loaded at the start of the
//! run. Only confirmed successes change it, so a partial or cancelled run
//! still produces a snapshot that matches what exists. An object superseded
//! by a create-before-destroy replacement stays listed as deposed until its
//! delete is confirmed.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, V6labError};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::planner::{Action, OperationOutcome, OutcomeResult};
use crate::provider::Step;
use crate::resource::{Attributes, ResourceKey};

use super::types::{RunHistoryEntry, RunOutcome, SnapshotEntry, StateSnapshot};

/// Builds the snapshot committed at the end of a run.
#[derive(Debug)]
pub struct StateCommitter<'a> {
    graph: &'a ResourceGraph,
    working: StateSnapshot,
    created: HashSet<ResourceKey>,
    superseded: HashMap<ResourceKey, String>,
    changed: Vec<String>,
    failed: Vec<String>,
}

impl<'a> StateCommitter<'a> {
    /// Starts from the snapshot the run was planned against.
    #[must_use]
    pub fn new(graph: &'a ResourceGraph, base: StateSnapshot) -> Self {
        Self {
            graph,
            working: base,
            created: HashSet::new(),
            superseded: HashMap::new(),
            changed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Records outcomes until the executor drops its sender.
    pub async fn consume(&mut self, mut events: UnboundedReceiver<OperationOutcome>) {
        while let Some(outcome) = events.recv().await {
            self.record(&outcome);
        }
    }

    /// Records a single outcome.
    pub fn record(&mut self, outcome: &OperationOutcome) {
        let outputs = match &outcome.result {
            OutcomeResult::Succeeded { outputs } => outputs,
            OutcomeResult::Failed { .. } => {
                self.failed.push(outcome.key.to_string());
                return;
            }
            OutcomeResult::Skipped { .. } | OutcomeResult::NotStarted => return,
        };

        let key = &outcome.key;
        match (outcome.step, &outcome.deposed) {
            (Step::Delete, Some(id)) => {
                if self.working.remove_deposed(key, id).is_some() {
                    debug!("{key}: deposed object {id} deleted");
                }
            }
            (Step::Create, _) => {
                if let Some(entry) = self.entry_for(key, outputs, None) {
                    if outcome.action == Action::Replace {
                        if let Some(old) = self.working.get(key).cloned() {
                            debug!("{key}: {} deposed by {}", old.id, entry.id);
                            self.working.depose(key.clone(), &old);
                            self.superseded.insert(key.clone(), old.id);
                        }
                    }
                    self.working.upsert(key.clone(), entry);
                    self.created.insert(key.clone());
                }
            }
            (Step::Update, _) => {
                let created_at = self.working.get(key).map(|e| e.created_at);
                if let Some(entry) = self.entry_for(key, outputs, created_at) {
                    self.working.upsert(key.clone(), entry);
                }
            }
            (Step::Delete, None) => {
                if let Some(old_id) = self.superseded.get(key) {
                    self.working.remove_deposed(key, old_id);
                    debug!("{key}: superseded object {old_id} deleted");
                } else if self.created.contains(key) {
                    debug!("{key}: superseded object deleted");
                } else {
                    self.working.remove(key);
                }
            }
        }

        if outcome.action != Action::Replace || outcome.step == Step::Create {
            self.changed.push(key.to_string());
        }
    }

    fn entry_for(
        &self,
        key: &ResourceKey,
        outputs: &Attributes,
        created_at: Option<chrono::DateTime<Utc>>,
    ) -> Option<SnapshotEntry> {
        let Some(node) = self.graph.node(key) else {
            warn!("{key}: applied but no longer declared");
            return None;
        };
        let Some(id) = outputs.get("id").and_then(serde_json::Value::as_str) else {
            warn!("{key}: applied without an id");
            return None;
        };
        let now = Utc::now();
        Some(SnapshotEntry {
            kind: key.kind,
            name: key.name.clone(),
            id: id.to_string(),
            order: node.order,
            properties: node.properties.clone(),
            outputs: outputs.clone(),
            dependencies: self.graph.dependencies(key).into_iter().cloned().collect(),
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        })
    }

    fn refresh(&self, node: &ResourceNode, mut entry: SnapshotEntry) -> SnapshotEntry {
        entry.order = node.order;
        entry.properties.clone_from(&node.properties);
        entry.dependencies = self.graph.dependencies(&node.key).into_iter().cloned().collect();
        entry
    }

    /// Produces the snapshot to commit.
    ///
    /// A complete run is rebuilt strictly from the graph and takes the new
    /// fingerprint. Any other run keeps the merged snapshot and the previous
    /// fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a complete run left a declared resource
    /// without an entry.
    pub fn finish(
        mut self,
        outcome: RunOutcome,
        fingerprint: &str,
        error: Option<String>,
    ) -> Result<StateSnapshot> {
        if outcome == RunOutcome::Complete {
            let mut previous = std::mem::take(&mut self.working.resources);
            for node in self.graph.nodes() {
                let entry = previous.remove(&node.key).ok_or_else(|| {
                    V6labError::internal(format!("{} has no recorded object after a complete run", node.key))
                })?;
                let entry = self.refresh(node, entry);
                self.working.resources.insert(node.key.clone(), entry);
            }
            for stale in previous.keys() {
                warn!("{stale}: dropping entry that is no longer declared");
            }
            self.working.fingerprint = fingerprint.to_string();
        }

        let mut snapshot = self.working;
        snapshot.serial += 1;
        snapshot.last_updated = Utc::now();
        snapshot.add_history(RunHistoryEntry {
            run_id: Uuid::new_v4().to_string(),
            timestamp: snapshot.last_updated,
            outcome,
            fingerprint: fingerprint.to_string(),
            changed: self.changed,
            failed: self.failed,
            error,
        });
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::graph::GraphBuilder;
    use crate::resource::{PropertyValue, ResourceKind};
    use serde_json::json;

    fn graph() -> ResourceGraph {
        GraphBuilder::new()
            .declare(ResourceDeclaration {
                kind: ResourceKind::Vpc,
                name: String::from("lab"),
                properties: [(String::from("cidr_block"), PropertyValue::literal("10.0.0.0/16"))]
                    .into_iter()
                    .collect(),
            })
            .declare(ResourceDeclaration {
                kind: ResourceKind::InternetGateway,
                name: String::from("gw"),
                properties: Default::default(),
            })
            .build()
            .expect("build")
    }

    fn vpc() -> ResourceKey {
        ResourceKey::new(ResourceKind::Vpc, "lab")
    }

    fn gw() -> ResourceKey {
        ResourceKey::new(ResourceKind::InternetGateway, "gw")
    }

    fn outcome(index: usize, key: ResourceKey, action: Action, step: Step, result: OutcomeResult) -> OperationOutcome {
        OperationOutcome {
            index,
            key,
            action,
            step,
            deposed: None,
            attempts: 1,
            result,
        }
    }

    fn failed(message: &str) -> OutcomeResult {
        OutcomeResult::Failed {
            error: crate::error::ProviderError::rejected(message).into(),
        }
    }

    /// A snapshot where both resources were applied by an earlier run.
    fn converged(graph: &ResourceGraph) -> StateSnapshot {
        let mut seed = StateCommitter::new(graph, StateSnapshot::new("lab", "dev"));
        seed.record(&outcome(0, vpc(), Action::Create, Step::Create, succeeded("vpc-1")));
        seed.record(&outcome(1, gw(), Action::Create, Step::Create, succeeded("igw-1")));
        seed.finish(RunOutcome::Complete, "abc", None).expect("seed")
    }

    fn succeeded(id: &str) -> OutcomeResult {
        OutcomeResult::Succeeded {
            outputs: [(String::from("id"), json!(id))].into_iter().collect(),
        }
    }

    #[test]
    fn test_complete_run_takes_fingerprint() {
        let graph = graph();
        let mut committer = StateCommitter::new(&graph, StateSnapshot::new("lab", "dev"));
        committer.record(&outcome(0, vpc(), Action::Create, Step::Create, succeeded("vpc-1")));
        committer.record(&outcome(1, gw(), Action::Create, Step::Create, succeeded("igw-1")));

        let snapshot = committer.finish(RunOutcome::Complete, "abc", None).expect("finish");
        assert_eq!(snapshot.serial, 1);
        assert_eq!(snapshot.fingerprint, "abc");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&vpc()).map(|e| e.id.as_str()), Some("vpc-1"));
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.history[0].changed, vec!["vpc.lab", "internet_gateway.gw"]);
    }

    #[test]
    fn test_partial_run_keeps_old_fingerprint() {
        let graph = graph();
        let mut base = StateSnapshot::new("lab", "dev");
        base.fingerprint = String::from("old");
        let mut committer = StateCommitter::new(&graph, base);
        committer.record(&outcome(0, vpc(), Action::Create, Step::Create, succeeded("vpc-1")));
        committer.record(&outcome(
            1,
            gw(),
            Action::Create,
            Step::Create,
            OutcomeResult::Failed {
                error: crate::error::ProviderError::rejected("quota").into(),
            },
        ));

        let snapshot = committer
            .finish(RunOutcome::Partial, "new", Some(String::from("1 failed")))
            .expect("finish");
        assert_eq!(snapshot.fingerprint, "old");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&gw()).is_none());
        assert_eq!(snapshot.history[0].failed, vec!["internet_gateway.gw"]);
        assert_eq!(snapshot.history[0].outcome, RunOutcome::Partial);
    }

    #[test]
    fn test_complete_run_with_missing_entry_is_an_error() {
        let graph = graph();
        let mut committer = StateCommitter::new(&graph, StateSnapshot::new("lab", "dev"));
        committer.record(&outcome(0, vpc(), Action::Create, Step::Create, succeeded("vpc-1")));

        assert!(committer.finish(RunOutcome::Complete, "abc", None).is_err());
    }

    #[test]
    fn test_delete_after_replacement_keeps_new_object() {
        let graph = graph();
        let mut committer = StateCommitter::new(&graph, StateSnapshot::new("lab", "dev"));
        committer.record(&outcome(0, vpc(), Action::Replace, Step::Create, succeeded("vpc-2")));
        committer.record(&outcome(1, vpc(), Action::Replace, Step::Delete, succeeded("vpc-1")));

        let snapshot = committer.finish(RunOutcome::Partial, "abc", None).expect("finish");
        assert_eq!(snapshot.get(&vpc()).map(|e| e.id.as_str()), Some("vpc-2"));
        assert_eq!(snapshot.history[0].changed, vec!["vpc.lab"]);
    }

    #[test]
    fn test_delete_removes_entry() {
        let graph = graph();
        let mut seed = StateCommitter::new(&graph, StateSnapshot::new("lab", "dev"));
        seed.record(&outcome(0, gw(), Action::Create, Step::Create, succeeded("igw-1")));
        let base = seed.finish(RunOutcome::Partial, "abc", None).expect("seed");

        let mut committer = StateCommitter::new(&graph, base);
        committer.record(&outcome(
            0,
            gw(),
            Action::Delete,
            Step::Delete,
            OutcomeResult::Succeeded {
                outputs: Attributes::new(),
            },
        ));
        let snapshot = committer.finish(RunOutcome::Partial, "abc", None).expect("finish");
        assert!(snapshot.get(&gw()).is_none());
        assert_eq!(snapshot.serial, 2);
        assert_eq!(snapshot.history.len(), 2);
    }

    #[test]
    fn test_failed_delete_of_replaced_object_keeps_it_deposed() {
        let graph = graph();
        let mut committer = StateCommitter::new(&graph, converged(&graph));
        committer.record(&outcome(0, vpc(), Action::Replace, Step::Create, succeeded("vpc-2")));
        committer.record(&outcome(1, vpc(), Action::Replace, Step::Delete, failed("in use")));

        let snapshot = committer.finish(RunOutcome::Partial, "def", None).expect("finish");
        assert_eq!(snapshot.get(&vpc()).map(|e| e.id.as_str()), Some("vpc-2"));
        assert_eq!(snapshot.deposed.len(), 1);
        assert_eq!(snapshot.deposed[0].key, vpc());
        assert_eq!(snapshot.deposed[0].id, "vpc-1");
        assert_eq!(snapshot.deposed[0].outputs["id"], json!("vpc-1"));
    }

    #[test]
    fn test_confirmed_delete_of_replaced_object_clears_it() {
        let graph = graph();
        let mut committer = StateCommitter::new(&graph, converged(&graph));
        committer.record(&outcome(0, vpc(), Action::Replace, Step::Create, succeeded("vpc-2")));
        committer.record(&outcome(
            1,
            vpc(),
            Action::Replace,
            Step::Delete,
            OutcomeResult::Succeeded {
                outputs: Attributes::new(),
            },
        ));

        let snapshot = committer.finish(RunOutcome::Complete, "def", None).expect("finish");
        assert_eq!(snapshot.get(&vpc()).map(|e| e.id.as_str()), Some("vpc-2"));
        assert!(snapshot.deposed.is_empty());
    }

    #[test]
    fn test_deposed_delete_leaves_live_entry() {
        let graph = graph();
        let mut base = converged(&graph);
        let old = base.get(&vpc()).cloned().expect("vpc");
        base.depose(vpc(), &old);
        if let Some(entry) = base.resources.get_mut(&vpc()) {
            entry.id = String::from("vpc-2");
        }

        let mut deleted = outcome(
            0,
            vpc(),
            Action::Delete,
            Step::Delete,
            OutcomeResult::Succeeded {
                outputs: Attributes::new(),
            },
        );
        deleted.deposed = Some(String::from("vpc-1"));

        let mut committer = StateCommitter::new(&graph, base);
        committer.record(&deleted);
        let snapshot = committer.finish(RunOutcome::Complete, "abc", None).expect("finish");
        assert!(snapshot.deposed.is_empty());
        assert_eq!(snapshot.get(&vpc()).map(|e| e.id.as_str()), Some("vpc-2"));
        assert_eq!(snapshot.len(), 2);
    }
}
