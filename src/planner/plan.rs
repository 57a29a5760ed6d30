//! Execution plan types and construction.
//!
//! A [`Plan`] is a partial order of provider steps. Ordering rules:
//! - a create or update runs after every operation creating or updating a
//!   resource it references;
//! - a delete runs after the deletes of every resource that referenced the
//!   deleted object, and after those resources were re-pointed, unless the
//!   object is being replaced destroy-first;
//! - a replacement creates before destroying when the kind allows both
//!   objects to exist at once, otherwise destroys first.
//!
//! Destroy-first replacement is contagious: a replaced resource that
//! depends on a destroy-first replacement is replaced destroy-first too, so
//! the old chain is torn down leaf-first before the new one is built.
//!
//! Objects left deposed by a previous run get a delete of their own, ordered
//! after the dependents that may still point at them.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::graph::{ResourceGraph, topological_order};
use crate::provider::Step;
use crate::resource::ResourceKey;
use crate::state::StateSnapshot;

use super::diff::{Action, DiffResult};

/// How a replacement is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Create the new object, re-point dependents, then delete the old one.
    CreateBeforeDestroy,
    /// Delete the old object, then create the new one.
    DestroyFirst,
}

/// A single planned provider step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Position in the plan.
    pub index: usize,
    /// Resource the step applies to.
    pub key: ResourceKey,
    /// Diff action this step belongs to.
    pub action: Action,
    /// Provider step.
    pub step: Step,
    /// Changed properties.
    pub changed: Vec<String>,
    /// Replacement strategy, for the two steps of a replace.
    pub strategy: Option<ReplaceStrategy>,
    /// Indices of operations that must complete first. Always lower than
    /// `index`.
    pub depends_on: Vec<usize>,
    /// Provider id of the deposed object this delete targets.
    pub deposed: Option<String>,
}

/// Counts per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Resources to create.
    pub creates: usize,
    /// Resources to update in place.
    pub updates: usize,
    /// Resources to replace.
    pub replaces: usize,
    /// Resources to delete.
    pub deletes: usize,
    /// Unchanged resources.
    pub unchanged: usize,
    /// Deposed objects to delete.
    pub deposed: usize,
}

/// A complete execution plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Operations in a valid execution order.
    pub operations: Vec<Operation>,
    /// Counts per action.
    pub summary: PlanSummary,
}

/// Operation under construction, before ordering.
struct Draft {
    key: ResourceKey,
    action: Action,
    step: Step,
    changed: Vec<String>,
    strategy: Option<ReplaceStrategy>,
    rank: (usize, u8),
    depends_on: BTreeSet<usize>,
    deposed: Option<String>,
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CycleDetected`] if no valid order exists.
    pub fn build(diff: &DiffResult, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Self> {
        let destroy_first = Self::destroy_first_set(diff, graph, snapshot);

        let mut drafts: Vec<Draft> = Vec::new();
        let mut create_side: HashMap<&ResourceKey, usize> = HashMap::new();
        let mut delete_side: HashMap<&ResourceKey, usize> = HashMap::new();

        for resource in &diff.diffs {
            let key = &resource.key;
            let base = graph.node(key).map_or_else(
                || graph.len() + snapshot.get(key).map_or(0, |e| e.order),
                |n| n.order,
            );
            let changed: Vec<String> = resource.changed().into_iter().map(String::from).collect();
            let mut push = |step: Step, strategy: Option<ReplaceStrategy>, sub: u8| {
                drafts.push(Draft {
                    key: key.clone(),
                    action: resource.action,
                    step,
                    changed: changed.clone(),
                    strategy,
                    rank: (base, sub),
                    depends_on: BTreeSet::new(),
                    deposed: None,
                });
                drafts.len() - 1
            };

            match resource.action {
                Action::NoOp => {}
                Action::Create => {
                    create_side.insert(key, push(Step::Create, None, 0));
                }
                Action::Update => {
                    create_side.insert(key, push(Step::Update, None, 0));
                }
                Action::Delete => {
                    delete_side.insert(key, push(Step::Delete, None, 0));
                }
                Action::Replace if destroy_first.contains(key) => {
                    let strategy = Some(ReplaceStrategy::DestroyFirst);
                    let delete = push(Step::Delete, strategy, 0);
                    let create = push(Step::Create, strategy, 1);
                    drafts[create].depends_on.insert(delete);
                    delete_side.insert(key, delete);
                    create_side.insert(key, create);
                }
                Action::Replace => {
                    let strategy = Some(ReplaceStrategy::CreateBeforeDestroy);
                    let create = push(Step::Create, strategy, 0);
                    let delete = push(Step::Delete, strategy, 1);
                    drafts[delete].depends_on.insert(create);
                    delete_side.insert(key, delete);
                    create_side.insert(key, create);
                }
            }
        }

        // Create-before-use.
        for (&key, &op) in &create_side {
            for dep in graph.dependencies(key) {
                if let Some(&dep_op) = create_side.get(dep) {
                    drafts[op].depends_on.insert(dep_op);
                }
            }
        }

        // Delete-after-disuse, using the dependencies recorded when the
        // old objects were applied.
        for (&key, &op) in &delete_side {
            let repoint = !destroy_first.contains(key);
            for dependent in snapshot.dependents_of(key) {
                if dependent == key {
                    continue;
                }
                if let Some(&dependent_delete) = delete_side.get(dependent) {
                    drafts[op].depends_on.insert(dependent_delete);
                }
                if repoint {
                    if let Some(&dependent_create) = create_side.get(dependent) {
                        drafts[op].depends_on.insert(dependent_create);
                    }
                }
            }
        }

        for object in &snapshot.deposed {
            let key = &object.key;
            let base = graph.node(key).map_or_else(
                || graph.len() + snapshot.get(key).map_or(0, |e| e.order),
                |n| n.order,
            );
            let mut depends_on = BTreeSet::new();
            for dependent in snapshot.dependents_of(key) {
                if dependent == key {
                    continue;
                }
                depends_on.extend(delete_side.get(dependent).copied());
                depends_on.extend(create_side.get(dependent).copied());
            }
            debug!("{key}: delete deposed object {}", object.id);
            drafts.push(Draft {
                key: key.clone(),
                action: Action::Delete,
                step: Step::Delete,
                changed: Vec::new(),
                strategy: None,
                rank: (base, 2),
                depends_on,
                deposed: Some(object.id.clone()),
            });
        }

        let preds: Vec<Vec<usize>> = drafts
            .iter()
            .map(|d| d.depends_on.iter().copied().collect())
            .collect();
        let order = topological_order(&preds, |i| drafts[i].rank).map_err(|cycle| {
            PlanError::CycleDetected {
                cycle: cycle
                    .iter()
                    .map(|&i| format!("{} {}", drafts[i].step, drafts[i].key))
                    .collect(),
            }
        })?;

        let mut position = vec![0; drafts.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }

        let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
        let operations: Vec<Operation> = order
            .iter()
            .enumerate()
            .filter_map(|(index, &i)| {
                slots[i].take().map(|d| Operation {
                    index,
                    key: d.key,
                    action: d.action,
                    step: d.step,
                    changed: d.changed,
                    strategy: d.strategy,
                    depends_on: d.depends_on.iter().map(|&p| position[p]).collect(),
                    deposed: d.deposed,
                })
            })
            .collect();

        debug!("Planned {} operations", operations.len());

        Ok(Self {
            created_at: Utc::now(),
            operations,
            summary: PlanSummary {
                creates: diff.creates,
                updates: diff.updates,
                replaces: diff.replaces,
                deletes: diff.deletes,
                unchanged: diff.unchanged,
                deposed: snapshot.deposed.len(),
            },
        })
    }

    /// Replaced resources that must be destroyed before being recreated.
    fn destroy_first_set<'a>(
        diff: &'a DiffResult,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> HashSet<&'a ResourceKey> {
        let mut set: HashSet<&ResourceKey> = HashSet::new();

        for node in graph.topological_nodes() {
            let Some(resource) = diff.get(&node.key) else {
                continue;
            };
            if resource.action != Action::Replace {
                continue;
            }

            let recorded = snapshot.get(&node.key).map(|e| e.dependencies.as_slice()).unwrap_or_default();
            let inherits = graph
                .dependencies(&node.key)
                .into_iter()
                .chain(recorded)
                .any(|dep| set.contains(dep));

            if inherits || !node.key.kind.schema().create_before_destroy {
                debug!("{}: replace destroy-first", node.key);
                set.insert(&resource.key);
            }
        }

        set
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations for one resource, in plan order.
    #[must_use]
    pub fn operations_for(&self, key: &ResourceKey) -> Vec<&Operation> {
        self.operations.iter().filter(|o| &o.key == key).collect()
    }
}

impl Operation {
    /// Human-readable label, e.g. `delete vpc.lab`.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.deposed {
            Some(id) => format!("{} {} (deposed {id})", self.step, self.key),
            None => format!("{} {}", self.step, self.key),
        }
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDestroy => write!(f, "create-before-destroy"),
            Self::DestroyFirst => write!(f, "destroy-first"),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.operations {
            let symbol = match (op.action, op.step) {
                (Action::Create, _) => "+",
                (Action::Update, _) => "~",
                (Action::Replace, Step::Delete) | (Action::Delete, _) => "-",
                (Action::Replace, _) => "+",
                (Action::NoOp, _) => " ",
            };
            write!(f, "{symbol} {}", op.label())?;
            if let Some(strategy) = op.strategy {
                write!(f, " (replace, {strategy})")?;
            }
            if !op.changed.is_empty() && op.step != Step::Delete {
                write!(f, " [{}]", op.changed.join(", "))?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.summary.creates,
            self.summary.updates,
            self.summary.replaces,
            self.summary.deletes,
            self.summary.unchanged
        )?;
        if self.summary.deposed > 0 {
            write!(f, ", {} deposed to delete", self.summary.deposed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::V6labError;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::planner::diff::tests::{applied, decl, key};
    use crate::resource::{PropertyValue, ResourceKind};

    fn vpc(cidr: &str) -> crate::config::ResourceDeclaration {
        decl(
            ResourceKind::Vpc,
            "lab",
            &[("cidr_block", PropertyValue::literal(cidr))],
        )
    }

    fn subnet(cidr: &str) -> crate::config::ResourceDeclaration {
        decl(
            ResourceKind::Subnet,
            "a",
            &[
                ("vpc_id", PropertyValue::reference(key(ResourceKind::Vpc, "lab"), "id")),
                ("cidr_block", PropertyValue::literal(cidr)),
            ],
        )
    }

    fn instance(ami: &str) -> crate::config::ResourceDeclaration {
        decl(
            ResourceKind::Instance,
            "box",
            &[
                ("ami", PropertyValue::literal(ami)),
                ("instance_type", PropertyValue::literal("t3.micro")),
                ("subnet_id", PropertyValue::reference(key(ResourceKind::Subnet, "a"), "id")),
            ],
        )
    }

    fn graph(decls: Vec<crate::config::ResourceDeclaration>) -> ResourceGraph {
        GraphBuilder::new().declare_all(decls).build().expect("build")
    }

    fn plan(desired: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Plan> {
        let diff = DiffEngine::new().compute(desired, snapshot)?;
        Plan::build(&diff, desired, snapshot)
    }

    fn labels(plan: &Plan) -> Vec<String> {
        plan.operations.iter().map(Operation::label).collect()
    }

    fn assert_topological(plan: &Plan) {
        for op in &plan.operations {
            for &dep in &op.depends_on {
                assert!(dep < op.index, "{} depends on later op {dep}", op.label());
            }
        }
    }

    #[test]
    fn test_creates_follow_references() {
        let desired = graph(vec![instance("ami-1"), subnet("10.0.1.0/24"), vpc("10.0.0.0/16")]);
        let plan = plan(&desired, &StateSnapshot::new("lab", "dev")).expect("plan");

        assert_eq!(
            labels(&plan),
            vec!["create vpc.lab", "create subnet.a", "create instance.box"]
        );
        assert_eq!(plan.operations[2].depends_on, vec![1]);
        assert_topological(&plan);
    }

    #[test]
    fn test_unchanged_graph_has_empty_plan() {
        let desired = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24")]);
        let plan = plan(&desired, &applied(&desired)).expect("plan");
        assert!(plan.is_empty());
        assert_eq!(plan.summary.unchanged, 2);
    }

    #[test]
    fn test_deletes_run_leaf_first() {
        let before = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-1")]);
        let plan = plan(&graph(vec![]), &applied(&before)).expect("plan");

        assert_eq!(
            labels(&plan),
            vec!["delete instance.box", "delete subnet.a", "delete vpc.lab"]
        );
        assert_topological(&plan);
    }

    #[test]
    fn test_create_before_destroy_replacement() {
        let before = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-1")]);
        let after = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-2")]);
        let plan = plan(&after, &applied(&before)).expect("plan");

        assert_eq!(labels(&plan), vec!["create instance.box", "delete instance.box"]);
        assert_eq!(
            plan.operations[0].strategy,
            Some(ReplaceStrategy::CreateBeforeDestroy)
        );
        assert_eq!(plan.operations[1].depends_on, vec![0]);
    }

    #[test]
    fn test_dependents_are_repointed_before_old_object_is_deleted() {
        // The VPC allows parallel existence, the subnet does not.
        let before = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24")]);
        let after = graph(vec![vpc("10.1.0.0/16"), subnet("10.0.1.0/24")]);
        let plan = plan(&after, &applied(&before)).expect("plan");

        assert_eq!(
            labels(&plan),
            vec![
                "create vpc.lab",
                "delete subnet.a",
                "create subnet.a",
                "delete vpc.lab"
            ]
        );
        assert_eq!(plan.operations[2].strategy, Some(ReplaceStrategy::DestroyFirst));
        assert_topological(&plan);
    }

    #[test]
    fn test_destroy_first_propagates_to_replaced_dependents() {
        let before = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-1")]);
        let after = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.2.0/24"), instance("ami-1")]);
        let plan = plan(&after, &applied(&before)).expect("plan");

        assert_eq!(
            labels(&plan),
            vec![
                "delete instance.box",
                "delete subnet.a",
                "create subnet.a",
                "create instance.box"
            ]
        );
        assert!(plan
            .operations_for(&key(ResourceKind::Instance, "box"))
            .iter()
            .all(|o| o.strategy == Some(ReplaceStrategy::DestroyFirst)));
        assert_topological(&plan);
    }

    #[test]
    fn test_inconsistent_recorded_dependencies_form_a_cycle() {
        let table = decl(
            ResourceKind::RouteTable,
            "rt",
            &[("vpc_id", PropertyValue::reference(key(ResourceKind::Vpc, "lab"), "id"))],
        );
        let before = graph(vec![vpc("10.0.0.0/16"), table.clone()]);
        let mut snapshot = applied(&before);
        if let Some(entry) = snapshot.resources.get_mut(&key(ResourceKind::Vpc, "lab")) {
            entry.dependencies = vec![key(ResourceKind::RouteTable, "rt")];
        }

        let after = graph(vec![vpc("10.1.0.0/16"), table]);
        let err = plan(&after, &snapshot).expect_err("cycle");
        match err {
            V6labError::Plan(PlanError::CycleDetected { cycle }) => {
                assert_eq!(cycle.len(), 2);
                assert!(cycle.iter().all(|c| c.starts_with("delete ")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deposed_object_is_deleted_after_its_dependents_move() {
        let before = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-1")]);
        let mut snapshot = applied(&before);
        let subnet_key = key(ResourceKind::Subnet, "a");
        let old = snapshot.get(&subnet_key).cloned().expect("subnet");
        snapshot.depose(subnet_key.clone(), &old);
        if let Some(entry) = snapshot.resources.get_mut(&subnet_key) {
            entry.id = String::from("subnet-new");
        }

        // A new AMI replaces the instance, which still records the subnet.
        let after = graph(vec![vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("ami-2")]);
        let plan = plan(&after, &snapshot).expect("plan");

        assert_eq!(
            labels(&plan),
            vec![
                "create instance.box",
                "delete instance.box",
                format!("delete subnet.a (deposed {})", old.id).as_str()
            ]
        );
        let deposed = &plan.operations[2];
        assert_eq!(deposed.action, Action::Delete);
        assert_eq!(deposed.deposed.as_deref(), Some(old.id.as_str()));
        assert_eq!(deposed.depends_on, vec![0, 1]);
        assert_eq!(plan.summary.deposed, 1);
        assert!(plan.to_string().ends_with(", 1 deposed to delete"));
        assert_topological(&plan);
    }

    #[test]
    fn test_display_lists_operations() {
        let desired = graph(vec![vpc("10.0.0.0/16")]);
        let plan = plan(&desired, &StateSnapshot::new("lab", "dev")).expect("plan");
        let text = plan.to_string();
        assert!(text.starts_with("+ create vpc.lab [cidr_block]"));
        assert!(text.ends_with("1 to create, 0 to update, 0 to replace, 0 to delete, 0 unchanged"));
    }
}
