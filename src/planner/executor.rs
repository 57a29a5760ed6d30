//! Plan executor.
//!
//! A single coordinating loop owns all bookkeeping: which operations are
//! ready, the outputs produced so far and every outcome. Workers in a
//! [`JoinSet`] only ever receive fully resolved requests and hand back the
//! provider's answer, so no state is shared between them.
//!
//! The executor never writes the snapshot. Every outcome is sent on an
//! mpsc channel as soon as it is known; the state committer consumes it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ExecutionError, OperationError, ProviderError};
use crate::graph::ResourceGraph;
use crate::provider::{ApplyRequest, Attempted, Provider, RetryPolicy, Step};
use crate::resource::{Attributes, PropertyValue, ResourceKey, cidr_subnet};
use crate::state::{RunOutcome, StateSnapshot};

use super::diff::Action;
use super::plan::{Operation, Plan};

/// Executor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum operations in flight.
    pub concurrency: usize,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
}

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeResult {
    /// The provider confirmed the step.
    Succeeded {
        /// Output attributes. Empty for deletes.
        outputs: Attributes,
    },
    /// The step failed.
    Failed {
        /// Underlying error.
        error: OperationError,
    },
    /// A dependency failed, so the step never ran.
    Skipped {
        /// The failed resource that blocked this one.
        blocked_by: ResourceKey,
    },
    /// The run was cancelled before the step started, or while a retry
    /// was pending.
    NotStarted,
}

/// Outcome of one planned operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    /// Plan position.
    pub index: usize,
    /// Resource.
    pub key: ResourceKey,
    /// Diff action.
    pub action: Action,
    /// Provider step.
    pub step: Step,
    /// Provider id of the deposed object a delete targeted.
    pub deposed: Option<String>,
    /// Provider calls made.
    pub attempts: u32,
    /// Result.
    pub result: OutcomeResult,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// How the run ended.
    pub status: RunOutcome,
    /// One outcome per operation, in plan order.
    pub outcomes: Vec<OperationOutcome>,
    /// Total provider calls, retries included.
    pub provider_calls: u32,
    /// Failed and skipped operations, if any.
    pub error: Option<ExecutionError>,
}

/// Executor for plans.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    settings: ExecutorSettings,
}

type TaskOutput = (usize, Attempted<Attributes>);

/// Coordinator-owned run state.
struct RunState<'p> {
    plan: &'p Plan,
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BinaryHeap<Reverse<usize>>,
    outcomes: Vec<Option<OperationOutcome>>,
    live: HashMap<ResourceKey, Attributes>,
    events: UnboundedSender<OperationOutcome>,
    provider_calls: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&EngineConfig> for ExecutorSettings {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            concurrency: engine.concurrency.unwrap_or_else(default_concurrency),
            retry: RetryPolicy::from(engine),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, settings: ExecutorSettings) -> Self {
        Self { provider, settings }
    }

    /// Executes a plan.
    ///
    /// Outcomes are sent on `events` as they happen; the sender is dropped
    /// when execution ends. Cancelling `cancel` stops dispatching new
    /// operations while in-flight ones finish.
    pub async fn execute(
        &self,
        plan: &Plan,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        events: UnboundedSender<OperationOutcome>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let limit = self.settings.concurrency.max(1);
        info!(
            "Executing plan with {} operations (concurrency {limit})",
            plan.len()
        );

        let mut run = RunState::new(plan, snapshot, events);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            while tasks.len() < limit && !cancel.is_cancelled() {
                let Some(Reverse(i)) = run.ready.pop() else {
                    break;
                };
                let op = &plan.operations[i];
                match prepare(op, graph, snapshot, &run.live) {
                    Ok(request) => {
                        info!("Applying {}", op.label());
                        let provider = Arc::clone(&self.provider);
                        let retry = self.settings.retry;
                        let token = cancel.clone();
                        let label = op.label();
                        let handle = tasks.spawn(async move {
                            let attempted = retry
                                .run(&label, &token, || provider.apply(request.clone()))
                                .await;
                            (i, attempted)
                        });
                        task_index.insert(handle.id(), i);
                    }
                    Err(error) => {
                        error!("{}: {error}", op.label());
                        run.fail(i, 0, error);
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            match tasks.join_next_with_id().await {
                Some(Ok((id, (i, attempted)))) => {
                    task_index.remove(&id);
                    run.complete(i, attempted);
                }
                Some(Err(join_error)) => {
                    if let Some(i) = task_index.remove(&join_error.id()) {
                        error!("{}: worker aborted: {join_error}", plan.operations[i].label());
                        run.fail(
                            i,
                            0,
                            OperationError::WorkerAborted {
                                message: join_error.to_string(),
                            },
                        );
                    }
                }
                None => break,
            }
        }

        if cancel.is_cancelled() {
            warn!("Execution cancelled");
        }
        run.finish()
    }
}

/// Builds the provider request for an operation from dependency outputs.
fn prepare(
    op: &Operation,
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    live: &HashMap<ResourceKey, Attributes>,
) -> Result<ApplyRequest, OperationError> {
    let recorded = || match &op.deposed {
        Some(id) => snapshot
            .get_deposed(&op.key, id)
            .map(|d| d.outputs.clone())
            .ok_or_else(|| OperationError::resolution("id", format!("no deposed object {id}"))),
        None => snapshot
            .get(&op.key)
            .map(|e| e.outputs.clone())
            .ok_or_else(|| OperationError::resolution("id", "no recorded object to modify")),
    };

    let (properties, prior) = match op.step {
        Step::Delete => (BTreeMap::new(), Some(recorded()?)),
        Step::Update => (resolve_properties(op, graph, live)?, Some(recorded()?)),
        Step::Create => (resolve_properties(op, graph, live)?, None),
    };

    Ok(ApplyRequest {
        key: op.key.clone(),
        step: op.step,
        properties,
        prior,
    })
}

fn resolve_properties(
    op: &Operation,
    graph: &ResourceGraph,
    live: &HashMap<ResourceKey, Attributes>,
) -> Result<BTreeMap<String, serde_json::Value>, OperationError> {
    let node = graph
        .node(&op.key)
        .ok_or_else(|| OperationError::resolution("*", format!("{} is not declared", op.key)))?;

    node.properties
        .iter()
        .map(|(name, value)| resolve_value(name, value, live).map(|v| (name.clone(), v)))
        .collect()
}

fn resolve_value(
    property: &str,
    value: &PropertyValue,
    live: &HashMap<ResourceKey, Attributes>,
) -> Result<serde_json::Value, OperationError> {
    let reference = match value {
        PropertyValue::Literal(v) => return Ok(v.clone()),
        PropertyValue::Reference(r) => r,
        PropertyValue::Lookup(_) | PropertyValue::Variable(_) => {
            return Err(OperationError::resolution(property, format!("{value} was not substituted")));
        }
    };

    let path = &reference.path;
    let resolved = live
        .get(&path.target)
        .and_then(|outputs| outputs.get(&path.attribute))
        .filter(|v| !v.is_null())
        .ok_or_else(|| OperationError::resolution(property, format!("{path} has no value")))?;

    match reference.cidrsubnet {
        None => Ok(resolved.clone()),
        Some(carve) => {
            let prefix = resolved
                .as_str()
                .ok_or_else(|| OperationError::resolution(property, format!("{path} is not a CIDR block")))?;
            cidr_subnet(prefix, carve.newbits, carve.netnum)
                .map(serde_json::Value::String)
                .map_err(|e| OperationError::resolution(property, e))
        }
    }
}

/// Checks that a provider response carries every output the kind declares.
fn validate_outputs(key: &ResourceKey, outputs: &Attributes) -> Result<(), ProviderError> {
    if let Some(missing) = key
        .kind
        .schema()
        .outputs
        .iter()
        .find(|attr| !outputs.contains_key(**attr))
    {
        return Err(ProviderError::invalid_response(format!(
            "{key}: response is missing output '{missing}'"
        )));
    }
    if !outputs.get("id").is_some_and(serde_json::Value::is_string) {
        return Err(ProviderError::invalid_response(format!(
            "{key}: response has no string id"
        )));
    }
    Ok(())
}

impl<'p> RunState<'p> {
    fn new(plan: &'p Plan, snapshot: &StateSnapshot, events: UnboundedSender<OperationOutcome>) -> Self {
        let n = plan.len();
        let mut dependents = vec![Vec::new(); n];
        let remaining: Vec<usize> = plan
            .operations
            .iter()
            .map(|op| {
                for &d in &op.depends_on {
                    dependents[d].push(op.index);
                }
                op.depends_on.len()
            })
            .collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let live = snapshot
            .resources
            .iter()
            .map(|(k, e)| (k.clone(), e.outputs.clone()))
            .collect();

        Self {
            plan,
            remaining,
            dependents,
            ready,
            outcomes: vec![None; n],
            live,
            events,
            provider_calls: 0,
        }
    }

    fn record(&mut self, index: usize, attempts: u32, result: OutcomeResult) {
        let plan = self.plan;
        let op = &plan.operations[index];
        let outcome = OperationOutcome {
            index,
            key: op.key.clone(),
            action: op.action,
            step: op.step,
            deposed: op.deposed.clone(),
            attempts,
            result,
        };
        if self.events.send(outcome.clone()).is_err() {
            debug!("Outcome receiver dropped");
        }
        self.outcomes[index] = Some(outcome);
    }

    fn complete(&mut self, index: usize, attempted: Attempted<Attributes>) {
        self.provider_calls += attempted.attempts;
        let plan = self.plan;
        let op = &plan.operations[index];

        if attempted.interrupted {
            // Only transient errors are retried, so the provider holds no
            // change from this step.
            warn!("{} interrupted while waiting to retry", op.label());
            self.record(index, attempted.attempts, OutcomeResult::NotStarted);
            return;
        }

        let result = attempted.result.and_then(|outputs| match op.step {
            Step::Delete => Ok(Attributes::new()),
            Step::Create | Step::Update => validate_outputs(&op.key, &outputs).map(|()| outputs),
        });

        match result {
            Ok(outputs) => {
                info!("{} succeeded", op.label());
                match op.step {
                    Step::Create | Step::Update => {
                        self.live.insert(op.key.clone(), outputs.clone());
                    }
                    Step::Delete if op.action == Action::Delete && op.deposed.is_none() => {
                        self.live.remove(&op.key);
                    }
                    Step::Delete => {}
                }
                let dependents = self.dependents[index].clone();
                self.record(index, attempted.attempts, OutcomeResult::Succeeded { outputs });
                for d in dependents {
                    self.remaining[d] -= 1;
                    if self.remaining[d] == 0 && self.outcomes[d].is_none() {
                        self.ready.push(Reverse(d));
                    }
                }
            }
            Err(e) => {
                error!("{} failed after {} attempt(s): {e}", op.label(), attempted.attempts);
                self.fail(index, attempted.attempts, e.into());
            }
        }
    }

    /// Records a failure and skips every not-yet-started descendant.
    fn fail(&mut self, index: usize, attempts: u32, error: OperationError) {
        let blocked_by = self.plan.operations[index].key.clone();
        self.record(index, attempts, OutcomeResult::Failed { error });

        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            if self.outcomes[d].is_some() {
                continue;
            }
            warn!(
                "Skipping {}: blocked by failed {blocked_by}",
                self.plan.operations[d].label()
            );
            self.record(
                d,
                0,
                OutcomeResult::Skipped {
                    blocked_by: blocked_by.clone(),
                },
            );
            queue.extend(self.dependents[d].iter().copied());
        }
    }

    fn finish(mut self) -> ExecutionReport {
        for i in 0..self.outcomes.len() {
            if self.outcomes[i].is_none() {
                self.record(i, 0, OutcomeResult::NotStarted);
            }
        }

        let outcomes: Vec<OperationOutcome> = self.outcomes.into_iter().flatten().collect();

        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut not_started = 0;
        for outcome in &outcomes {
            match &outcome.result {
                OutcomeResult::Failed { error } => failed.push((outcome.key.clone(), error.clone())),
                OutcomeResult::Skipped { blocked_by } => {
                    skipped.push((outcome.key.clone(), blocked_by.clone()));
                }
                OutcomeResult::NotStarted => not_started += 1,
                OutcomeResult::Succeeded { .. } => {}
            }
        }

        let status = if not_started > 0 {
            RunOutcome::Cancelled
        } else if failed.is_empty() && skipped.is_empty() {
            RunOutcome::Complete
        } else {
            RunOutcome::Partial
        };
        let error = ExecutionError { failed, skipped };

        info!(
            "Execution {status}: {} operations, {} provider calls",
            outcomes.len(),
            self.provider_calls
        );

        ExecutionReport {
            status,
            outcomes,
            provider_calls: self.provider_calls,
            error: (!error.is_empty()).then_some(error),
        }
    }
}

impl ExecutionReport {
    /// Outcomes that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, OutcomeResult::Succeeded { .. }))
    }

    /// Number of operations that never started.
    #[must_use]
    pub fn not_started(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == OutcomeResult::NotStarted)
            .count()
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
