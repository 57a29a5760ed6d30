//! Reconciler for converging a topology to its declared state.
//!
//! This module wires the stages of a run together: lookups are resolved,
//! the resource graph is built and diffed against the last snapshot, the
//! plan is executed and the outcome is committed back to the state store.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TopologyConfig;
use crate::error::{ExecutionError, PlanError, Result};
use crate::graph::{GraphBuilder, GraphHasher, ResourceGraph};
use crate::planner::{
    DiffEngine, DiffResult, ExecutorSettings, OperationOutcome, OutcomeResult, Plan, PlanExecutor,
    PlanSummary,
};
use crate::provider::{Provider, resolve_lookups};
use crate::state::{RunOutcome, StateCommitter, StateSnapshot, StateStore, generate_holder_id};

/// Reconciler for a single topology.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a TopologyConfig,
    /// State store.
    state_store: &'a S,
    /// Provider that applies operations.
    provider: Arc<dyn Provider>,
    /// Executor tuning.
    settings: ExecutorSettings,
    /// Diff engine.
    diff_engine: DiffEngine,
}

/// Everything computed for a run before anything is mutated.
#[derive(Debug)]
pub struct PlanPreview {
    /// The desired graph with lookups substituted.
    pub graph: ResourceGraph,
    /// The snapshot the plan was computed against.
    pub snapshot: StateSnapshot,
    /// Per-node diff.
    pub diff: DiffResult,
    /// Ordered operations.
    pub plan: Plan,
    /// Fingerprint of the desired graph.
    pub fingerprint: String,
}

/// Result of an apply run.
#[derive(Debug)]
pub struct RunReport {
    /// How the run ended.
    pub status: RunOutcome,
    /// Plan summary.
    pub summary: PlanSummary,
    /// Per-operation outcomes, in plan order.
    pub outcomes: Vec<OperationOutcome>,
    /// Provider calls made for operations, retries included.
    pub provider_calls: u32,
    /// Failed and skipped operations.
    pub error: Option<ExecutionError>,
    /// Serial of the committed snapshot.
    pub serial: u64,
    /// Whether a new snapshot was written.
    pub committed: bool,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a TopologyConfig, state_store: &'a S, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            state_store,
            provider,
            settings: ExecutorSettings::from(&config.engine),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Overrides the executor settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Computes the plan without mutating anything.
    ///
    /// Lookups are still resolved, since resources depend on their ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded, a lookup fails, or
    /// the graph or plan cannot be built.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<PlanPreview> {
        let snapshot = self.load_snapshot().await?;
        self.prepare(snapshot, cancel).await
    }

    /// Converges the topology: plans, executes and commits the outcome.
    ///
    /// The state lock is held for the whole run.
    ///
    /// # Errors
    ///
    /// Returns an abort error (see [`crate::V6labError::is_abort`]) if the
    /// graph or plan is invalid, in which case nothing was applied. Lock,
    /// lookup and state errors are returned as they are. Failed operations
    /// do not produce an error; they are reported in [`RunReport`].
    pub async fn apply(&self, cancel: CancellationToken) -> Result<RunReport> {
        self.apply_with_lock(None, cancel).await
    }

    /// Applies a plan that was previewed and approved.
    ///
    /// The plan is recomputed under the state lock and must match
    /// `approved`: same snapshot serial and lineage, same desired graph
    /// fingerprint and the same operations. Otherwise nothing is applied.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::StalePlan`] if the state or the resolved desired
    /// graph changed since `approved` was computed, plus everything
    /// [`Self::apply`] returns.
    pub async fn apply_approved(&self, approved: &PlanPreview, cancel: CancellationToken) -> Result<RunReport> {
        self.apply_with_lock(Some(approved), cancel).await
    }

    async fn apply_with_lock(
        &self,
        approved: Option<&PlanPreview>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        info!(
            "Starting apply for {}/{}",
            self.config.project.name, self.config.project.environment
        );

        let lock = self.state_store.acquire_lock(&generate_holder_id()).await?;
        let result = self.apply_locked(approved, cancel).await;

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }

        result
    }

    async fn apply_locked(
        &self,
        approved: Option<&PlanPreview>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let snapshot = self.load_snapshot().await?;
        let preview = self.prepare(snapshot, &cancel).await?;
        if let Some(approved) = approved {
            ensure_unchanged(approved, &preview)?;
        }
        let PlanPreview {
            graph,
            snapshot,
            plan,
            fingerprint,
            ..
        } = preview;

        if plan.is_empty() {
            info!("No changes required - state is converged");
            let committed = snapshot.fingerprint != fingerprint;
            let serial = if committed {
                // Declaration order or formatting changed without touching
                // any resource.
                let next = StateCommitter::new(&graph, snapshot).finish(RunOutcome::Complete, &fingerprint, None)?;
                self.state_store.save(&next).await?;
                next.serial
            } else {
                snapshot.serial
            };
            return Ok(RunReport {
                status: RunOutcome::Complete,
                summary: plan.summary,
                outcomes: Vec::new(),
                provider_calls: 0,
                error: None,
                serial,
                committed,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut committer = StateCommitter::new(&graph, snapshot.clone());
        let executor = PlanExecutor::new(Arc::clone(&self.provider), self.settings);

        let (report, ()) = tokio::join!(
            executor.execute(&plan, &graph, &snapshot, tx, cancel),
            committer.consume(rx)
        );

        let next = committer.finish(
            report.status,
            &fingerprint,
            report.error.as_ref().map(ToString::to_string),
        )?;
        self.state_store.save(&next).await?;

        info!(
            "Apply {}: serial {}, {} resources recorded",
            report.status,
            next.serial,
            next.len()
        );

        Ok(RunReport {
            status: report.status,
            summary: plan.summary,
            outcomes: report.outcomes,
            provider_calls: report.provider_calls,
            error: report.error,
            serial: next.serial,
            committed: true,
        })
    }

    async fn load_snapshot(&self) -> Result<StateSnapshot> {
        Ok(self.state_store.load().await?.unwrap_or_else(|| {
            StateSnapshot::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    async fn prepare(&self, snapshot: StateSnapshot, cancel: &CancellationToken) -> Result<PlanPreview> {
        // Structural errors and cycles surface before any lookup reaches
        // the provider.
        let placeholders: BTreeMap<String, String> = self
            .config
            .lookups
            .iter()
            .map(|l| (l.name.clone(), format!("<lookup {}>", l.name)))
            .collect();
        self.builder(placeholders).build()?;

        let lookups = resolve_lookups(
            self.provider.as_ref(),
            &self.config.lookups,
            &self.settings.retry,
            cancel,
        )
        .await?;

        let graph = self.builder(lookups).build()?;
        let fingerprint = GraphHasher::new().hash_graph(&graph);
        debug!(
            "Built graph with {} nodes and {} edges ({})",
            graph.len(),
            graph.edges().len(),
            GraphHasher::short(&fingerprint)
        );

        let diff = self.diff_engine.compute(&graph, &snapshot)?;
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );

        let plan = Plan::build(&diff, &graph, &snapshot)?;

        Ok(PlanPreview {
            graph,
            snapshot,
            diff,
            plan,
            fingerprint,
        })
    }

    fn builder(&self, lookups: BTreeMap<String, String>) -> GraphBuilder {
        GraphBuilder::new()
            .with_lookups(lookups)
            .with_variables(self.config.variables.clone())
            .declare_all(self.config.resources.iter().cloned())
    }
}

/// Checks that a plan recomputed under the lock is the one approved.
fn ensure_unchanged(approved: &PlanPreview, current: &PlanPreview) -> Result<()> {
    // Serial 0 means nothing was saved yet, and each load of an empty store
    // starts a new lineage.
    let reason = if approved.snapshot.serial != current.snapshot.serial {
        format!(
            "state serial moved from {} to {}",
            approved.snapshot.serial, current.snapshot.serial
        )
    } else if current.snapshot.serial > 0 && approved.snapshot.lineage != current.snapshot.lineage {
        String::from("state lineage changed")
    } else if approved.fingerprint != current.fingerprint {
        String::from("desired graph changed, check lookup results")
    } else if approved.plan.operations != current.plan.operations {
        String::from("planned operations changed")
    } else {
        return Ok(());
    };
    warn!("Refusing to apply: {reason}");
    Err(PlanError::StalePlan { reason }.into())
}

impl RunReport {
    /// Outcomes that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, OutcomeResult::Succeeded { .. }))
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == RunOutcome::Complete
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Apply {}:", self.status)?;
        writeln!(f, "  Operations: {}", self.outcomes.len())?;
        writeln!(f, "  Succeeded: {}", self.succeeded().count())?;
        writeln!(f, "  Provider calls: {}", self.provider_calls)?;
        writeln!(f, "  State serial: {}", self.serial)?;

        if let Some(error) = &self.error {
            writeln!(f, "  Errors:")?;
            for (key, e) in &error.failed {
                writeln!(f, "    - {key}: {e}")?;
            }
            for (key, blocked_by) in &error.skipped {
                writeln!(f, "    - {key}: skipped, blocked by {blocked_by}")?;
            }
        }

        Ok(())
    }
}

impl<S: StateStore> std::fmt::Debug for Reconciler<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
