//! Planning and execution of reconciliation runs.
//!
//! The diff engine compares the resource graph with the last snapshot, the
//! plan orders the resulting operations, and the executor carries them out
//! against a provider.

mod diff;
mod executor;
mod plan;

pub use diff::{Action, DiffDetail, DiffEngine, DiffResult, ResourceDiff};
pub use executor::{ExecutionReport, ExecutorSettings, OperationOutcome, OutcomeResult, PlanExecutor};
pub use plan::{Operation, Plan, PlanSummary, ReplaceStrategy};
