//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{TopologyConfig, ValidationResult};
use crate::graph::GraphHasher;
use crate::planner::{Action, OperationOutcome, OutcomeResult};
use crate::reconciler::{PlanPreview, RunReport};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Snapshot entry row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan preview for display.
    #[must_use]
    pub fn format_plan(&self, preview: &PlanPreview, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(preview)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(preview, detailed),
        }
    }

    fn format_plan_text(preview: &PlanPreview, detailed: bool) -> String {
        let plan = &preview.plan;
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan ({} resources)\n", preview.graph.len());
        let _ = write!(
            output,
            "   Fingerprint: {}\n\n",
            GraphHasher::short(&preview.fingerprint)
        );

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .map(|op| OperationRow {
                index: op.index + 1,
                action: Self::format_action(op.action),
                step: op
                    .strategy
                    .map_or_else(|| op.step.to_string(), |s| format!("{} ({s})", op.step)),
                resource: op
                    .deposed
                    .as_ref()
                    .map_or_else(|| op.key.to_string(), |id| format!("{} (deposed {id})", op.key)),
                changes: Self::truncate(&op.changed.join(", "), 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for diff in preview.diff.diffs.iter().filter(|d| d.action != Action::NoOp) {
                let _ = writeln!(output, "   {} {}", Self::format_action(diff.action), diff.key);
                for detail in &diff.details {
                    let old = detail.old_value.as_deref().unwrap_or("(none)");
                    let new = if detail.known_after_apply {
                        "(known after apply)"
                    } else {
                        detail.new_value.as_deref().unwrap_or("(none)")
                    };
                    let marker = if detail.forces_replace {
                        " # forces replacement".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "       {}: {old} -> {new}{marker}", detail.property);
                }
            }
        }

        let summary = &plan.summary;
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.replaces.to_string().magenta(),
            summary.deletes.to_string().red()
        );
        if summary.deposed > 0 {
            let _ = writeln!(output, "      {} deposed object(s) to destroy", summary.deposed.to_string().red());
        }

        output
    }

    /// Formats the result of an apply run.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&RunJson::from(report)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let status = match report.status {
            crate::state::RunOutcome::Complete => format!("{} Apply complete", "✓".green()),
            crate::state::RunOutcome::Partial => format!("{} Apply partially failed", "✗".red()),
            crate::state::RunOutcome::Cancelled => format!("{} Apply cancelled", "⚠".yellow()),
        };

        let mut output = format!("{status}\n\n");
        if !report.outcomes.is_empty() {
            let rows: Vec<OutcomeRow> = report.outcomes.iter().map(Self::outcome_row).collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\n{} succeeded, {} provider calls, state serial {}\n",
            report.succeeded().count(),
            report.provider_calls,
            report.serial
        );

        if let Some(error) = &report.error {
            let _ = write!(output, "\n{} {error}\n", "⚠".yellow());
        }

        output
    }

    fn outcome_row(outcome: &OperationOutcome) -> OutcomeRow {
        let (result, detail) = match &outcome.result {
            OutcomeResult::Succeeded { outputs } => (
                "ok".green().to_string(),
                outputs
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            OutcomeResult::Failed { error } => ("failed".red().to_string(), Self::truncate(&error.to_string(), 50)),
            OutcomeResult::Skipped { blocked_by } => {
                ("skipped".yellow().to_string(), format!("blocked by {blocked_by}"))
            }
            OutcomeResult::NotStarted => ("not started".dimmed().to_string(), String::new()),
        };

        OutcomeRow {
            step: outcome.step.to_string(),
            resource: outcome.key.to_string(),
            result,
            attempts: outcome.attempts,
            detail,
        }
    }

    /// Formats the committed snapshot.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let fingerprint = if state.fingerprint.is_empty() {
                    "(not converged)"
                } else {
                    GraphHasher::short(&state.fingerprint)
                };
                let _ = writeln!(output, "   Fingerprint: {fingerprint}");
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   Locked by: {} ({}s remaining, id {})",
                        lock.holder,
                        lock.remaining_secs(),
                        lock.lock_id
                    );
                }

                if !state.is_empty() {
                    output.push('\n');
                    let rows: Vec<ResourceRow> = state
                        .entries_in_order()
                        .into_iter()
                        .map(|(key, entry)| ResourceRow {
                            resource: key.to_string(),
                            id: entry.id.clone(),
                            dependencies: entry
                                .dependencies
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                            updated: entry.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let mark = match entry.outcome {
                            crate::state::RunOutcome::Complete => "✓".green(),
                            crate::state::RunOutcome::Partial => "✗".red(),
                            crate::state::RunOutcome::Cancelled => "⚠".yellow(),
                        };
                        let _ = writeln!(
                            output,
                            "     {mark} {} - {} ({} changed, {} failed)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.outcome,
                            entry.changed.len(),
                            entry.failed.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &TopologyConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ValidationJson {
                valid: result.is_valid(),
                errors: result
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect(),
                warnings: result.warnings.clone(),
                resources: config.resources.len(),
                lookups: config.lookups.len(),
            })
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }

                if (show_warnings || !result.is_valid()) && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let _ = writeln!(output, "   Lookups: {}", config.lookups.len());
                let _ = writeln!(output, "   Variables: {}", config.variables.len());
                output
            }
        }
    }

    /// Formats a status message.
    #[must_use]
    pub fn message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => match status {
                "error" => format!("{} {message}", "✗".red()),
                "warning" => format!("{} {message}", "⚠".yellow()),
                _ => format!("{} {message}", "✓".green()),
            },
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Replace => "-/+replace".magenta().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    fingerprint: String,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    unchanged: usize,
    deposed: usize,
    operations: Vec<OperationJson>,
}

#[derive(Serialize)]
struct OperationJson {
    index: usize,
    resource: String,
    action: String,
    step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deposed: Option<String>,
    strategy: Option<String>,
    changed: Vec<String>,
    depends_on: Vec<usize>,
}

#[derive(Serialize)]
struct RunJson {
    status: String,
    serial: u64,
    committed: bool,
    provider_calls: u32,
    operations: Vec<OutcomeJson>,
}

#[derive(Serialize)]
struct OutcomeJson {
    resource: String,
    action: String,
    step: String,
    attempts: u32,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_by: Option<String>,
}

#[derive(Serialize)]
struct ValidationJson {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
    resources: usize,
    lookups: usize,
}

impl From<&PlanPreview> for PlanJson {
    fn from(preview: &PlanPreview) -> Self {
        let summary = &preview.plan.summary;
        Self {
            fingerprint: preview.fingerprint.clone(),
            creates: summary.creates,
            updates: summary.updates,
            replaces: summary.replaces,
            deletes: summary.deletes,
            unchanged: summary.unchanged,
            deposed: summary.deposed,
            operations: preview
                .plan
                .operations
                .iter()
                .map(|op| OperationJson {
                    index: op.index,
                    resource: op.key.to_string(),
                    action: op.action.to_string(),
                    step: op.step.to_string(),
                    deposed: op.deposed.clone(),
                    strategy: op.strategy.map(|s| s.to_string()),
                    changed: op.changed.clone(),
                    depends_on: op.depends_on.clone(),
                })
                .collect(),
        }
    }
}

impl From<&RunReport> for RunJson {
    fn from(report: &RunReport) -> Self {
        Self {
            status: report.status.to_string(),
            serial: report.serial,
            committed: report.committed,
            provider_calls: report.provider_calls,
            operations: report.outcomes.iter().map(OutcomeJson::from).collect(),
        }
    }
}

impl From<&OperationOutcome> for OutcomeJson {
    fn from(outcome: &OperationOutcome) -> Self {
        let mut json = Self {
            resource: outcome.key.to_string(),
            action: outcome.action.to_string(),
            step: outcome.step.to_string(),
            attempts: outcome.attempts,
            result: "not_started",
            id: None,
            error: None,
            blocked_by: None,
        };
        match &outcome.result {
            OutcomeResult::Succeeded { outputs } => {
                json.result = "succeeded";
                json.id = outputs
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from);
            }
            OutcomeResult::Failed { error } => {
                json.result = "failed";
                json.error = Some(error.to_string());
            }
            OutcomeResult::Skipped { blocked_by } => {
                json.result = "skipped";
                json.blocked_by = Some(blocked_by.to_string());
            }
            OutcomeResult::NotStarted => {}
        }
        json
    }
}
