//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ResourceAddress;
use crate::planner::{ChangeAction, NodeStatus, Plan, ResourceChange, RunReport};
use crate::refresh::{Drift, DriftReport};
use crate::state::{LockInfo, RunHistoryEntry, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Attributes")]
    attributes: String,
}

/// Node outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Serial")]
    serial: u64,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// History row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "When")]
    when: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Succeeded")]
    succeeded: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
    #[tabled(rename = "Cancelled")]
    cancelled: usize,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for machine-readable output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. State matches configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan {}", plan.id.bold());

        for moved in &plan.moves {
            let _ = writeln!(output, "   {} {} -> {}", "moved".cyan(), moved.from, moved.to);
        }

        let rows: Vec<ChangeRow> = plan
            .actionable()
            .into_iter()
            .enumerate()
            .map(|(i, change)| ChangeRow {
                index: i + 1,
                action: Self::format_action(change),
                resource: change.address.to_string(),
                attributes: Self::truncate(&Self::changed_paths(change), 40),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if detailed {
            for change in plan.actionable() {
                let _ = writeln!(output, "\n{change}");
                for diff in &change.diffs {
                    let before = diff.before.as_ref().map_or_else(|| "(none)".to_string(), ToString::to_string);
                    let after = diff.after.as_ref().map_or_else(|| "(none)".to_string(), ToString::to_string);
                    let marker = if diff.forces_replacement {
                        " # forces replacement".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "   {}: {before} -> {after}{marker}", diff.path);
                }
                for id in &change.deposed {
                    let _ = writeln!(output, "   deposed object {id} will be destroyed");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red()
        );
        if summary.moved > 0 {
            let _ = write!(output, ", {} to move", summary.moved.to_string().cyan());
        }
        output.push('\n');
        output
    }

    /// Formats the result of a run.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => json(report),
            OutputFormat::Text => {
                let mut output = String::new();
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .map(|o| OutcomeRow {
                        resource: o.address.to_string(),
                        step: o.kind.to_string(),
                        status: Self::format_status(o.status),
                        error: o
                            .error
                            .as_ref()
                            .map(|e| Self::truncate(&e.to_string(), 50))
                            .unwrap_or_default(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                for moved in &report.moved {
                    let _ = writeln!(output, "Moved {} -> {}", moved.from, moved.to);
                }

                let headline = if report.is_success() {
                    format!("{} Run complete", "✓".green())
                } else {
                    format!("{} Run incomplete", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{headline}: {} succeeded, {} failed, {} skipped, {} cancelled",
                    report.succeeded.len(),
                    report.failed.len(),
                    report.skipped.len(),
                    report.cancelled.len()
                );
                for (address, message) in &report.failed {
                    let _ = writeln!(output, "   {} {address}: {message}", "✗".red());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected ({} checked).\n",
                        "✓".green(),
                        report.checked
                    );
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in &report.entries {
                    let detail = match &entry.drift {
                        Drift::Missing => "missing".red().to_string(),
                        changed @ Drift::Changed(_) => changed.to_string().yellow().to_string(),
                    };
                    let _ = writeln!(output, "   - {} ({}): {detail}", entry.address, entry.real_id);
                }
                for (address, message) in &report.errors {
                    let _ = writeln!(output, "   {} {address}: {message}", "✗".red());
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources drifted.\n",
                    report.entries.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats the records of a snapshot.
    #[must_use]
    pub fn format_records(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => json(&snapshot.records),
            OutputFormat::Text => {
                if snapshot.is_empty() {
                    return "No resources in state.\n".to_string();
                }
                let rows: Vec<RecordRow> = snapshot
                    .iter()
                    .map(|(address, record)| RecordRow {
                        address: address.to_string(),
                        id: Self::truncate(&record.real_id, 40),
                        serial: record.serial,
                        updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!(
                    "{}\n\nLineage {}, serial {}\n",
                    Table::new(rows),
                    snapshot.lineage,
                    snapshot.serial
                )
            }
        }
    }

    /// Formats one state record.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => json(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.address.to_string().bold());
                let _ = writeln!(output, "   ID: {}", record.real_id);
                let _ = writeln!(output, "   Provider: {}", record.provider);
                let _ = writeln!(output, "   Serial: {}", record.serial);
                let _ = writeln!(output, "   Updated: {}", record.updated_at);
                if !record.dependencies.is_empty() {
                    let deps: Vec<String> = record.dependencies.iter().map(ResourceAddress::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                if !record.deposed.is_empty() {
                    let _ = writeln!(output, "   Deposed: {}", record.deposed.join(", "));
                }
                let _ = writeln!(output, "   Attributes:");
                for (key, value) in &record.attributes {
                    let _ = writeln!(output, "     {key} = {value}");
                }
                output
            }
        }
    }

    /// Formats run history, newest last.
    #[must_use]
    pub fn format_history(&self, history: &[RunHistoryEntry]) -> String {
        match self.format {
            OutputFormat::Json => json(history),
            OutputFormat::Text => {
                if history.is_empty() {
                    return "No runs recorded.\n".to_string();
                }
                let rows: Vec<HistoryRow> = history
                    .iter()
                    .map(|entry| HistoryRow {
                        when: entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        operation: entry.operation.to_string(),
                        succeeded: entry.succeeded,
                        failed: entry.failed,
                        skipped: entry.skipped,
                        cancelled: entry.cancelled,
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, _) => json(&lock),
            (OutputFormat::Text, None) => "State is not locked.\n".to_string(),
            (OutputFormat::Text, Some(lock)) => format!(
                "State locked by {} (lock {}, {}s remaining)\n",
                lock.holder,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => {
                let marker = match status {
                    "success" => "✓".green(),
                    "error" => "✗".red(),
                    _ => "⚠".yellow(),
                };
                format!("{marker} {message}\n")
            }
        }
    }

    /// Formats a change action with color.
    fn format_action(change: &ResourceChange) -> String {
        let label = format!("{} {}", change.action.symbol(), change.action);
        match change.action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update => label.yellow().to_string(),
            ChangeAction::Destroy => label.red().to_string(),
            ChangeAction::Replace(_) => label.magenta().to_string(),
            ChangeAction::NoOp => format!("cleanup ({} deposed)", change.deposed.len())
                .dimmed()
                .to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        let text = status.to_string();
        match status {
            NodeStatus::Succeeded => text.green().to_string(),
            NodeStatus::Failed => text.red().to_string(),
            NodeStatus::Skipped | NodeStatus::Cancelled => text.yellow().to_string(),
            NodeStatus::Pending | NodeStatus::Running => text.dimmed().to_string(),
        }
    }

    fn changed_paths(change: &ResourceChange) -> String {
        let paths: Vec<&str> = change.diffs.iter().map(|d| d.path.as_str()).collect();
        paths.join(", ")
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

fn json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut output = serde_json::to_string_pretty(value).unwrap_or_default();
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Attributes, ResourceSpec, Value};
    use crate::planner::Planner;
    use crate::provider::fake::FakeCloud;

    fn plan() -> Plan {
        let registry = FakeCloud::new().registry(&["vpc"]);
        let spec = ResourceSpec::new(
            "vpc.main".parse().unwrap(),
            [("cidr".to_string(), Value::from("10.0.0.0/16"))].into(),
        )
        .unwrap();
        Planner::new(&registry)
            .plan_snapshot(
                crate::planner::PlanIntent::Apply,
                &[spec],
                &[],
                &StateSnapshot::empty("lineage"),
            )
            .unwrap()
    }

    #[test]
    fn test_plan_text_lists_changes() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);
        assert!(text.contains("vpc.main"));
        assert!(text.contains("1 to create"));
        assert!(text.contains("cidr"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let text = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["intent"], "apply");
        assert_eq!(parsed["changes"][0]["address"], "vpc.main");
    }

    #[test]
    fn test_empty_state_listing() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert!(formatter
            .format_records(&StateSnapshot::empty("l"))
            .contains("No resources"));

        let record = StateRecord::new("vpc.main".parse().unwrap(), "vpc", "vpc-1", Attributes::new());
        assert!(formatter.format_record(&record).contains("vpc-1"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
