//! Planning and execution module.
//!
//! This module turns desired specs and recorded state into a plan and
//! runs it:
//! - Diff engine classifying each address
//! - Lifecycle policy lookups
//! - Plans, plan files and staleness checks
//! - Execution graph and scheduler

mod diff;
mod lifecycle;
mod plan;
mod scheduler;

pub use diff::{AttributeDiff, ChangeAction, DiffEngine, DiffResult, ResourceChange};
pub use lifecycle::{carry_ignored, split_path, LifecycleTable, ReplaceMode};
pub use plan::{Plan, PlanIntent, PlanSummary, Planner, PLAN_FORMAT_VERSION};
pub use scheduler::{
    ExecNode, ExecutionGraph, NodeKind, NodeOutcome, NodeStatus, RunReport, Scheduler,
    SchedulerOptions, DEFAULT_PARALLELISM, DEFAULT_TIMEOUT,
};
