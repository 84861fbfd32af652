//! Plan construction and plan files.
//!
//! A [`Plan`] is computed once from (specs, moves, state) and consumed by
//! value when executed. Plans saved to a file carry the fingerprint of
//! their inputs and are rejected once those inputs change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConfigHasher, Move, ResourceAddress, ResourceSpec};
use crate::error::{ForgeError, PlanError, Result};
use crate::graph::{DependencyEdge, EdgeKind, ResourceGraph};
use crate::provider::ProviderRegistry;
use crate::state::{StateSnapshot, StateStore};

use super::diff::{ChangeAction, DiffEngine, ResourceChange};
use super::scheduler::ExecutionGraph;

/// Current plan file format.
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// What a plan is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanIntent {
    /// Converge state towards configuration.
    Apply,
    /// Destroy everything in state.
    Destroy,
}

/// An immutable set of changes in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan file format version.
    pub format_version: u32,
    /// Unique plan identifier.
    pub id: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Whether the plan converges or tears down.
    pub intent: PlanIntent,
    /// Fingerprint of the specs, moves and state the plan was computed from.
    pub fingerprint: String,
    /// Moves to commit before any change runs.
    pub moves: Vec<Move>,
    /// Graph used to order the changes.
    pub graph: ResourceGraph,
    /// One change per address, in execution order.
    pub changes: Vec<ResourceChange>,
}

/// Change counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Addresses to create.
    pub create: usize,
    /// Addresses updated in place.
    pub update: usize,
    /// Addresses to replace.
    pub replace: usize,
    /// Addresses to destroy.
    pub destroy: usize,
    /// Addresses already converged.
    pub unchanged: usize,
    /// Recorded moves.
    pub moved: usize,
}

/// Builds plans from specs and state.
#[derive(Debug)]
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
    hasher: ConfigHasher,
}

impl<'a> Planner<'a> {
    /// Creates a planner using the schemas in `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            hasher: ConfigHasher::new(),
        }
    }

    /// Plans an apply against the store's current state.
    ///
    /// # Errors
    ///
    /// Returns a planning error (configuration, cycle, blocked destroy,
    /// invalid move) or a state error if the snapshot cannot be read.
    pub async fn plan<S>(&self, specs: &[ResourceSpec], moves: &[Move], store: &S) -> Result<Plan>
    where
        S: StateStore + ?Sized,
    {
        let snapshot = store.snapshot().await?;
        self.plan_snapshot(PlanIntent::Apply, specs, moves, &snapshot)
    }

    /// Plans destruction of everything in the store.
    ///
    /// # Errors
    ///
    /// Same as [`Planner::plan`].
    pub async fn plan_destroy<S>(&self, specs: &[ResourceSpec], moves: &[Move], store: &S) -> Result<Plan>
    where
        S: StateStore + ?Sized,
    {
        let snapshot = store.snapshot().await?;
        self.plan_snapshot(PlanIntent::Destroy, specs, moves, &snapshot)
    }

    /// Plans against an explicit snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`Planner::plan`].
    pub fn plan_snapshot(
        &self,
        intent: PlanIntent,
        specs: &[ResourceSpec],
        moves: &[Move],
        snapshot: &StateSnapshot,
    ) -> Result<Plan> {
        let fingerprint = self.hasher.fingerprint(specs, moves, snapshot);
        let (working, moves) = apply_moves(snapshot, moves)?;

        let engine = DiffEngine::new(self.registry);
        let (graph, diff) = match intent {
            PlanIntent::Apply => {
                let graph = ResourceGraph::build(specs)?;
                let diff = engine.compute(specs, &graph, &working)?;
                (graph, diff)
            }
            PlanIntent::Destroy => (state_graph(&working)?, engine.compute_destroy(&working)?),
        };

        let changes = execution_order(diff.changes)?;
        let plan = Plan {
            format_version: PLAN_FORMAT_VERSION,
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            intent,
            fingerprint,
            moves,
            graph,
            changes,
        };
        info!(
            "Planned {:?}: {} ({})",
            intent,
            plan.summary(),
            ConfigHasher::short_hash(&plan.fingerprint)
        );
        Ok(plan)
    }

    /// Checks that a saved plan still matches its inputs.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::StalePlan`] if configuration or state changed
    /// since the plan was computed.
    pub async fn verify<S>(&self, plan: &Plan, specs: &[ResourceSpec], moves: &[Move], store: &S) -> Result<()>
    where
        S: StateStore + ?Sized,
    {
        let snapshot = store.snapshot().await?;
        let found = self.hasher.fingerprint(specs, moves, &snapshot);
        if found != plan.fingerprint {
            return Err(PlanError::StalePlan {
                expected: plan.fingerprint.clone(),
                found,
            }
            .into());
        }
        debug!("Plan {} matches current inputs", plan.id);
        Ok(())
    }
}

/// Applies moves to a copy of the snapshot.
///
/// Returns the moved snapshot and the moves that still need committing.
/// A move whose source is gone is treated as already done.
fn apply_moves(snapshot: &StateSnapshot, moves: &[Move]) -> Result<(StateSnapshot, Vec<Move>)> {
    let mut working = snapshot.clone();
    let mut pending = Vec::new();
    for moved in moves {
        let Some(mut record) = working.records.remove(&moved.from) else {
            debug!("Move {} -> {} already applied", moved.from, moved.to);
            continue;
        };
        if working.records.contains_key(&moved.to) {
            return Err(PlanError::InvalidMove {
                from: moved.from.clone(),
                to: moved.to.clone(),
                reason: "both addresses are in state".to_string(),
            }
            .into());
        }
        record.address = moved.to.clone();
        working.records.insert(moved.to.clone(), record);
        pending.push(moved.clone());
    }
    Ok((working, pending))
}

/// Graph of recorded dependencies, for destroy plans.
fn state_graph(snapshot: &StateSnapshot) -> Result<ResourceGraph> {
    let nodes: Vec<ResourceAddress> = snapshot.records.keys().cloned().collect();
    let edges = snapshot
        .iter()
        .flat_map(|(address, record)| {
            record
                .dependencies
                .iter()
                .filter(|to| snapshot.records.contains_key(*to))
                .map(|to| DependencyEdge {
                    from: address.clone(),
                    to: to.clone(),
                    kind: EdgeKind::Explicit,
                })
        })
        .collect();
    Ok(ResourceGraph::from_parts(nodes, edges)?)
}

/// Sorts changes by their first execution node; changes without work last.
fn execution_order(changes: Vec<ResourceChange>) -> Result<Vec<ResourceChange>> {
    let graph = ExecutionGraph::build(&changes)?;
    let mut position: BTreeMap<&ResourceAddress, usize> = BTreeMap::new();
    for (i, node) in graph.topological_order().into_iter().enumerate() {
        position.entry(&node.address).or_insert(i);
    }
    let mut keyed: Vec<(usize, ResourceChange)> = changes
        .into_iter()
        .map(|c| (position.get(&c.address).copied().unwrap_or(usize::MAX), c))
        .collect();
    keyed.sort_by(|(a, ca), (b, cb)| a.cmp(b).then_with(|| ca.address.cmp(&cb.address)));
    Ok(keyed.into_iter().map(|(_, c)| c).collect())
}

impl Plan {
    /// Returns true if executing the plan would do nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && !self.changes.iter().any(ResourceChange::has_work)
    }

    /// Changes that have work to do.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ResourceChange> {
        self.changes.iter().filter(|c| c.has_work()).collect()
    }

    /// The change for an address.
    #[must_use]
    pub fn change(&self, address: &ResourceAddress) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| &c.address == address)
    }

    /// Counts changes per action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            moved: self.moves.len(),
            ..PlanSummary::default()
        };
        for change in &self.changes {
            match change.action {
                ChangeAction::NoOp => summary.unchanged += 1,
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Destroy => summary.destroy += 1,
                ChangeAction::Replace(_) => summary.replace += 1,
            }
        }
        summary
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be serialized or written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| invalid_file(path, &e))?;
        tokio::fs::write(path, content).await?;
        info!("Saved plan {} to {}", self.id, path.display());
        Ok(())
    }

    /// Reads a plan written by [`Plan::save`].
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidPlanFile`] if the file is unreadable,
    /// malformed or of another format version.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid_file(path, &e))?;
        let plan: Self = serde_json::from_str(&content).map_err(|e| invalid_file(path, &e))?;
        if plan.format_version != PLAN_FORMAT_VERSION {
            return Err(PlanError::InvalidPlanFile {
                path: path.to_path_buf(),
                message: format!(
                    "format version {} is not supported (expected {PLAN_FORMAT_VERSION})",
                    plan.format_version
                ),
            }
            .into());
        }
        Ok(plan)
    }
}

fn invalid_file(path: &Path, error: &dyn fmt::Display) -> ForgeError {
    ForgeError::Plan(PlanError::InvalidPlanFile {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

impl PlanSummary {
    /// Returns true if anything would change.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.create + self.update + self.replace + self.destroy + self.moved > 0
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )?;
        if self.moved > 0 {
            write!(f, ", {} to move", self.moved)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. State matches configuration.");
        }
        for moved in &self.moves {
            writeln!(f, "  {} -> {} (moved)", moved.from, moved.to)?;
        }
        for change in self.actionable() {
            writeln!(f, "  {change}")?;
        }
        write!(f, "Plan: {}", self.summary())
    }
}
