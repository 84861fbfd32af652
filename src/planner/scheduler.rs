//! Plan execution.
//!
//! A plan expands into an [`ExecutionGraph`] of provisioning calls with
//! "must happen before" edges. The [`Scheduler`] walks it with a ready
//! set, runs at most `parallelism` nodes at a time and commits each
//! success to the state store before any dependent is dispatched.

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Serialize, Serializer};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    find_references, lookup_known, resolve_attributes, Attributes, Move, PlannedValue, Reference,
    ResourceAddress, ResourceSpec, Settings,
};
use crate::error::{CycleError, ForgeError, GraphError, NodeError, ProvisionError, ProvisionResult, Result};
use crate::graph::find_cycle;
use crate::provider::{ProviderRegistry, Provisioner};
use crate::state::{move_record, RunHistoryEntry, RunOperation, StateRecord, StateStore};

use super::diff::{ChangeAction, ResourceChange};
use super::lifecycle::{carry_ignored, ReplaceMode};
use super::plan::{Plan, PlanIntent};

/// Default number of nodes in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Default per-action deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NodeKind {
    /// Create a new object.
    Create,
    /// Update the object in place.
    Update,
    /// Delete the object.
    Destroy,
    /// New object of a replacement.
    CreateReplacement(ReplaceMode),
    /// Old object of a replacement.
    DestroyReplaced(ReplaceMode),
    /// Leftover object of an earlier create-first replacement.
    DestroyDeposed(String),
}

/// A node of the execution graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExecNode {
    /// Address the step acts on.
    pub address: ResourceAddress,
    /// What the step does.
    pub kind: NodeKind,
}

/// Provisioning steps with "must happen before" edges.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    graph: DiGraph<ExecNode, ()>,
    index: BTreeMap<ExecNode, NodeIndex>,
}

/// Lifecycle of a node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not dispatched yet.
    Pending,
    /// In flight.
    Running,
    /// Finished and committed.
    Succeeded,
    /// Provisioning or the state write failed.
    Failed,
    /// A predecessor failed.
    Skipped,
    /// The run was cancelled before the node was dispatched.
    Cancelled,
}

/// Final outcome of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeOutcome {
    /// Address of the node.
    pub address: ResourceAddress,
    /// Step kind.
    pub kind: NodeKind,
    /// Final status.
    pub status: NodeStatus,
    /// Error of a failed node.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<NodeError>,
    /// Logical clock value when the node started.
    pub start_seq: Option<u64>,
    /// Logical clock value after the node committed its result.
    pub finish_seq: Option<u64>,
    /// Wall-clock start.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock finish.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier of the executed plan.
    pub plan_id: String,
    /// Intent of the executed plan.
    pub intent: PlanIntent,
    /// Moves committed before execution.
    pub moved: Vec<Move>,
    /// Node outcomes in execution graph order.
    pub outcomes: Vec<NodeOutcome>,
    /// Addresses whose every node succeeded.
    pub succeeded: BTreeSet<ResourceAddress>,
    /// Failed addresses with the triggering error.
    pub failed: BTreeMap<ResourceAddress, String>,
    /// Addresses skipped because a predecessor failed.
    pub skipped: BTreeSet<ResourceAddress>,
    /// Addresses never dispatched because the run was cancelled.
    pub cancelled: BTreeSet<ResourceAddress>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
}

/// Execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Maximum nodes in flight, at least 1.
    pub parallelism: usize,
    /// Deadline for nodes whose spec sets none.
    pub default_timeout: Duration,
}

/// Executes plans against provisioning clients and a state store.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
    options: SchedulerOptions,
    cancel: CancellationToken,
}

impl ExecutionGraph {
    /// Expands changes into provisioning steps.
    ///
    /// Steps of one address run in a fixed sequence; across addresses:
    /// a create or update waits for the creates and updates of its
    /// dependencies, a destroy waits for the destroys of its recorded
    /// dependents, and a dependency destroyed outright or replaced
    /// create-first waits for its dependents' creates and updates.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the steps cannot be ordered.
    pub fn build(changes: &[ResourceChange]) -> std::result::Result<Self, GraphError> {
        let mut built = Self::default();
        let by_address: BTreeMap<&ResourceAddress, &ResourceChange> =
            changes.iter().map(|c| (&c.address, c)).collect();
        let mut creates: BTreeMap<&ResourceAddress, NodeIndex> = BTreeMap::new();
        let mut destroys: BTreeMap<&ResourceAddress, NodeIndex> = BTreeMap::new();

        for change in changes {
            let address = &change.address;
            let mut deposed: Vec<&String> = change.deposed.iter().collect();
            deposed.sort();
            deposed.dedup();

            let mut sequence: Vec<NodeIndex> = Vec::new();
            let add = |built: &mut Self, sequence: &mut Vec<NodeIndex>, kind: NodeKind| {
                let idx = built.add_node(address, kind);
                sequence.push(idx);
                idx
            };
            let add_deposed = |built: &mut Self, sequence: &mut Vec<NodeIndex>| {
                for id in &deposed {
                    add(built, sequence, NodeKind::DestroyDeposed((*id).clone()));
                }
            };

            match change.action {
                ChangeAction::NoOp => add_deposed(&mut built, &mut sequence),
                ChangeAction::Create => {
                    creates.insert(address, add(&mut built, &mut sequence, NodeKind::Create));
                }
                ChangeAction::Update => {
                    creates.insert(address, add(&mut built, &mut sequence, NodeKind::Update));
                    add_deposed(&mut built, &mut sequence);
                }
                ChangeAction::Destroy => {
                    add_deposed(&mut built, &mut sequence);
                    destroys.insert(address, add(&mut built, &mut sequence, NodeKind::Destroy));
                }
                ChangeAction::Replace(mode @ ReplaceMode::DestroyFirst) => {
                    add_deposed(&mut built, &mut sequence);
                    let destroy = add(&mut built, &mut sequence, NodeKind::DestroyReplaced(mode));
                    destroys.insert(address, destroy);
                    let create = add(&mut built, &mut sequence, NodeKind::CreateReplacement(mode));
                    creates.insert(address, create);
                }
                ChangeAction::Replace(mode @ ReplaceMode::CreateFirst) => {
                    let create = add(&mut built, &mut sequence, NodeKind::CreateReplacement(mode));
                    creates.insert(address, create);
                    add_deposed(&mut built, &mut sequence);
                    let destroy = add(&mut built, &mut sequence, NodeKind::DestroyReplaced(mode));
                    destroys.insert(address, destroy);
                }
            }
            for pair in sequence.windows(2) {
                built.graph.update_edge(pair[0], pair[1], ());
            }
        }

        for change in changes {
            let address = &change.address;
            let desired_deps = change
                .desired
                .as_ref()
                .map(ResourceSpec::dependencies)
                .unwrap_or_default();
            let recorded_deps = change
                .prior
                .as_ref()
                .map(|p| p.dependencies.clone())
                .unwrap_or_default();

            if let Some(&create) = creates.get(address) {
                for dependency in &desired_deps {
                    if let Some(&before) = creates.get(dependency) {
                        built.graph.update_edge(before, create, ());
                    }
                }
                for dependency in desired_deps.union(&recorded_deps) {
                    let Some(dep_change) = by_address.get(dependency) else {
                        continue;
                    };
                    let released = matches!(
                        dep_change.action,
                        ChangeAction::Destroy | ChangeAction::Replace(ReplaceMode::CreateFirst)
                    );
                    if released && let Some(&after) = destroys.get(dependency) {
                        built.graph.update_edge(create, after, ());
                    }
                }
            }

            if let Some(&destroy) = destroys.get(address) {
                for dependency in &recorded_deps {
                    if let Some(&after) = destroys.get(dependency) {
                        built.graph.update_edge(destroy, after, ());
                    }
                }
            }
        }

        if let Some(cycle) = find_cycle(&built.graph) {
            return Err(CycleError { cycle }.into());
        }
        debug!(
            "Built execution graph with {} node(s) and {} edge(s)",
            built.graph.node_count(),
            built.graph.edge_count()
        );
        Ok(built)
    }

    fn add_node(&mut self, address: &ResourceAddress, kind: NodeKind) -> NodeIndex {
        let node = ExecNode {
            address: address.clone(),
            kind,
        };
        let idx = self.graph.add_node(node.clone());
        self.index.insert(node, idx);
        idx
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if `node` is part of the graph.
    #[must_use]
    pub fn contains(&self, node: &ExecNode) -> bool {
        self.index.contains_key(node)
    }

    /// Steps that must finish before `node` starts.
    #[must_use]
    pub fn predecessors(&self, node: &ExecNode) -> BTreeSet<&ExecNode> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Steps that wait for `node`.
    #[must_use]
    pub fn successors(&self, node: &ExecNode) -> BTreeSet<&ExecNode> {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: &ExecNode, direction: Direction) -> BTreeSet<&ExecNode> {
        self.index
            .get(node)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| &self.graph[n])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Steps in a valid execution order, ties broken by (address, kind).
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ExecNode> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<(&ExecNode, NodeIndex)>> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .map(|i| Reverse((&self.graph[i], i)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((node, idx))) = ready.pop() {
            order.push(node);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse((&self.graph[next], next)));
                }
            }
        }
        order
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SchedulerOptions {
    /// Options from configuration settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            parallelism: settings.parallelism.max(1),
            default_timeout: settings.default_timeout(),
        }
    }

    /// Sets the in-flight bound, clamped to at least 1.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the deadline for nodes without their own timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Work handed to one worker.
struct NodeTask {
    node: ExecNode,
    change: ResourceChange,
    store: Arc<dyn StateStore>,
    provisioner: Option<Arc<dyn Provisioner>>,
    expected_serial: u64,
    timeout: Duration,
    clock: Arc<AtomicU64>,
}

/// What a worker reports back.
struct NodeResult {
    start_seq: Option<u64>,
    finish_seq: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Serial of the committed record; `None` if the record was removed.
    outcome: std::result::Result<Option<u64>, NodeError>,
}

impl Scheduler {
    /// Creates a scheduler with default options.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            options: SchedulerOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the execution settings.
    #[must_use]
    pub const fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops dispatch of new nodes when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current execution settings.
    #[must_use]
    pub const fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Executes a plan.
    ///
    /// Provisioning failures do not abort the run; they are reported per
    /// node and cascade to dependents as skips.
    ///
    /// # Errors
    ///
    /// Returns an error only if the plan's moves cannot be committed or
    /// its changes cannot be ordered. Nothing has been provisioned then.
    pub async fn execute(&self, plan: Plan) -> Result<RunReport> {
        let Plan {
            id: plan_id,
            intent,
            moves,
            mut changes,
            ..
        } = plan;
        let started_at = Utc::now();

        for moved in &moves {
            let committed = move_record(self.store.as_ref(), &moved.from, &moved.to).await?;
            if let Some(prior) = changes
                .iter_mut()
                .find(|c| c.address == moved.to)
                .and_then(|c| c.prior.as_mut())
            {
                prior.serial = committed.serial;
                prior.address = committed.address;
            }
        }

        let exec = ExecutionGraph::build(&changes)?;
        let graph = &exec.graph;
        let node_count = graph.node_count();
        info!(
            "Executing plan {plan_id}: {node_count} step(s), parallelism {}",
            self.options.parallelism
        );

        let mut serials: BTreeMap<ResourceAddress, u64> = changes
            .iter()
            .map(|c| (c.address.clone(), c.prior.as_ref().map_or(0, |p| p.serial)))
            .collect();
        let changes: BTreeMap<ResourceAddress, ResourceChange> =
            changes.into_iter().map(|c| (c.address.clone(), c)).collect();

        let mut status = vec![NodeStatus::Pending; node_count];
        let mut results: Vec<Option<NodeResult>> = (0..node_count).map(|_| None).collect();
        let mut remaining: Vec<usize> = graph
            .node_indices()
            .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<(&ExecNode, NodeIndex)> = graph
            .node_indices()
            .filter(|i| remaining[i.index()] == 0)
            .map(|i| (&graph[i], i))
            .collect();

        let clock = Arc::new(AtomicU64::new(1));
        let mut workers = JoinSet::new();
        loop {
            while workers.len() < self.options.parallelism && !self.cancel.is_cancelled() {
                let Some((node, idx)) = ready.pop_first() else {
                    break;
                };
                let Some(change) = changes.get(&node.address) else {
                    return Err(ForgeError::internal(format!("no change for {}", node.address)));
                };
                status[idx.index()] = NodeStatus::Running;
                debug!("Dispatching {node}");

                let task = NodeTask {
                    node: node.clone(),
                    change: change.clone(),
                    store: Arc::clone(&self.store),
                    provisioner: self.registry.get(change.provider()),
                    expected_serial: serials.get(&node.address).copied().unwrap_or(0),
                    timeout: change
                        .desired
                        .as_ref()
                        .and_then(ResourceSpec::timeout)
                        .unwrap_or(self.options.default_timeout),
                    clock: Arc::clone(&clock),
                };
                workers.spawn(async move {
                    let joined = tokio::spawn(task.run()).await;
                    (idx, joined)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (idx, joined) =
                joined.map_err(|e| ForgeError::internal(format!("scheduler worker failed: {e}")))?;
            let result = joined.unwrap_or_else(|e| NodeResult {
                start_seq: None,
                finish_seq: None,
                started_at: None,
                finished_at: Some(Utc::now()),
                outcome: Err(NodeError::Internal(format!("worker panicked: {e}"))),
            });

            let node = &graph[idx];
            match &result.outcome {
                Ok(serial) => {
                    status[idx.index()] = NodeStatus::Succeeded;
                    serials.insert(node.address.clone(), serial.unwrap_or(0));
                    info!("{node}: done");
                    for next in graph.neighbors_directed(idx, Direction::Outgoing) {
                        remaining[next.index()] -= 1;
                        if remaining[next.index()] == 0 && status[next.index()] == NodeStatus::Pending {
                            ready.insert((&graph[next], next));
                        }
                    }
                }
                Err(e) => {
                    status[idx.index()] = NodeStatus::Failed;
                    error!("{node}: {e}");
                    let mut dfs = Dfs::new(graph, idx);
                    while let Some(dependent) = dfs.next(graph) {
                        if status[dependent.index()] == NodeStatus::Pending {
                            warn!("{}: skipped because {node} failed", graph[dependent]);
                            status[dependent.index()] = NodeStatus::Skipped;
                            ready.remove(&(&graph[dependent], dependent));
                        }
                    }
                }
            }
            results[idx.index()] = Some(result);
        }

        if self.cancel.is_cancelled() {
            for state in &mut status {
                if *state == NodeStatus::Pending {
                    *state = NodeStatus::Cancelled;
                }
            }
            warn!("Run cancelled; undispatched steps were left untouched");
        }

        let outcomes = exec
            .topological_order()
            .into_iter()
            .filter_map(|node| exec.index.get(node).map(|&idx| (node, idx)))
            .map(|(node, idx)| {
                let result = results[idx.index()].take();
                NodeOutcome {
                    address: node.address.clone(),
                    kind: node.kind.clone(),
                    status: status[idx.index()],
                    error: result.as_ref().and_then(|r| r.outcome.as_ref().err().cloned()),
                    start_seq: result.as_ref().and_then(|r| r.start_seq),
                    finish_seq: result.as_ref().and_then(|r| r.finish_seq),
                    started_at: result.as_ref().and_then(|r| r.started_at),
                    finished_at: result.as_ref().and_then(|r| r.finished_at),
                }
            })
            .collect();

        let report = RunReport::new(plan_id, intent, moves, outcomes, started_at);
        info!(
            "Run finished: {} succeeded, {} failed, {} skipped, {} cancelled",
            report.succeeded.len(),
            report.failed.len(),
            report.skipped.len(),
            report.cancelled.len()
        );
        if let Err(e) = self.store.append_history(report.history_entry()).await {
            warn!("Failed to record run history: {e}");
        }
        Ok(report)
    }
}

impl NodeTask {
    async fn run(self) -> NodeResult {
        let started_at = Utc::now();
        let start_seq = self.clock.fetch_add(1, Ordering::SeqCst);
        let outcome = self.perform().await;
        let finish_seq = self.clock.fetch_add(1, Ordering::SeqCst);
        NodeResult {
            start_seq: Some(start_seq),
            finish_seq: Some(finish_seq),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            outcome,
        }
    }

    async fn perform(&self) -> std::result::Result<Option<u64>, NodeError> {
        match &self.node.kind {
            NodeKind::Create | NodeKind::CreateReplacement(_) => self.create().await,
            NodeKind::Update => self.update().await,
            NodeKind::Destroy | NodeKind::DestroyReplaced(ReplaceMode::DestroyFirst) => self.destroy().await,
            NodeKind::DestroyReplaced(ReplaceMode::CreateFirst) => {
                let prior = self.change.prior.as_ref().ok_or_else(|| missing("recorded object"))?;
                self.destroy_deposed(&prior.real_id).await
            }
            NodeKind::DestroyDeposed(real_id) => self.destroy_deposed(real_id).await,
        }
    }

    async fn create(&self) -> std::result::Result<Option<u64>, NodeError> {
        let address = &self.node.address;
        let spec = self.desired()?;
        let provisioner = self.provisioner()?;
        let attributes = self.resolve(spec).await?;

        let created = self.deadline(provisioner.create(&attributes)).await?;
        debug!("{address}: created {}", created.real_id);

        let live = self.store.get(address).await.map_err(|e| NodeError::state(&e))?;
        let mut record = StateRecord::new(
            address.clone(),
            spec.provider.clone(),
            created.real_id.clone(),
            created.attributes,
        )
        .with_dependencies(spec.dependencies())
        .with_lifecycle(spec.lifecycle.clone());
        if let Some(previous) = live {
            record.deposed = previous.deposed;
            if self.node.kind == NodeKind::CreateReplacement(ReplaceMode::CreateFirst) {
                record.deposed.push(previous.real_id);
            }
        }
        self.commit(record, &created.real_id).await
    }

    async fn update(&self) -> std::result::Result<Option<u64>, NodeError> {
        let address = &self.node.address;
        let spec = self.desired()?;
        let provisioner = self.provisioner()?;
        let prior = self
            .store
            .get(address)
            .await
            .map_err(|e| NodeError::state(&e))?
            .ok_or_else(|| missing("recorded object"))?;

        let mut attributes = self.resolve(spec).await?;
        carry_ignored(&spec.lifecycle, &mut attributes, &prior.attributes);

        let updated = self
            .deadline(provisioner.update(&prior.real_id, &attributes))
            .await?;
        let real_id = prior.real_id.clone();
        let mut record = prior;
        record.attributes = updated;
        record.dependencies = spec.dependencies();
        record.lifecycle = spec.lifecycle.clone();
        self.commit(record, &real_id).await
    }

    async fn destroy(&self) -> std::result::Result<Option<u64>, NodeError> {
        let address = &self.node.address;
        let Some(record) = self.store.get(address).await.map_err(|e| NodeError::state(&e))? else {
            debug!("{address}: no longer in state");
            return Ok(None);
        };
        self.delete(&record.real_id).await?;
        self.store
            .remove(address, self.expected_serial)
            .await
            .map_err(|e| NodeError::state(&e))?;
        Ok(None)
    }

    async fn destroy_deposed(&self, real_id: &str) -> std::result::Result<Option<u64>, NodeError> {
        let address = &self.node.address;
        self.delete(real_id).await?;

        let Some(mut record) = self.store.get(address).await.map_err(|e| NodeError::state(&e))? else {
            return Ok(None);
        };
        record.deposed.retain(|id| id != real_id);
        let committed = self
            .store
            .put(address, record, self.expected_serial)
            .await
            .map_err(|e| NodeError::state(&e))?;
        Ok(Some(committed.serial))
    }

    /// Deletes an object; an object that is already gone counts as deleted.
    async fn delete(&self, real_id: &str) -> std::result::Result<(), NodeError> {
        let provisioner = self.provisioner()?;
        match self.deadline(provisioner.delete(real_id)).await {
            Ok(()) => Ok(()),
            Err(NodeError::Provision(ProvisionError::NotFound { .. })) => {
                debug!("{}: {real_id} already gone", self.node.address);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit(&self, record: StateRecord, real_id: &str) -> std::result::Result<Option<u64>, NodeError> {
        let address = &self.node.address;
        match self.store.put(address, record, self.expected_serial).await {
            Ok(committed) => Ok(Some(committed.serial)),
            Err(e) => {
                error!("{address}: object {real_id} exists but could not be recorded: {e}");
                Err(NodeError::state(&e))
            }
        }
    }

    /// Resolves references against the records committed so far.
    async fn resolve(&self, spec: &ResourceSpec) -> std::result::Result<Attributes, NodeError> {
        let module_path = &spec.address.module_path;
        let unresolved = |attribute: &str, reason: String| NodeError::Unresolved {
            attribute: attribute.to_string(),
            reason,
        };

        let mut targets = BTreeSet::new();
        for (key, value) in &spec.attributes {
            let references =
                find_references(value, module_path).map_err(|e| unresolved(key, e.to_string()))?;
            targets.extend(references.into_iter().map(|r| r.target));
        }
        let mut records = BTreeMap::new();
        for target in targets {
            if let Some(record) = self.store.get(&target).await.map_err(|e| NodeError::state(&e))? {
                records.insert(target, record.attributes);
            }
        }

        let mut missing_reference = None;
        let mut lookup = |reference: &Reference| {
            let value = records
                .get(&reference.target)
                .map_or(PlannedValue::Unknown, |attrs| lookup_known(attrs, reference));
            if value.is_unknown() && missing_reference.is_none() {
                missing_reference = Some(reference.to_string());
            }
            value
        };
        let resolved = resolve_attributes(&spec.attributes, module_path, &mut lookup)
            .map_err(|e| unresolved("attributes", e.to_string()))?;

        let mut attributes = Attributes::new();
        for (key, value) in resolved {
            match value {
                PlannedValue::Known(v) => {
                    attributes.insert(key, v);
                }
                PlannedValue::Unknown => {
                    let reason = missing_reference
                        .as_ref()
                        .map_or_else(|| "value not available".to_string(), |r| format!("{r} is not available"));
                    return Err(unresolved(&key, reason));
                }
            }
        }
        Ok(attributes)
    }

    async fn deadline<T>(
        &self,
        call: impl Future<Output = ProvisionResult<T>>,
    ) -> std::result::Result<T, NodeError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(NodeError::from),
            Err(_) => Err(ProvisionError::Timeout {
                address: self.node.address.to_string(),
                after: self.timeout,
            }
            .into()),
        }
    }

    fn desired(&self) -> std::result::Result<&ResourceSpec, NodeError> {
        self.change.desired.as_ref().ok_or_else(|| missing("desired spec"))
    }

    fn provisioner(&self) -> std::result::Result<&Arc<dyn Provisioner>, NodeError> {
        self.provisioner.as_ref().ok_or_else(|| {
            NodeError::Internal(format!("no provisioner for '{}'", self.change.provider()))
        })
    }
}

fn missing(what: &str) -> NodeError {
    NodeError::Internal(format!("{what} is missing"))
}

fn serialize_error<S: Serializer>(error: &Option<NodeError>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}

impl RunReport {
    fn new(
        plan_id: String,
        intent: PlanIntent,
        moved: Vec<Move>,
        outcomes: Vec<NodeOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut by_address: BTreeMap<&ResourceAddress, Vec<&NodeOutcome>> = BTreeMap::new();
        for outcome in &outcomes {
            by_address.entry(&outcome.address).or_default().push(outcome);
        }

        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeMap::new();
        let mut skipped = BTreeSet::new();
        let mut cancelled = BTreeSet::new();
        for (address, nodes) in by_address {
            if let Some(failure) = nodes.iter().find(|o| o.status == NodeStatus::Failed) {
                let message = failure
                    .error
                    .as_ref()
                    .map_or_else(|| "failed".to_string(), ToString::to_string);
                failed.insert(address.clone(), message);
            } else if nodes.iter().any(|o| o.status == NodeStatus::Skipped) {
                skipped.insert(address.clone());
            } else if nodes.iter().any(|o| o.status == NodeStatus::Cancelled) {
                cancelled.insert(address.clone());
            } else {
                succeeded.insert(address.clone());
            }
        }

        Self {
            plan_id,
            intent,
            moved,
            outcomes,
            succeeded,
            failed,
            skipped,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
    }

    /// Outcome of one step.
    #[must_use]
    pub fn outcome(&self, address: &ResourceAddress, kind: &NodeKind) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|o| &o.address == address && &o.kind == kind)
    }

    /// History entry summarizing this run.
    #[must_use]
    pub fn history_entry(&self) -> RunHistoryEntry {
        let mut entry = RunHistoryEntry::new(match self.intent {
            PlanIntent::Apply => RunOperation::Apply,
            PlanIntent::Destroy => RunOperation::Destroy,
        });
        entry.plan_id = Some(self.plan_id.clone());
        entry.succeeded = self.succeeded.len();
        entry.failed = self.failed.len();
        entry.skipped = self.skipped.len();
        entry.cancelled = self.cancelled.len();
        entry.error = self
            .failed
            .iter()
            .next()
            .map(|(address, message)| format!("{address}: {message}"));
        entry
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Destroy => write!(f, "destroy"),
            Self::CreateReplacement(mode) => write!(f, "create replacement ({mode})"),
            Self::DestroyReplaced(mode) => write!(f, "destroy replaced ({mode})"),
            Self::DestroyDeposed(id) => write!(f, "destroy deposed {id}"),
        }
    }
}

impl fmt::Display for ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.address)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
