//! Resource dependency graph.
//!
//! This module provides the graph the planner works on:
//! - Nodes for every resource spec, edges from `depends_on` and references
//! - Cycle detection by iterative DFS coloring, reporting the full cycle
//! - Topological order with address-lexical tie-breaking
//! - Dependency and dependent queries, DOT rendering
//!
//! Edges in the underlying petgraph point from a dependency to its
//! dependent, i.e. in the order work has to happen.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::{self, Display, Write as _};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ResourceAddress, ResourceSpec};
use crate::error::{CycleError, GraphError};

/// How a dependency was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Listed in `depends_on`.
    Explicit,
    /// Inferred from a `${...}` reference.
    Implicit,
}

/// `from` must be processed after `to` (and destroyed before it).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent resource.
    pub from: ResourceAddress,
    /// The resource it depends on.
    pub to: ResourceAddress,
    /// How the dependency was declared.
    pub kind: EdgeKind,
}

/// A directed acyclic graph of resource addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "GraphData", try_from = "GraphData")]
pub struct ResourceGraph {
    graph: DiGraph<ResourceAddress, EdgeKind>,
    index: BTreeMap<ResourceAddress, NodeIndex>,
}

/// Serialized form of a [`ResourceGraph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphData {
    nodes: Vec<ResourceAddress>,
    edges: Vec<DependencyEdge>,
}

impl ResourceGraph {
    /// Builds the graph for a set of specs.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDependency`] if a spec depends on an
    /// address outside the set and [`GraphError::Cycle`] if the
    /// dependencies form a cycle.
    pub fn build(specs: &[ResourceSpec]) -> Result<Self, GraphError> {
        let nodes = specs.iter().map(|s| s.address.clone()).collect();
        let mut edges = Vec::new();
        for spec in specs {
            for to in &spec.depends_on {
                edges.push(DependencyEdge {
                    from: spec.address.clone(),
                    to: to.clone(),
                    kind: EdgeKind::Explicit,
                });
            }
            for to in spec.references.difference(&spec.depends_on) {
                edges.push(DependencyEdge {
                    from: spec.address.clone(),
                    to: to.clone(),
                    kind: EdgeKind::Implicit,
                });
            }
        }
        Self::from_parts(nodes, edges)
    }

    /// Builds the graph from explicit nodes and edges.
    ///
    /// Duplicate edges collapse; an explicit declaration wins.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceGraph::build`].
    pub fn from_parts(
        nodes: Vec<ResourceAddress>,
        edges: Vec<DependencyEdge>,
    ) -> Result<Self, GraphError> {
        let mut nodes = nodes;
        nodes.sort();
        nodes.dedup();

        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index = BTreeMap::new();
        for address in nodes {
            let idx = graph.add_node(address.clone());
            index.insert(address, idx);
        }

        let mut kinds: BTreeMap<(NodeIndex, NodeIndex), EdgeKind> = BTreeMap::new();
        for edge in edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                return Err(GraphError::UnknownDependency {
                    from: edge.from,
                    to: edge.to,
                });
            };
            let kind = kinds.entry((to, from)).or_insert(edge.kind);
            *kind = (*kind).min(edge.kind);
        }
        for ((before, after), kind) in kinds {
            graph.add_edge(before, after, kind);
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(CycleError { cycle }.into());
        }

        debug!(
            "Built resource graph with {} node(s) and {} edge(s)",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(Self { graph, index })
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if the address is a node of the graph.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// All addresses in lexical order.
    pub fn addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.index.keys()
    }

    /// All edges, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_references()
            .map(|e| DependencyEdge {
                from: self.graph[e.target()].clone(),
                to: self.graph[e.source()].clone(),
                kind: *e.weight(),
            })
            .collect();
        edges.sort();
        edges
    }

    /// Direct dependencies of an address.
    #[must_use]
    pub fn dependencies(&self, address: &ResourceAddress) -> BTreeSet<&ResourceAddress> {
        self.neighbors(address, Direction::Incoming)
    }

    /// Direct dependents of an address.
    #[must_use]
    pub fn dependents(&self, address: &ResourceAddress) -> BTreeSet<&ResourceAddress> {
        self.neighbors(address, Direction::Outgoing)
    }

    /// Every address that depends on `address`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, address: &ResourceAddress) -> BTreeSet<&ResourceAddress> {
        self.reachable(address, Direction::Outgoing)
    }

    /// Every address `address` depends on, directly or not.
    #[must_use]
    pub fn transitive_dependencies(&self, address: &ResourceAddress) -> BTreeSet<&ResourceAddress> {
        self.reachable(address, Direction::Incoming)
    }

    /// Addresses in dependency order, ties broken lexically.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceAddress> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<(&ResourceAddress, NodeIndex)>> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(|idx| Reverse((&self.graph[idx], idx)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((address, idx))) = ready.pop() {
            order.push(address);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse((&self.graph[next], next)));
                }
            }
        }
        order
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph forgeplan {\n  rankdir = \"RL\";\n");
        for address in self.index.keys() {
            let _ = writeln!(out, "  \"{address}\";");
        }
        for edge in self.edges() {
            let style = match edge.kind {
                EdgeKind::Explicit => "",
                EdgeKind::Implicit => " [style = dashed]",
            };
            let _ = writeln!(out, "  \"{}\" -> \"{}\"{style};", edge.from, edge.to);
        }
        out.push_str("}\n");
        out
    }

    fn neighbors(&self, address: &ResourceAddress, direction: Direction) -> BTreeSet<&ResourceAddress> {
        self.index.get(address).map_or_else(BTreeSet::new, |&idx| {
            self.graph
                .neighbors_directed(idx, direction)
                .map(|n| &self.graph[n])
                .collect()
        })
    }

    fn reachable(&self, address: &ResourceAddress, direction: Direction) -> BTreeSet<&ResourceAddress> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(address) else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if seen.insert(&self.graph[next]) {
                    stack.push(next);
                }
            }
        }
        seen
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Finds a cycle in any directed graph by iterative DFS coloring.
///
/// Nodes and neighbours are visited in node order, so the reported cycle
/// is deterministic. The result lists the cycle in edge direction with
/// the first node repeated at the end; a self-loop yields `[a, a]`.
#[must_use]
pub fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<String>>
where
    N: Ord + Display,
{
    let mut color = vec![Color::White; graph.node_count()];
    let sorted_neighbors = |idx: NodeIndex| {
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
        next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        next.dedup();
        next
    };

    let mut starts: Vec<NodeIndex> = graph.node_indices().collect();
    starts.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

    for start in starts {
        if color[start.index()] != Color::White {
            continue;
        }
        color[start.index()] = Color::Grey;
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = vec![(start, sorted_neighbors(start), 0)];

        while let Some((node, neighbors, pos)) = stack.last_mut() {
            let Some(&next) = neighbors.get(*pos) else {
                color[node.index()] = Color::Black;
                stack.pop();
                continue;
            };
            *pos += 1;
            match color[next.index()] {
                Color::White => {
                    color[next.index()] = Color::Grey;
                    stack.push((next, sorted_neighbors(next), 0));
                }
                Color::Grey => {
                    let begin = stack.iter().position(|(n, _, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[begin..].iter().map(|(n, _, _)| graph[*n].to_string()).collect();
                    cycle.push(graph[next].to_string());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
    }
    None
}

impl From<ResourceGraph> for GraphData {
    fn from(graph: ResourceGraph) -> Self {
        Self {
            edges: graph.edges(),
            nodes: graph.index.into_keys().collect(),
        }
    }
}

impl TryFrom<GraphData> for ResourceGraph {
    type Error = GraphError;

    fn try_from(data: GraphData) -> Result<Self, Self::Error> {
        Self::from_parts(data.nodes, data.edges)
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Implicit => write!(f, "implicit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn spec(address: &str, deps: &[&str]) -> ResourceSpec {
        deps.iter().fold(
            ResourceSpec::new(addr(address), BTreeMap::new()).unwrap(),
            |spec, dep| spec.with_dependency(addr(dep)),
        )
    }

    fn spec_ref(address: &str, reference: &str) -> ResourceSpec {
        ResourceSpec::new(
            addr(address),
            [("x".to_string(), Value::from(format!("${{{reference}.id}}")))].into(),
        )
        .unwrap()
    }

    fn names<'a>(items: impl IntoIterator<Item = &'a ResourceAddress>) -> Vec<String> {
        items.into_iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_vpc_subnet_order() {
        let graph = ResourceGraph::build(&[
            spec("null_resource.subnet", &["null_resource.vpc"]),
            spec("null_resource.vpc", &[]),
        ])
        .unwrap();
        assert_eq!(
            names(graph.topological_order()),
            vec!["null_resource.vpc", "null_resource.subnet"]
        );
    }

    #[test]
    fn test_lexical_tiebreak() {
        let graph = ResourceGraph::build(&[
            spec("null_resource.c", &[]),
            spec("null_resource.a", &["null_resource.c"]),
            spec("null_resource.b", &[]),
        ])
        .unwrap();
        assert_eq!(
            names(graph.topological_order()),
            vec!["null_resource.b", "null_resource.c", "null_resource.a"]
        );
    }

    #[test]
    fn test_implicit_edges_from_references() {
        let graph = ResourceGraph::build(&[
            spec_ref("local_file.cfg", "null_resource.seed"),
            spec("null_resource.seed", &[]),
        ])
        .unwrap();
        let edges = graph.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::Implicit);
        assert_eq!(edges[0].from, addr("local_file.cfg"));
    }

    #[test]
    fn test_explicit_wins_over_implicit() {
        let both = spec_ref("local_file.cfg", "null_resource.seed").with_dependency(addr("null_resource.seed"));
        let graph = ResourceGraph::build(&[both, spec("null_resource.seed", &[])]).unwrap();
        let edges = graph.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::Explicit);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let err = ResourceGraph::build(&[
            spec("null_resource.a", &["null_resource.b"]),
            spec("null_resource.b", &["null_resource.c"]),
            spec("null_resource.c", &["null_resource.a"]),
            spec("null_resource.d", &[]),
        ])
        .unwrap_err();
        let GraphError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle.cycle.len(), 4);
        assert_eq!(cycle.cycle.first(), cycle.cycle.last());
        assert!(!cycle.cycle.iter().any(|a| a == "null_resource.d"));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = ResourceGraph::build(&[spec_ref("null_resource.a", "null_resource.a")]).unwrap_err();
        let GraphError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle.cycle, vec!["null_resource.a", "null_resource.a"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ResourceGraph::build(&[spec("null_resource.a", &["null_resource.ghost"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { ref to, .. } if *to == addr("null_resource.ghost")));
    }

    #[test]
    fn test_transitive_queries() {
        let graph = ResourceGraph::build(&[
            spec("null_resource.a", &[]),
            spec("null_resource.b", &["null_resource.a"]),
            spec("null_resource.c", &["null_resource.b"]),
            spec("null_resource.x", &[]),
        ])
        .unwrap();
        assert_eq!(
            names(graph.transitive_dependents(&addr("null_resource.a"))),
            vec!["null_resource.b", "null_resource.c"]
        );
        assert_eq!(
            names(graph.transitive_dependencies(&addr("null_resource.c"))),
            vec!["null_resource.a", "null_resource.b"]
        );
        assert!(graph.dependents(&addr("null_resource.x")).is_empty());
    }

    /// Exhaustive check on small graphs: a cycle is reported exactly when
    /// no topological order covers every node.
    #[test]
    fn test_cycle_detection_agrees_with_toposort() {
        let n = 4usize;
        let pairs: Vec<(usize, usize)> = (0..n).flat_map(|i| (0..n).map(move |j| (i, j))).collect();
        for mask in (0u32..(1 << pairs.len())).step_by(97) {
            let mut graph: DiGraph<String, ()> = DiGraph::new();
            let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(format!("n{i}"))).collect();
            for (bit, (i, j)) in pairs.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    graph.add_edge(nodes[*i], nodes[*j], ());
                }
            }
            let has_order = petgraph::algo::toposort(&graph, None).is_ok();
            let cycle = find_cycle(&graph);
            assert_eq!(has_order, cycle.is_none(), "mask {mask:#b}");
            if let Some(cycle) = cycle {
                for pair in cycle.windows(2) {
                    let a = nodes[pair[0][1..].parse::<usize>().unwrap()];
                    let b = nodes[pair[1][1..].parse::<usize>().unwrap()];
                    assert!(graph.contains_edge(a, b), "reported edge {pair:?} missing");
                }
            }
        }
    }

    #[test]
    fn test_serde_rebuilds_graph() {
        let graph = ResourceGraph::build(&[
            spec("null_resource.a", &[]),
            spec_ref("null_resource.b", "null_resource.a"),
        ])
        .unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let back: ResourceGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.edges(), graph.edges());
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn test_dot_output() {
        let graph = ResourceGraph::build(&[
            spec("null_resource.a", &[]),
            spec("null_resource.b", &["null_resource.a"]),
        ])
        .unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph forgeplan {"));
        assert!(dot.contains("\"null_resource.b\" -> \"null_resource.a\";"));
    }
}
