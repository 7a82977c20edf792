//! DAG (Directed Acyclic Graph) engine for operation topology
//!
//! Nodes are keyed by operation id. Structural constraints (single source,
//! single sink, acyclicity) are not enforced on insertion; callers check them
//! explicitly.

use crate::error::{FlowError, Result};
use crate::models::{EdgeSnapshot, GraphSnapshot, NodeSnapshot};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;

/// Graph of operation ids
#[derive(Debug, Clone, Default)]
pub struct Dag {
    graph: StableDiGraph<String, ()>,
    node_indices: HashMap<String, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; returns `false` if it already existed
    pub fn add_node(&mut self, id: &str) -> bool {
        if self.node_indices.contains_key(id) {
            return false;
        }
        let index = self.graph.add_node(id.to_string());
        self.node_indices.insert(id.to_string(), index);
        true
    }

    /// Add an edge from `from` to `to` (`from` must complete before `to`)
    ///
    /// Adding an edge that already exists is a no-op.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;
        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, ());
        }
        Ok(())
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.node_indices.contains_key(id)
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.node_indices.get(from), self.node_indices.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Remove a node with all of its edges; returns `false` if it was absent
    ///
    /// Freed slots may be reused, so insertion order is not guaranteed for
    /// nodes added after a removal.
    pub fn remove_node(&mut self, id: &str) -> bool {
        match self.node_indices.remove(id) {
            Some(index) => {
                self.graph.remove_node(index);
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// All node ids in index order
    pub fn nodes(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// All edges as `(from, to)` pairs in index order
    pub fn edges(&self) -> Vec<(String, String)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect()
    }

    /// Nodes without incoming edges
    pub fn sources(&self) -> Vec<String> {
        self.externals(Direction::Incoming)
    }

    /// Nodes without outgoing edges
    pub fn sinks(&self) -> Vec<String> {
        self.externals(Direction::Outgoing)
    }

    fn externals(&self, direction: Direction) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Nodes with an edge into `id`
    pub fn dependencies(&self, id: &str) -> Result<Vec<String>> {
        let index = self.index_of(id)?;
        Ok(self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|idx| self.graph[idx].clone())
            .collect())
    }

    /// Nodes with an edge out of `id`
    pub fn dependents(&self, id: &str) -> Result<Vec<String>> {
        let index = self.index_of(id)?;
        Ok(self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|idx| self.graph[idx].clone())
            .collect())
    }

    pub fn is_acyclic(&self) -> bool {
        toposort(&self.graph, None).is_ok()
    }

    /// Get topologically sorted node ids
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            FlowError::FailedWorkflowAction(format!(
                "Cycle detected during topological sort at node '{}'",
                self.graph[cycle.node_id()]
            ))
        })?;

        Ok(sorted.iter().map(|&idx| self.graph[idx].clone()).collect())
    }

    /// Preorder traversal along outgoing edges from each start node
    ///
    /// Every reachable node is listed once, starts included. Unknown starts
    /// are an error.
    pub fn preorder(&self, starts: &[&str]) -> Result<Vec<String>> {
        let mut visited = Vec::new();
        let mut dfs: Option<Dfs<NodeIndex, _>> = None;

        for start in starts {
            let index = self.index_of(start)?;
            let dfs = dfs.get_or_insert_with(|| Dfs::new(&self.graph, index));
            dfs.move_to(index);
            while let Some(node) = dfs.next(&self.graph) {
                visited.push(self.graph[node].clone());
            }
        }

        Ok(visited)
    }

    /// Find a cycle for error reporting, formatted as `a -> b -> a`
    pub fn find_cycle(&self) -> Option<String> {
        // true while a node is on the current path, false once finished
        let mut on_path: HashMap<NodeIndex, bool> = HashMap::new();

        for start in self.graph.node_indices() {
            if on_path.contains_key(&start) {
                continue;
            }

            on_path.insert(start, true);
            let mut path = vec![start];
            let mut frames = vec![self.graph.neighbors(start)];

            while let Some(neighbors) = frames.last_mut() {
                match neighbors.next() {
                    Some(next) => match on_path.get(&next) {
                        Some(true) => return Some(self.format_cycle(&path, next)),
                        Some(false) => {}
                        None => {
                            on_path.insert(next, true);
                            path.push(next);
                            frames.push(self.graph.neighbors(next));
                        }
                    },
                    None => {
                        frames.pop();
                        if let Some(finished) = path.pop() {
                            on_path.insert(finished, false);
                        }
                    }
                }
            }
        }

        None
    }

    fn format_cycle(&self, path: &[NodeIndex], back_to: NodeIndex) -> String {
        let start = path.iter().position(|&n| n == back_to).unwrap_or(0);
        let mut names: Vec<&str> = path[start..]
            .iter()
            .map(|&n| self.graph[n].as_str())
            .collect();
        names.push(self.graph[back_to].as_str());
        names.join(" -> ")
    }

    /// Export nodes and edges in index order
    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self
                .nodes()
                .into_iter()
                .map(|id| NodeSnapshot { id })
                .collect(),
            edges: self
                .edges()
                .into_iter()
                .map(|(from, to)| EdgeSnapshot { from, to })
                .collect(),
        }
    }

    /// Rebuild a graph from an export
    ///
    /// Edge endpoints must be listed as nodes. Cycles are accepted here and
    /// surface later through validation.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self> {
        let mut dag = Self::new();
        for node in &snapshot.nodes {
            dag.add_node(&node.id);
        }
        for edge in &snapshot.edges {
            dag.add_edge(&edge.from, &edge.to).map_err(|_| {
                FlowError::invalid(
                    "$.graph.edges",
                    format!("edge '{}' -> '{}' references an unknown node", edge.from, edge.to),
                )
            })?;
        }
        Ok(dag)
    }

    fn index_of(&self, id: &str) -> Result<NodeIndex> {
        self.node_indices.get(id).copied().ok_or_else(|| {
            FlowError::FailedWorkflowAction(format!("Node '{}' does not exist", id))
        })
    }
}
