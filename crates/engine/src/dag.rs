//! Dependency graph built from a workflow's nodes and edges.
//!
//! Rules enforced by [`DependencyGraph::build`]:
//! 1. Node ids must be non-empty and unique within the workflow.
//! 2. Every edge must reference known node ids on both ends.
//! 3. An edge from a node to itself is a cycle.
//!
//! Acyclicity is checked separately by [`DependencyGraph::validate_acyclic`],
//! which reports the offending path.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::models::{Edge, EdgeCondition, Node, NodeType, Workflow};

/// Nodes that may run together once every earlier batch is terminal.
pub type Batch = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    /// Nodes unreachable from any Start node. Informational only.
    pub orphans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    /// Number of batches.
    pub depth: usize,
    /// Size of the widest batch.
    pub max_parallelism: usize,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Declaration order.
    ids: Vec<String>,
    node_types: Vec<NodeType>,
    index: HashMap<String, usize>,
    /// Targets per source, in edge order, with the edge's condition.
    outgoing: Vec<Vec<(usize, EdgeCondition)>>,
    incoming: Vec<Vec<(usize, EdgeCondition)>>,
    edge_count: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl DependencyGraph {
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        Self::build(&workflow.nodes, &workflow.edges)
    }

    pub fn build(nodes: &[Node], edges: &[Edge]) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(OrchestratorError::WorkflowValidationFailed(format!(
                    "node #{i} has an empty id"
                )));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(OrchestratorError::WorkflowValidationFailed(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        let mut seen = HashSet::new();
        for edge in edges {
            let from = *index.get(&edge.from).ok_or_else(|| unknown(&edge.from, "source"))?;
            let to = *index.get(&edge.to).ok_or_else(|| unknown(&edge.to, "target"))?;
            if from == to {
                return Err(OrchestratorError::WorkflowCyclic(vec![
                    edge.from.clone(),
                    edge.to.clone(),
                ]));
            }
            if !seen.insert((from, to)) {
                continue;
            }
            outgoing[from].push((to, edge.condition.clone()));
            incoming[to].push((from, edge.condition.clone()));
        }

        Ok(Self {
            ids: nodes.iter().map(|n| n.id.clone()).collect(),
            node_types: nodes.iter().map(|n| n.node_type).collect(),
            index,
            outgoing,
            incoming,
            edge_count: seen.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Iterative three-colour DFS. On a back edge the returned error carries
    /// the cycle with its first node repeated at the end.
    pub fn validate_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::White; self.ids.len()];
        let mut path: Vec<usize> = Vec::new();

        for root in 0..self.ids.len() {
            if marks[root] != Mark::White {
                continue;
            }
            // (node, next outgoing edge to look at)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Grey;
            path.push(root);

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                match self.outgoing[node].get(cursor) {
                    Some(&(next, _)) => {
                        frame.1 += 1;
                        match marks[next] {
                            Mark::White => {
                                marks[next] = Mark::Grey;
                                path.push(next);
                                stack.push((next, 0));
                            }
                            Mark::Grey => {
                                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                                let mut cycle: Vec<String> =
                                    path[start..].iter().map(|&n| self.ids[n].clone()).collect();
                                cycle.push(self.ids[next].clone());
                                return Err(OrchestratorError::WorkflowCyclic(cycle));
                            }
                            Mark::Black => {}
                        }
                    }
                    None => {
                        marks[node] = Mark::Black;
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Kahn layering. Each batch lists its nodes in declaration order.
    /// Assumes an acyclic graph; nodes on a cycle are left out.
    pub fn execution_batches(&self) -> Vec<Batch> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut batches = Vec::new();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for &node in &current {
                for &(target, _) in &self.outgoing[node] {
                    in_degree[target] -= 1;
                    if in_degree[target] == 0 {
                        next.insert(target);
                    }
                }
            }
            batches.push(current.iter().map(|&i| self.ids[i].clone()).collect());
            current = next.into_iter().collect();
        }
        batches
    }

    pub fn topological_order(&self) -> Vec<String> {
        self.execution_batches().into_iter().flatten().collect()
    }

    /// Nodes not reachable from any Start node. Empty for single-node graphs
    /// and graphs without a Start node.
    pub fn orphans(&self) -> Vec<String> {
        let starts: Vec<usize> = (0..self.ids.len())
            .filter(|&i| self.node_types[i] == NodeType::Start)
            .collect();
        if self.ids.len() <= 1 || starts.is_empty() {
            return Vec::new();
        }

        let mut reached = vec![false; self.ids.len()];
        let mut queue: VecDeque<usize> = starts.into_iter().collect();
        while let Some(node) = queue.pop_front() {
            if std::mem::replace(&mut reached[node], true) {
                continue;
            }
            queue.extend(self.outgoing[node].iter().map(|&(t, _)| t));
        }

        (0..self.ids.len())
            .filter(|&i| !reached[i])
            .map(|i| self.ids[i].clone())
            .collect()
    }

    /// Validate, then lay out batches and orphans.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        self.validate_acyclic()?;
        Ok(ExecutionPlan {
            batches: self.execution_batches(),
            orphans: self.orphans(),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Direct dependencies of `id`, with the condition on each edge.
    pub fn incoming_edges(&self, id: &str) -> Vec<(&str, &EdgeCondition)> {
        self.index
            .get(id)
            .map(|&i| {
                self.incoming[i]
                    .iter()
                    .map(|(from, cond)| (self.ids[*from].as_str(), cond))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.neighbours(id, &self.incoming)
    }

    pub fn successors(&self, id: &str) -> Vec<String> {
        self.neighbours(id, &self.outgoing)
    }

    /// Every node that transitively depends on `id`, in declaration order.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let Some(&root) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.ids.len()];
        let mut stack: Vec<usize> = self.outgoing[root].iter().map(|&(t, _)| t).collect();
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            stack.extend(self.outgoing[node].iter().map(|&(t, _)| t));
        }
        (0..self.ids.len())
            .filter(|&i| seen[i])
            .map(|i| self.ids[i].clone())
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let batches = self.execution_batches();
        GraphStats {
            nodes: self.ids.len(),
            edges: self.edge_count,
            depth: batches.len(),
            max_parallelism: batches.iter().map(Vec::len).max().unwrap_or(0),
        }
    }

    fn neighbours(&self, id: &str, adjacency: &[Vec<(usize, EdgeCondition)>]) -> Vec<String> {
        self.index
            .get(id)
            .map(|&i| adjacency[i].iter().map(|(n, _)| self.ids[*n].clone()).collect())
            .unwrap_or_default()
    }
}

fn unknown(id: &str, side: &str) -> OrchestratorError {
    OrchestratorError::WorkflowValidationFailed(format!("edge {side} '{id}' is not a node"))
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeTask;
    use serde_json::Value;

    fn make_node(id: &str) -> Node {
        Node::work_item(id, NodeTask::new("echo", Value::Null))
    }

    fn edge(from: &str, to: &str) -> Edge {
        Edge::new(from, to)
    }

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> Result<DependencyGraph> {
        let nodes: Vec<Node> = ids.iter().map(|id| make_node(id)).collect();
        let edges: Vec<Edge> = edges.iter().map(|(f, t)| edge(f, t)).collect();
        DependencyGraph::build(&nodes, &edges)
    }

    #[test]
    fn linear_chain_is_one_node_per_batch() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]).unwrap();
        assert_eq!(g.plan().unwrap().batches, vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_eq!(g.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_batches() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let g = graph(
            &["A", "B", "C", "D"],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        )
        .unwrap();
        assert_eq!(
            g.execution_batches(),
            vec![vec!["A"], vec!["B", "C"], vec!["D"]]
        );
        let stats = g.stats();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.max_parallelism, 2);
        assert_eq!(stats.edges, 4);
    }

    #[test]
    fn batches_keep_declaration_order() {
        let g = graph(&["z", "y", "x"], &[]).unwrap();
        assert_eq!(g.execution_batches(), vec![vec!["z", "y", "x"]]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        // A → B → C → A
        let g = graph(&["A", "B", "C"], &[("A", "B"), ("B", "C"), ("C", "A")]).unwrap();
        match g.validate_acyclic() {
            Err(OrchestratorError::WorkflowCyclic(path)) => {
                assert_eq!(path, vec!["A", "B", "C", "A"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(g.plan().is_err());
    }

    #[test]
    fn cycle_below_an_acyclic_prefix() {
        let g = graph(
            &["root", "x", "y"],
            &[("root", "x"), ("x", "y"), ("y", "x")],
        )
        .unwrap();
        assert!(matches!(
            g.validate_acyclic(),
            Err(OrchestratorError::WorkflowCyclic(path)) if path == vec!["x", "y", "x"]
        ));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        assert!(matches!(
            graph(&["a"], &[("a", "a")]),
            Err(OrchestratorError::WorkflowCyclic(path)) if path == vec!["a", "a"]
        ));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        assert!(matches!(
            graph(&["a", "a"], &[]),
            Err(OrchestratorError::WorkflowValidationFailed(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        assert!(matches!(
            graph(&["a"], &[("a", "ghost")]),
            Err(OrchestratorError::WorkflowValidationFailed(msg)) if msg.contains("ghost")
        ));
    }

    #[test]
    fn duplicate_edges_are_collapsed() {
        let g = graph(&["a", "b"], &[("a", "b"), ("a", "b")]).unwrap();
        assert_eq!(g.stats().edges, 1);
        assert_eq!(g.execution_batches(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn orphans_are_nodes_unreachable_from_start() {
        let nodes = vec![
            Node::start("start"),
            make_node("work"),
            make_node("island"),
            Node::end("end"),
        ];
        let edges = vec![edge("start", "work"), edge("work", "end")];
        let g = DependencyGraph::build(&nodes, &edges).unwrap();
        assert_eq!(g.plan().unwrap().orphans, vec!["island"]);
    }

    #[test]
    fn no_orphans_without_a_start_node_or_for_a_single_node() {
        let g = graph(&["a", "b"], &[]).unwrap();
        assert!(g.orphans().is_empty());

        let solo = DependencyGraph::build(&[Node::start("s")], &[]).unwrap();
        assert!(solo.orphans().is_empty());
    }

    #[test]
    fn neighbourhood_queries() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("c", "d")],
        )
        .unwrap();
        assert_eq!(g.successors("a"), vec!["b", "c"]);
        assert_eq!(g.predecessors("d"), vec!["c"]);
        assert_eq!(g.descendants("a"), vec!["b", "c", "d"]);
        assert!(g.descendants("d").is_empty());
        assert!(g.successors("ghost").is_empty());
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let g = graph(&["solo"], &[]).unwrap();
        let plan = g.plan().unwrap();
        assert_eq!(plan.batches, vec![vec!["solo"]]);
        assert!(plan.orphans.is_empty());
    }
}
