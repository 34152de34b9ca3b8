//! Additional utilities to be used with `petgraph`.
//! Provides cycle detection for task graphs and a concurrent walker that
//! emits nodes once their dependencies have completed.

mod walker;

use std::{fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{IntoNeighbors, VisitMap, Visitable},
};
use thiserror::Error;
pub use walker::{walk, WalkHandle, WalkMessage};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n\t{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Validates that a task graph is executable: no node may reach itself,
/// either through a longer cycle or through a direct self edge.
pub fn validate_graph<N: Display + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            component
                .into_iter()
                .map(|id| {
                    graph
                        .node_weight(id)
                        .expect("tarjan_scc only returns indices present in the graph")
                })
                .format(", ")
                .to_string()
        })
        .join("\n\t");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}

/// A fast failing DFS approach to detecting if there is a cycle in the
/// graph. Exposed for callers that only need a yes/no answer and want to
/// reuse visit maps across checks.
pub struct CycleDetector {
    visited: fixedbitset::FixedBitSet,
    finished: fixedbitset::FixedBitSet,
}

impl CycleDetector {
    pub fn new<N, E>(graph: &Graph<N, E>) -> CycleDetector {
        let visited = graph.visit_map();
        let finished = graph.visit_map();
        Self { visited, finished }
    }

    pub fn has_cycle<N, E>(&mut self, graph: &Graph<N, E>) -> bool {
        self.visited.clear();
        self.finished.clear();
        for start in graph.node_indices() {
            if Self::dfs(graph, start, &mut self.visited, &mut self.finished) {
                return true;
            }
        }
        false
    }

    fn dfs<G>(graph: G, u: G::NodeId, visited: &mut G::Map, finished: &mut G::Map) -> bool
    where
        G: IntoNeighbors + Visitable,
    {
        // We have already completed a DFS from this node
        if finished.is_visited(&u) {
            return false;
        }
        // If not the first visit we have a cycle
        if !visited.visit(u) {
            return true;
        }
        for v in graph.neighbors(u) {
            if Self::dfs(graph, v, visited, finished) {
                return true;
            }
        }
        finished.visit(u);
        false
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_cycle_err_names_members() {
        // a -> b -> c -> b
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, b, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cyclic dependency detected"), "{message}");
        assert!(message.contains('b') && message.contains('c'), "{message}");
    }

    #[test]
    fn test_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_eq!(err.to_string(), "a depends on itself");
    }

    #[test]
    fn test_valid_graph() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(b, a, ());
        g.add_edge(c, a, ());
        g.add_edge(c, b, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_cycle_detector_reuse() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());

        let mut detector = CycleDetector::new(&g);
        assert!(!detector.has_cycle(&g));

        g.add_edge(b, a, ());
        let mut detector = CycleDetector::new(&g);
        assert!(detector.has_cycle(&g));
    }
}
