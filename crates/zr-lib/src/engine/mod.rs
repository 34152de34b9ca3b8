//! The task dependency graph: normalization, construction, validation,
//! and concurrency-bounded execution.

mod builder;
mod execute;
mod expand;

use std::{collections::HashMap, fmt, sync::Arc};

pub use builder::{BuilderError, EngineBuilder};
pub use execute::{ExecuteError, StopExecution, VisitorMessage};
pub use expand::TaskTable;
use petgraph::{graph::NodeIndex, Graph};

use crate::task_graph::TaskDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(String),
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(name) => f.write_str(name),
        }
    }
}

/// A validated dependency graph over one run's tasks, assembled in a
/// single shot from the flat definition table plus the dependency pairs
/// the builder collected. Edges point dependent → dependency; every
/// task also depends on a synthetic root so the walk has one defined
/// start node. Immutable once assembled.
#[derive(Debug)]
pub struct Engine {
    graph: Graph<TaskNode, ()>,
    definitions: HashMap<String, Arc<TaskDefinition>>,
    nodes: HashMap<String, NodeIndex>,
}

impl Engine {
    /// Builds and validates the graph. Every name in `edges` must have
    /// a definition; the builder guarantees that by construction.
    fn assemble(
        definitions: HashMap<String, Arc<TaskDefinition>>,
        edges: Vec<(String, String)>,
    ) -> Result<Engine, zr_graph_utils::Error> {
        let mut graph = Graph::with_capacity(definitions.len() + 1, edges.len() + definitions.len());
        let root = graph.add_node(TaskNode::Root);

        let nodes: HashMap<String, NodeIndex> = definitions
            .keys()
            .map(|name| (name.clone(), graph.add_node(TaskNode::Task(name.clone()))))
            .collect();
        for node in nodes.values() {
            graph.add_edge(*node, root, ());
        }
        for (dependent, dependency) in &edges {
            graph.add_edge(nodes[dependent], nodes[dependency], ());
        }

        zr_graph_utils::validate_graph(&graph)?;

        Ok(Engine {
            graph,
            definitions,
            nodes,
        })
    }

    pub fn task_definition(&self, task_name: &str) -> Option<&Arc<TaskDefinition>> {
        self.definitions.get(task_name)
    }

    /// Task names in the graph, root excluded.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|name| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Direct dependencies of a task, the synthetic root excluded.
    pub fn dependencies(&self, task_name: &str) -> Option<Vec<&str>> {
        let node = self.nodes.get(task_name)?;
        Some(
            self.graph
                .neighbors_directed(*node, petgraph::Direction::Outgoing)
                .filter_map(|dependency| match &self.graph[dependency] {
                    TaskNode::Task(name) => Some(name.as_str()),
                    TaskNode::Root => None,
                })
                .collect(),
        )
    }
}
