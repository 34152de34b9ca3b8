use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use thiserror::Error;

use super::{Engine, TaskTable};
use crate::{config, task_graph::TaskDefinition};

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("could not find task {name}")]
    UnknownTask { name: String },
    #[error("task {task} depends on unknown task {dep}")]
    MissingDependency { task: String, dep: String },
    #[error("missing required template parameter {param} for task {task}")]
    MissingTemplateParameter { task: String, param: String },
    #[error("task {task} references undeclared template parameter {param}")]
    UnknownParameter { task: String, param: String },
    #[error("unclosed placeholder in task {task}")]
    UnclosedPlaceholder { task: String },
    #[error("task {task} is declared from unknown template {template}")]
    UnknownTemplate { task: String, template: String },
    #[error("profile {profile} not found")]
    ProfileNotFound { profile: String },
    #[error("workflow {workflow} stage {stage} references unknown task {task}")]
    MissingStageTask {
        workflow: String,
        stage: String,
        task: String,
    },
    #[error("task {task} has no command")]
    MissingCommand { task: String },
    #[error("invalid value in task {task}: {source}")]
    Config {
        task: String,
        #[source]
        source: config::Error,
    },
    #[error(transparent)]
    Validation(#[from] zr_graph_utils::Error),
}

/// Builds a validated [`Engine`] over the subset of the task table
/// reachable from a set of entrypoints.
pub struct EngineBuilder<'a> {
    table: &'a TaskTable,
    entrypoints: Vec<String>,
    serial_entrypoints: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(table: &'a TaskTable) -> Self {
        Self {
            table,
            entrypoints: Vec::new(),
            serial_entrypoints: false,
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tasks: I) -> Self {
        self.entrypoints = tasks.into_iter().map(Into::into).collect();
        self
    }

    /// Chain the entrypoints in array order so each fully completes
    /// before the next starts. Used by sequential workflow stages.
    pub fn with_serial_entrypoints(mut self, serial: bool) -> Self {
        self.serial_entrypoints = serial;
        self
    }

    /// Collects the reachable definitions and their dependency pairs,
    /// then assembles and validates the graph in one shot.
    pub fn build(self) -> Result<Engine, BuilderError> {
        for name in &self.entrypoints {
            if !self.table.contains(name) {
                return Err(BuilderError::UnknownTask { name: name.clone() });
            }
        }

        let mut definitions: HashMap<String, Arc<TaskDefinition>> = HashMap::new();
        let mut edges: Vec<(String, String)> = Vec::new();
        let mut seen_edges: HashSet<(String, String)> = HashSet::new();
        let mut queue: Vec<String> = self.entrypoints.clone();

        let mut add_edge = |dependent: &str, dependency: &str, edges: &mut Vec<(String, String)>| {
            let pair = (dependent.to_string(), dependency.to_string());
            if seen_edges.insert(pair.clone()) {
                edges.push(pair);
            }
        };

        while let Some(name) = queue.pop() {
            if definitions.contains_key(&name) {
                continue;
            }
            let definition = self
                .table
                .get(&name)
                .expect("queued tasks exist in the table")
                .clone();

            for dep in &definition.deps {
                if !self.table.contains(dep) {
                    return Err(BuilderError::MissingDependency {
                        task: name.clone(),
                        dep: dep.clone(),
                    });
                }
                add_edge(&name, dep, &mut edges);
                queue.push(dep.clone());
            }

            // Serial deps get the usual completion edges plus a chain in
            // array order so each fully finishes before the next starts.
            let mut previous: Option<&String> = None;
            for dep in &definition.deps_serial {
                if !self.table.contains(dep) {
                    return Err(BuilderError::MissingDependency {
                        task: name.clone(),
                        dep: dep.clone(),
                    });
                }
                add_edge(&name, dep, &mut edges);
                if let Some(previous) = previous {
                    add_edge(dep, previous, &mut edges);
                }
                previous = Some(dep);
                queue.push(dep.clone());
            }

            definitions.insert(name, definition);
        }

        if self.serial_entrypoints {
            for (previous, next) in self.entrypoints.iter().zip(self.entrypoints.iter().skip(1)) {
                add_edge(next, previous, &mut edges);
            }
        }

        Ok(Engine::assemble(definitions, edges)?)
    }
}
