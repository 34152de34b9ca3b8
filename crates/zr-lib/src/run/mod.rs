//! A single `zr` invocation: configuration in, aggregate outcome out.

mod summary;

use std::{collections::BTreeMap, sync::Arc};

pub use summary::RunSummary;
use thiserror::Error;
use tracing::warn;
use zr_cache::FsCache;
use zr_env::EnvironmentVariableMap;

use crate::{
    config::RawConfig,
    engine::{BuilderError, EngineBuilder, TaskTable},
    opts::Opts,
    process::ProcessManager,
    task_graph::{Outcome, Visitor, VisitorError, VisitorOptions},
    toolchain::{LocalToolchainResolver, ToolchainResolver},
    workflow::{
        ApprovalGate, AutoApprove, RuntimeState, Workflow, WorkflowOutcome, WorkflowRunner,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Visitor(#[from] VisitorError),
    #[error(transparent)]
    Workflow(#[from] crate::workflow::Error),
}

/// Aggregate result of a run. Individual task results live in the
/// runtime state; this is only the exit-code-shaped rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Ok => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Cancelled => 130,
        }
    }
}

pub struct Run {
    table: TaskTable,
    workflows: BTreeMap<String, Workflow>,
    runtime: Arc<RuntimeState>,
    cache: Option<Arc<FsCache>>,
    toolchains: Arc<dyn ToolchainResolver>,
    approvals: Arc<dyn ApprovalGate>,
    process_env: Arc<EnvironmentVariableMap>,
    concurrency: usize,
    cache_enabled: bool,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("table", &self.table)
            .field("workflows", &self.workflows)
            .field("runtime", &self.runtime)
            .field("concurrency", &self.concurrency)
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Normalizes and validates the configuration. Everything that can
    /// be rejected is rejected here, before any task is scheduled.
    pub fn new(config: &RawConfig, opts: &Opts) -> Result<Self, Error> {
        let profile = opts
            .run
            .profile
            .clone()
            .or_else(|| config.global.default_profile.clone());
        let table = TaskTable::new(config, profile.as_deref())?;

        let workflows: BTreeMap<String, Workflow> = config
            .workflows
            .iter()
            .map(|(name, raw)| (name.clone(), Workflow::from_raw(name, raw)))
            .collect();
        for workflow in workflows.values() {
            workflow.validate(&table)?;
        }

        let concurrency = opts
            .run
            .concurrency
            .or(config.global.max_workers)
            .unwrap_or_else(num_cpus::get)
            .max(1);

        let cache = match opts.cache.enabled {
            false => None,
            true => {
                let cache_dir = opts
                    .cache
                    .override_dir
                    .clone()
                    .or_else(|| config.global.cache_dir.clone().map(Into::into))
                    .or_else(|| crate::zr_home().map(|home| home.join("cache")));
                match cache_dir {
                    // An unusable cache degrades the run to uncached
                    Some(dir) => match FsCache::new(&dir) {
                        Ok(cache) => Some(Arc::new(cache)),
                        Err(err) => {
                            warn!("cache disabled: {err}");
                            None
                        }
                    },
                    None => None,
                }
            }
        };

        Ok(Self {
            table,
            workflows,
            runtime: Arc::new(RuntimeState::new()),
            cache,
            toolchains: Arc::new(LocalToolchainResolver::new()),
            approvals: Arc::new(AutoApprove),
            process_env: Arc::new(EnvironmentVariableMap::infer()),
            concurrency,
            cache_enabled: opts.cache.enabled,
        })
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    pub fn summary(&self, elapsed: std::time::Duration) -> RunSummary {
        RunSummary::new(&self.runtime, elapsed)
    }

    /// Runs a target by name. Workflow names take precedence over task
    /// names.
    pub async fn run_target(&self, target: &str) -> Result<RunOutcome, Error> {
        self.run_target_with_args(target, &[]).await
    }

    /// Like [`Run::run_target`], appending extra CLI arguments to the
    /// entry task's command. Workflows ignore pass-through arguments.
    pub async fn run_target_with_args(
        &self,
        target: &str,
        args: &[String],
    ) -> Result<RunOutcome, Error> {
        if let Some(workflow) = self.workflows.get(target) {
            let runner = WorkflowRunner::new(
                &self.table,
                self.runtime.clone(),
                self.cache.clone(),
                self.toolchains.clone(),
                self.process_env.clone(),
                self.approvals.clone(),
                self.concurrency,
                self.cache_enabled,
            );
            return Ok(match runner.run(workflow).await? {
                WorkflowOutcome::Ok => RunOutcome::Ok,
                WorkflowOutcome::Failed => RunOutcome::Failed,
                WorkflowOutcome::Cancelled => RunOutcome::Cancelled,
            });
        }
        self.run_task(target, args).await
    }

    /// Runs a single task plus its transitive dependencies.
    async fn run_task(&self, task: &str, args: &[String]) -> Result<RunOutcome, Error> {
        let table = match args.is_empty() {
            true => None,
            false => Some(self.table.with_args(task, args)),
        };
        let table = table.as_ref().unwrap_or(&self.table);
        let engine = Arc::new(EngineBuilder::new(table).with_tasks([task]).build()?);
        let task_names: Vec<String> = engine.tasks().map(String::from).collect();

        let visitor = Arc::new(Visitor::new(
            ProcessManager::new(),
            self.runtime.clone(),
            self.cache.clone(),
            self.toolchains.clone(),
            self.process_env.clone(),
            VisitorOptions {
                concurrency: self.concurrency,
                fail_fast: false,
                cache_enabled: self.cache_enabled,
            },
        ));
        visitor.visit(engine).await?;

        let mut failed = false;
        let mut cancelled = false;
        for name in &task_names {
            match self.runtime.task(name) {
                Some(record) if record.success => {}
                Some(record) if record.outcome == Outcome::Cancelled => cancelled = true,
                Some(_) => failed = true,
                None => cancelled = true,
            }
        }
        Ok(if failed {
            RunOutcome::Failed
        } else if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Ok
        })
    }
}
