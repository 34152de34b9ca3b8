//! Multi-stage pipelines sharing runtime state.
//!
//! A workflow runs its stages in order. Each stage is a sub-run over the
//! stage's task set; outcomes and durations recorded by earlier stages
//! are visible to the condition expressions of later ones.

mod state;

use std::sync::Arc;

pub use state::{RuntimeState, StageRecord, TaskRecord};
use thiserror::Error;
use tracing::debug;
use zr_cache::FsCache;
use zr_env::EnvironmentVariableMap;

use crate::{
    config::{RawStage, RawWorkflow},
    engine::{BuilderError, EngineBuilder, TaskTable},
    expr,
    process::ProcessManager,
    task_graph::{Visitor, VisitorOptions},
    toolchain::ToolchainResolver,
};

/// Callback interface for stages with `approval = true`. Interactive
/// frontends prompt a human; the default approves everything, which is
/// the right behavior for non-interactive runs.
pub trait ApprovalGate: Send + Sync {
    fn approve(&self, stage_name: &str) -> bool;
}

pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn approve(&self, _stage_name: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub tasks: Vec<String>,
    pub parallel: bool,
    pub fail_fast: bool,
    pub condition: Option<String>,
    pub approval: bool,
    pub on_failure: Option<String>,
}

impl From<&RawStage> for Stage {
    fn from(raw: &RawStage) -> Self {
        Stage {
            name: raw.name.clone(),
            tasks: raw.tasks.clone(),
            parallel: raw.parallel,
            fail_fast: raw.fail_fast,
            condition: raw.condition.clone(),
            approval: raw.approval,
            on_failure: raw.on_failure.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    /// Stop after a failed stage's on_failure hook.
    pub fail_fast: bool,
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn from_raw(name: &str, raw: &RawWorkflow) -> Self {
        Workflow {
            name: name.to_string(),
            fail_fast: raw.fail_fast.unwrap_or(true),
            stages: raw.stages.iter().map(Stage::from).collect(),
        }
    }

    /// All task references (stage tasks and on_failure hooks) must
    /// exist before anything is scheduled.
    pub fn validate(&self, table: &TaskTable) -> Result<(), BuilderError> {
        for stage in &self.stages {
            for task in stage.tasks.iter().chain(&stage.on_failure) {
                if !table.contains(task) {
                    return Err(BuilderError::MissingStageTask {
                        workflow: self.name.clone(),
                        stage: stage.name.clone(),
                        task: task.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Ok,
    Failed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
}

/// Runs workflows against a normalized task table.
pub struct WorkflowRunner<'a> {
    table: &'a TaskTable,
    runtime: Arc<RuntimeState>,
    cache: Option<Arc<FsCache>>,
    toolchains: Arc<dyn ToolchainResolver>,
    process_env: Arc<EnvironmentVariableMap>,
    approvals: Arc<dyn ApprovalGate>,
    concurrency: usize,
    cache_enabled: bool,
}

impl<'a> WorkflowRunner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: &'a TaskTable,
        runtime: Arc<RuntimeState>,
        cache: Option<Arc<FsCache>>,
        toolchains: Arc<dyn ToolchainResolver>,
        process_env: Arc<EnvironmentVariableMap>,
        approvals: Arc<dyn ApprovalGate>,
        concurrency: usize,
        cache_enabled: bool,
    ) -> Self {
        Self {
            table,
            runtime,
            cache,
            toolchains,
            process_env,
            approvals,
            concurrency,
            cache_enabled,
        }
    }

    pub async fn run(&self, workflow: &Workflow) -> Result<WorkflowOutcome, Error> {
        let mut failed = false;

        for stage in &workflow.stages {
            // Evaluated once per workflow attempt, never per task
            if let Some(condition) = &stage.condition {
                let ctx = expr::Context::new()
                    .with_process_env(&self.process_env)
                    .with_runtime(&self.runtime);
                if !expr::evaluate(condition, &ctx) {
                    debug!("skipping stage {}: condition is false", stage.name);
                    // A skipped stage did not fail
                    self.runtime.record_stage(&stage.name, true);
                    continue;
                }
            }

            if stage.approval && !self.approvals.approve(&stage.name) {
                debug!("stage {} was not approved, cancelling workflow", stage.name);
                return Ok(WorkflowOutcome::Cancelled);
            }

            let stage_success = self.run_stage(stage).await?;
            self.runtime.record_stage(&stage.name, stage_success);

            if !stage_success {
                failed = true;
                if let Some(hook) = &stage.on_failure {
                    // The hook's own failure is recorded but never chains
                    self.run_single(hook).await?;
                }
                if workflow.fail_fast {
                    break;
                }
            }
        }

        Ok(match failed {
            true => WorkflowOutcome::Failed,
            false => WorkflowOutcome::Ok,
        })
    }

    /// Runs one stage; returns whether every task in the stage's graph
    /// ended successfully (allow_failure promotions included).
    async fn run_stage(&self, stage: &Stage) -> Result<bool, Error> {
        if stage.tasks.is_empty() {
            return Ok(true);
        }

        let engine = Arc::new(
            EngineBuilder::new(self.table)
                .with_tasks(stage.tasks.iter().cloned())
                .with_serial_entrypoints(!stage.parallel)
                .build()?,
        );
        let task_names: Vec<String> = engine.tasks().map(String::from).collect();

        let visitor = Arc::new(Visitor::new(
            ProcessManager::new(),
            self.runtime.clone(),
            self.cache.clone(),
            self.toolchains.clone(),
            self.process_env.clone(),
            VisitorOptions {
                concurrency: self.concurrency,
                fail_fast: stage.fail_fast,
                cache_enabled: self.cache_enabled,
            },
        ));
        visitor.visit(engine).await?;

        // Tasks cancelled before they were even emitted have no record;
        // they count against the stage
        Ok(task_names.iter().all(|name| {
            self.runtime
                .task(name)
                .map(|record| record.success)
                .unwrap_or(false)
        }))
    }

    async fn run_single(&self, task: &str) -> Result<(), Error> {
        let engine = Arc::new(EngineBuilder::new(self.table).with_tasks([task]).build()?);
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::RawConfig, task_graph::Outcome, toolchain::LocalToolchainResolver,
    };

    struct Harness {
        config: RawConfig,
        runtime: Arc<RuntimeState>,
        approvals: Arc<dyn ApprovalGate>,
    }

    struct RejectAll;
    impl ApprovalGate for RejectAll {
        fn approve(&self, _stage_name: &str) -> bool {
            false
        }
    }

    impl Harness {
        fn new(config: &str) -> Self {
            Self {
                config: RawConfig::from_str(config).unwrap(),
                runtime: Arc::new(RuntimeState::new()),
                approvals: Arc::new(AutoApprove),
            }
        }

        fn rejecting(mut self) -> Self {
            self.approvals = Arc::new(RejectAll);
            self
        }

        async fn run(&self, workflow: &str) -> WorkflowOutcome {
            let table = TaskTable::new(&self.config, None).unwrap();
            let workflow =
                Workflow::from_raw(workflow, &self.config.workflows[workflow]);
            workflow.validate(&table).unwrap();
            let runner = WorkflowRunner::new(
                &table,
                self.runtime.clone(),
                None,
                Arc::new(LocalToolchainResolver::new()),
                Arc::new(EnvironmentVariableMap::infer()),
                self.approvals.clone(),
                4,
                false,
            );
            runner.run(&workflow).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_share_state() {
        let harness = Harness::new(
            r#"
            [tasks.build]
            cmd = "exit 0"
            [tasks.deploy]
            cmd = "exit 0"

            [workflows.ship]
            [[workflows.ship.stages]]
            name = "build"
            tasks = ["build"]
            [[workflows.ship.stages]]
            name = "deploy"
            tasks = ["deploy"]
            condition = "stages['build'].success && tasks['build'].success"
            "#,
        );
        let outcome = harness.run("ship").await;
        assert_eq!(outcome, WorkflowOutcome::Ok);
        assert_eq!(harness.runtime.stage_success("build"), Some(true));
        assert_eq!(harness.runtime.stage_success("deploy"), Some(true));
        assert_eq!(
            harness.runtime.task("deploy").unwrap().outcome,
            Outcome::Success
        );
    }

    #[tokio::test]
    async fn test_stage_condition_false_skips_stage() {
        let harness = Harness::new(
            r#"
            [tasks.never]
            cmd = "exit 1"

            [workflows.w]
            [[workflows.w.stages]]
            name = "gated"
            tasks = ["never"]
            condition = "false"
            "#,
        );
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Ok);
        // The stage was skipped: its task never ran
        assert!(harness.runtime.task("never").is_none());
        assert_eq!(harness.runtime.stage_success("gated"), Some(true));
    }

    #[tokio::test]
    async fn test_failed_stage_marks_state_and_stops_workflow() {
        let harness = Harness::new(
            r#"
            [tasks.bad]
            cmd = "exit 1"
            [tasks.later]
            cmd = "exit 0"

            [workflows.w]
            [[workflows.w.stages]]
            name = "first"
            tasks = ["bad"]
            [[workflows.w.stages]]
            name = "second"
            tasks = ["later"]
            "#,
        );
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Failed);
        assert_eq!(harness.runtime.stage_success("first"), Some(false));
        // Workflow-scope fail fast: the second stage never ran
        assert!(harness.runtime.task("later").is_none());
        assert_eq!(harness.runtime.stage_success("second"), None);
    }

    #[tokio::test]
    async fn test_fail_fast_false_continues_after_failed_stage() {
        let harness = Harness::new(
            r#"
            [tasks.bad]
            cmd = "exit 1"
            [tasks.later]
            cmd = "exit 0"

            [workflows.w]
            fail_fast = false
            [[workflows.w.stages]]
            name = "first"
            tasks = ["bad"]
            [[workflows.w.stages]]
            name = "second"
            tasks = ["later"]
            "#,
        );
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Failed);
        assert_eq!(harness.runtime.stage_success("second"), Some(true));
        assert_eq!(
            harness.runtime.task("later").unwrap().outcome,
            Outcome::Success
        );
    }

    #[tokio::test]
    async fn test_on_failure_hook_runs_and_does_not_chain() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("cleanup.ran");
        let harness = Harness::new(&format!(
            r#"
            [tasks.bad]
            cmd = "exit 1"
            [tasks.cleanup]
            cmd = "touch {marker}; exit 1"

            [workflows.w]
            [[workflows.w.stages]]
            name = "only"
            tasks = ["bad"]
            on_failure = "cleanup"
            "#,
            marker = marker.display()
        ));
        let outcome = harness.run("w").await;
        // The hook ran, its own failure is recorded but the workflow
        // outcome stays driven by the stage
        assert_eq!(outcome, WorkflowOutcome::Failed);
        assert!(marker.exists());
        assert_eq!(
            harness.runtime.task("cleanup").unwrap().outcome,
            Outcome::Failure { exit_code: Some(1) }
        );
    }

    #[tokio::test]
    async fn test_sequential_stage_runs_in_array_order() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("order.log");
        let harness = Harness::new(&format!(
            r#"
            [tasks.one]
            cmd = "echo one >> {log}"
            [tasks.two]
            cmd = "echo two >> {log}"
            [tasks.three]
            cmd = "echo three >> {log}"

            [workflows.w]
            [[workflows.w.stages]]
            name = "seq"
            tasks = ["one", "two", "three"]
            parallel = false
            "#,
            log = log.display()
        ));
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Ok);
        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents.lines().collect::<Vec<_>>(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_empty_stage_is_noop_success() {
        let harness = Harness::new(
            r#"
            [workflows.w]
            [[workflows.w.stages]]
            name = "empty"
            tasks = []
            "#,
        );
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Ok);
        assert_eq!(harness.runtime.stage_success("empty"), Some(true));
    }

    #[tokio::test]
    async fn test_rejected_approval_cancels_workflow() {
        let harness = Harness::new(
            r#"
            [tasks.deploy]
            cmd = "exit 0"

            [workflows.w]
            [[workflows.w.stages]]
            name = "ship"
            tasks = ["deploy"]
            approval = true
            "#,
        )
        .rejecting();
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert!(harness.runtime.task("deploy").is_none());
    }

    #[tokio::test]
    async fn test_allow_failure_task_does_not_fail_stage() {
        let harness = Harness::new(
            r#"
            [tasks.flaky]
            cmd = "exit 1"
            allow_failure = true

            [workflows.w]
            [[workflows.w.stages]]
            name = "s"
            tasks = ["flaky"]
            "#,
        );
        let outcome = harness.run("w").await;
        assert_eq!(outcome, WorkflowOutcome::Ok);
        assert_eq!(harness.runtime.stage_success("s"), Some(true));
    }

    #[test]
    fn test_validate_rejects_unknown_stage_task() {
        let config = RawConfig::from_str(
            r#"
            [tasks.a]
            cmd = "exit 0"

            [workflows.w]
            [[workflows.w.stages]]
            name = "s"
            tasks = ["ghost"]
            "#,
        )
        .unwrap();
        let table = TaskTable::new(&config, None).unwrap();
        let workflow = Workflow::from_raw("w", &config.workflows["w"]);
        let err = workflow.validate(&table).unwrap_err();
        assert!(matches!(err, BuilderError::MissingStageTask { ref task, .. } if task == "ghost"));
    }
}
