use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Instant,
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zr_cache::FsCache;
use zr_env::EnvironmentVariableMap;

use crate::{
    engine::{Engine, StopExecution, VisitorMessage},
    expr,
    process::{ChildExit, Command, ProcessManager, STOP_GRACE_PERIOD},
    task_graph::{Outcome, TaskDefinition},
    task_hash,
    toolchain::{ToolchainEnv, ToolchainResolver},
    workflow::RuntimeState,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not find definition for task {0}")]
    MissingDefinition(String),
    #[error("error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
}

#[derive(Debug, Clone)]
pub struct VisitorOptions {
    /// Worker pool size for this run.
    pub concurrency: usize,
    /// Stop scheduling and cancel running tasks once a task fails.
    pub fail_fast: bool,
    /// Globally disables cache reads and writes for this run.
    pub cache_enabled: bool,
}

impl Default for VisitorOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            fail_fast: false,
            cache_enabled: true,
        }
    }
}

/// Drives the tasks emitted by [`Engine::execute`]: condition checks,
/// cache skip decisions, toolchain resolution, spawning, timeout, and
/// retry all happen here. (Admission control, both the worker pool and
/// per-task `max_concurrent` gates, sits upstream in the engine.)
/// Outcomes are recorded into the shared [`RuntimeState`].
pub struct Visitor {
    manager: ProcessManager,
    runtime: Arc<RuntimeState>,
    cache: Option<Arc<FsCache>>,
    toolchains: Arc<dyn ToolchainResolver>,
    process_env: Arc<EnvironmentVariableMap>,
    opts: VisitorOptions,
    /// Tasks whose dependents must not run. Membership propagates: a
    /// task blocked by a dependency joins the set itself.
    blocked: Mutex<HashSet<String>>,
}

impl Visitor {
    pub fn new(
        manager: ProcessManager,
        runtime: Arc<RuntimeState>,
        cache: Option<Arc<FsCache>>,
        toolchains: Arc<dyn ToolchainResolver>,
        process_env: Arc<EnvironmentVariableMap>,
        opts: VisitorOptions,
    ) -> Self {
        Self {
            manager,
            runtime,
            cache,
            toolchains,
            process_env,
            opts,
            blocked: Mutex::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    pub async fn visit(self: Arc<Self>, engine: Arc<Engine>) -> Result<(), Error> {
        let (node_sender, mut node_stream) = mpsc::channel(std::cmp::max(self.opts.concurrency, 1));

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(self.opts.concurrency, node_sender))
        };

        let mut tasks = FuturesUnordered::new();

        while let Some(VisitorMessage { task, done }) = node_stream.recv().await {
            let definition = engine
                .task_definition(&task)
                .ok_or(Error::MissingDefinition(task))?
                .clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let started = Instant::now();
                let outcome = this.execute_task(&definition).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                this.runtime.record_task(
                    &definition.name,
                    outcome,
                    definition.allow_failure,
                    duration_ms,
                );
                debug!("task {} finished: {}", definition.name, outcome.label());

                if outcome.unblocks_dependents(definition.allow_failure) {
                    done.send(Ok(())).ok();
                    return;
                }

                this.blocked
                    .lock()
                    .expect("blocked set lock poisoned")
                    .insert(definition.name.clone());
                if this.opts.fail_fast && !matches!(outcome, Outcome::Cancelled) {
                    // Stop running processes first so nothing new spawns,
                    // then stop the walk
                    this.manager.stop().await;
                    done.send(Err(StopExecution)).ok();
                } else {
                    // The walk continues for unrelated branches; this
                    // task's dependents are cancelled via the blocked set
                    done.send(Ok(())).ok();
                }
            }));
        }

        // Wait for the engine and then all task bodies to wind down
        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.expect("task body panicked");
        }

        Ok(())
    }

    async fn execute_task(&self, definition: &TaskDefinition) -> Outcome {
        if self.manager.is_closing() {
            return Outcome::Cancelled;
        }
        if self.is_blocked(definition) {
            return Outcome::Cancelled;
        }

        if let Some(condition) = &definition.condition {
            let ctx = expr::Context::new()
                .with_task_env(&definition.env)
                .with_process_env(&self.process_env)
                .with_runtime(&self.runtime);
            if !expr::evaluate(condition, &ctx) {
                debug!("skipping {}: condition is false", definition.name);
                return Outcome::Skipped;
            }
        }

        // Matrix meta-tasks have no command of their own
        if definition.cmd.is_empty() {
            return Outcome::Success;
        }

        let fingerprint = self.fingerprint_for(definition);
        if let (Some(fingerprint), Some(cache)) = (&fingerprint, &self.cache) {
            match cache.exists(fingerprint) {
                Ok(Some(_)) => {
                    debug!("cache hit for {} ({fingerprint})", definition.name);
                    return Outcome::CachedHit;
                }
                Ok(None) => {}
                // A broken cache degrades to running the task
                Err(err) => warn!("cache lookup failed for {}: {err}", definition.name),
            }
        }

        let toolchain_env = match self.toolchains.resolve(&definition.toolchain) {
            Ok(toolchain_env) => toolchain_env,
            Err(err) => {
                warn!("cannot run {}: {err}", definition.name);
                return Outcome::Failure { exit_code: None };
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self.run_attempt(definition, &toolchain_env).await;
            match outcome {
                Outcome::Success => {
                    self.record_cache(
                        definition,
                        fingerprint.as_deref(),
                        started.elapsed().as_millis() as u64,
                    );
                    return outcome;
                }
                Outcome::Failure { .. } | Outcome::TimedOut if attempt <= definition.retry.max => {
                    let delay = definition.retry.delay_for(attempt);
                    debug!(
                        "task {} attempt {attempt} {}, retrying in {delay:?}",
                        definition.name,
                        outcome.label()
                    );
                    tokio::time::sleep(delay).await;
                    if self.manager.is_closing() {
                        return Outcome::Cancelled;
                    }
                }
                terminal => return terminal,
            }
        }
    }

    async fn run_attempt(
        &self,
        definition: &TaskDefinition,
        toolchain_env: &ToolchainEnv,
    ) -> Outcome {
        let mut command = Command::shell(&definition.cmd);
        if let Some(cwd) = &definition.cwd {
            command.current_dir(cwd);
        }
        let env = self.resolved_env(definition, toolchain_env);
        command.envs(env.iter());

        let mut child = match self.manager.spawn(command, STOP_GRACE_PERIOD) {
            // The manager is closing; the run has been cancelled
            None => return Outcome::Cancelled,
            Some(Ok(child)) => child,
            Some(Err(err)) => {
                warn!("failed to spawn {}: {err}", definition.name);
                return Outcome::Failure { exit_code: None };
            }
        };

        let exit = match definition.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(exit) => exit,
                Err(_) => {
                    debug!("task {} timed out, stopping child", definition.name);
                    child.stop().await;
                    return Outcome::TimedOut;
                }
            },
            None => child.wait().await,
        };

        match exit {
            Some(ChildExit::Finished(Some(0))) => Outcome::Success,
            Some(ChildExit::Finished(code)) => Outcome::Failure { exit_code: code },
            // The child was signalled, by us (cancellation) or externally
            Some(ChildExit::Killed | ChildExit::KilledExternal) => Outcome::Cancelled,
            Some(ChildExit::Failed) | None => Outcome::Failure { exit_code: None },
        }
    }

    /// Environment layering: process env, then toolchain env and PATH
    /// prepends, then the task's own env on top.
    fn resolved_env(
        &self,
        definition: &TaskDefinition,
        toolchain_env: &ToolchainEnv,
    ) -> EnvironmentVariableMap {
        let mut env = (*self.process_env).clone();
        for (key, value) in &toolchain_env.env {
            env.insert(key.clone(), value.clone());
        }
        if !toolchain_env.path_prepends.is_empty() {
            let separator = if cfg!(windows) { ";" } else { ":" };
            let mut parts: Vec<String> = toolchain_env
                .path_prepends
                .iter()
                .map(|path| path.to_string())
                .collect();
            if let Some(existing) = env.get("PATH").filter(|path| !path.is_empty()) {
                parts.push(existing.clone());
            }
            env.insert("PATH".to_string(), parts.join(separator));
        }
        for (key, value) in &definition.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    fn is_blocked(&self, definition: &TaskDefinition) -> bool {
        let blocked = self.blocked.lock().expect("blocked set lock poisoned");
        definition
            .deps
            .iter()
            .chain(&definition.deps_serial)
            .any(|dep| blocked.contains(dep))
    }

    fn fingerprint_for(&self, definition: &TaskDefinition) -> Option<String> {
        if !definition.cache || !self.opts.cache_enabled {
            return None;
        }
        match task_hash::fingerprint(definition) {
            Ok(fingerprint) => Some(fingerprint),
            Err(err) => {
                warn!("cannot fingerprint {}: {err}", definition.name);
                None
            }
        }
    }

    fn record_cache(&self, definition: &TaskDefinition, fingerprint: Option<&str>, duration: u64) {
        let (Some(fingerprint), Some(cache)) = (fingerprint, &self.cache) else {
            return;
        };
        if let Err(err) = cache.put(fingerprint, 0, duration) {
            warn!("cache write failed for {}: {err}", definition.name);
        }
    }

}
