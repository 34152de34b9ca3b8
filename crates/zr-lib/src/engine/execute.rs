use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinSet,
};
use tracing::{debug, trace};

use super::{Engine, TaskNode};

/// A ready task handed to the visitor. The visitor fires `done` with
/// its verdict once the task has a terminal outcome; replying
/// `Err(StopExecution)` stops the walk.
pub struct VisitorMessage {
    pub task: String,
    pub done: oneshot::Sender<Result<(), StopExecution>>,
}

/// Sentinel a visitor replies with to stop scheduling further tasks.
/// Tasks that are already running are not interrupted by this; stopping
/// them is the visitor's job.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("graph walk lost its visitor before completing")]
    VisitorDropped,
}

/// Looks up (lazily creating) the `max_concurrent` gate for a task.
/// Gates key on the base name, the part before the first `:`, so a
/// limit declared on a matrix task bounds its whole variant family.
fn concurrency_gate(
    gates: &mut HashMap<String, Arc<Semaphore>>,
    task_name: &str,
    limit: u32,
) -> Option<Arc<Semaphore>> {
    if limit == 0 {
        return None;
    }
    let base = task_name.split(':').next().unwrap_or(task_name);
    Some(
        gates
            .entry(base.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
            .clone(),
    )
}

impl Engine {
    /// Walks the task graph, delivering each ready task to the visitor.
    /// Two layers of admission control sit between readiness and
    /// delivery: the per-task `max_concurrent` gate (acquired first, so
    /// parked instances do not occupy a worker slot) and the run-wide
    /// worker pool of `concurrency` permits.
    pub async fn execute(
        self: Arc<Self>,
        concurrency: usize,
        visitor: mpsc::Sender<VisitorMessage>,
    ) -> Result<(), ExecuteError> {
        let workers = Arc::new(Semaphore::new(std::cmp::max(concurrency, 1)));
        let mut gates: HashMap<String, Arc<Semaphore>> = HashMap::new();
        // Task bodies report a stop verdict back over this channel; the
        // walk handle is owned right here, so no shared state is needed
        // to cancel it.
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();

        let (walk, mut ready) = zr_graph_utils::walk(&self.graph);
        let mut bodies: JoinSet<Result<(), ExecuteError>> = JoinSet::new();

        loop {
            tokio::select! {
                next = ready.recv() => {
                    let Some((node, finished)) = next else { break };
                    let TaskNode::Task(task_name) = &self.graph[node] else {
                        // The synthetic root is purely structural
                        finished.send(()).ok();
                        continue;
                    };

                    let limit = self
                        .definitions
                        .get(task_name)
                        .map(|definition| definition.max_concurrent)
                        .unwrap_or(0);
                    let gate = concurrency_gate(&mut gates, task_name, limit);

                    let task = task_name.clone();
                    let workers = workers.clone();
                    let visitor = visitor.clone();
                    let stop_tx = stop_tx.clone();
                    bodies.spawn(async move {
                        let _instance_slot = match gate {
                            Some(gate) => Some(gate.acquire_owned().await.expect(
                                "per-task concurrency gate closed while instances were parked",
                            )),
                            None => None,
                        };
                        let _worker_slot = workers
                            .acquire_owned()
                            .await
                            .expect("worker pool closed while tasks were still waiting");

                        let (done_tx, done_rx) = oneshot::channel();
                        if visitor
                            .send(VisitorMessage { task, done: done_tx })
                            .await
                            .is_err()
                        {
                            return Err(ExecuteError::VisitorDropped);
                        }

                        match done_rx.await {
                            Ok(Err(StopExecution)) => {
                                stop_tx.send(()).ok();
                            }
                            Ok(Ok(())) => {}
                            // A dropped reply counts as a completed task
                            Err(_) => trace!("visitor dropped its reply channel"),
                        }
                        finished.send(()).ok();
                        Ok(())
                    });
                }
                Some(()) = stop_rx.recv() => {
                    debug!("stop requested, cancelling the graph walk");
                    walk.cancel();
                }
            }
        }

        while let Some(joined) = bodies.join_next().await {
            joined.expect("task body panicked")?;
        }
        walk.wait().await.expect("walk coordinator panicked");

        Ok(())
    }
}
