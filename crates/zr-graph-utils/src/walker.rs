use std::collections::HashMap;

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// A ready node plus the acknowledgement the receiver fires once the
/// node's work is done. Dependents stay blocked until the ack arrives.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Starts walking a DAG. A node is delivered on the returned channel
/// only after every node it points at (outgoing direction) has been
/// acknowledged. The whole walk is driven by one coordinator task that
/// keeps an unfinished-dependency count per node, so the graph itself
/// is only read here and can be dropped afterwards.
pub fn walk<N, G>(graph: G) -> (WalkHandle, mpsc::Receiver<WalkMessage<N>>)
where
    N: Eq + std::hash::Hash + Copy + Send + 'static,
    G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected,
{
    // Snapshot the shape up front: how many dependencies each node still
    // waits on, and who to notify when a node finishes. Parallel edges
    // are counted on both sides, which keeps the bookkeeping consistent
    // even for graphs that carry duplicate edges.
    let mut waiting_on: HashMap<N, usize> = HashMap::new();
    let mut dependents: HashMap<N, Vec<N>> = HashMap::new();
    let mut node_count = 0usize;
    for node in graph.node_identifiers() {
        node_count += 1;
        let mut dependency_count = 0;
        for dependency in graph.neighbors_directed(node, Direction::Outgoing) {
            dependency_count += 1;
            dependents.entry(dependency).or_default().push(node);
        }
        waiting_on.insert(node, dependency_count);
    }

    let initially_ready: Vec<N> = waiting_on
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();

    // Capacity covers every node, so delivering a ready node never
    // blocks the coordinator. The channel constructor rejects zero.
    let (ready_tx, ready_rx) = mpsc::channel(std::cmp::max(node_count, 1));
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let driver = tokio::spawn(async move {
        // One in-flight future per delivered node, resolving to the node
        // once the receiver acknowledges it (or drops the ack sender,
        // which counts as done).
        let mut pending_acks = FuturesUnordered::new();

        let deliver = |node: N| {
            let ready_tx = ready_tx.clone();
            async move {
                let (ack_tx, ack_rx) = oneshot::channel::<()>();
                if ready_tx.send((node, ack_tx)).await.is_err() {
                    // The receiving side hung up; nothing can finish this
                    // node anymore, so the walk winds down.
                    trace!("walk receiver dropped before the walk finished");
                    return None;
                }
                ack_rx.await.ok();
                Some(node)
            }
        };

        for node in initially_ready {
            pending_acks.push(deliver(node));
        }

        while !pending_acks.is_empty() {
            tokio::select! {
                // On a tie, prefer stopping over unblocking more nodes
                biased;
                _ = cancel_rx.changed() => {
                    trace!("walk cancelled with {} nodes in flight", pending_acks.len());
                    return;
                }
                finished = pending_acks.next() => {
                    let Some(Some(node)) = finished else { return };
                    for dependent in dependents.remove(&node).unwrap_or_default() {
                        let waiting = waiting_on
                            .get_mut(&dependent)
                            .expect("every node was counted before the walk started");
                        *waiting -= 1;
                        if *waiting == 0 {
                            pending_acks.push(deliver(dependent));
                        }
                    }
                }
            }
        }
    });

    (
        WalkHandle {
            cancel: cancel_tx,
            driver,
        },
        ready_rx,
    )
}

/// Control side of a running walk: cancel it, or wait for the
/// coordinator to finish.
pub struct WalkHandle {
    cancel: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl WalkHandle {
    /// Stop unblocking new nodes. Nodes already delivered stay
    /// delivered; their acknowledgements are simply no longer needed.
    pub fn cancel(&self) {
        self.cancel.send(true).ok();
    }

    /// Wait for the coordinator task to wind down.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        self.driver.await
    }
}
