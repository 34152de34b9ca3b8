//! `process`
//!
//! Spawning and managing the child processes that run task commands.
//! The manager hands out supervised children and can stop all of them
//! at once when a run is cancelled. Stopping is graceful: SIGTERM to the
//! process group, a grace period, then SIGKILL.

mod child;
mod command;

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;
use tokio::task::JoinSet;
use tracing::debug;

/// Grace period between the stop signal and the hard kill.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

/// Tracks every child spawned for a run. Cheap to clone; all clones
/// share the same set of children.
#[derive(Debug, Clone, Default)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a new child process to run the given command.
    ///
    /// Returns `None` if the manager is already shutting down, in which
    /// case the task should report itself as cancelled.
    pub fn spawn(&self, command: Command, stop_grace: Duration) -> Option<io::Result<Child>> {
        let mut lock = self.state.lock().expect("process manager lock poisoned");
        if lock.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(stop_grace));
        if let Ok(child) = &child {
            lock.children.push(child.clone());
        }
        Some(child)
    }

    /// Stop every running child and refuse new spawns. Safe to call more
    /// than once.
    pub async fn stop(&self) {
        let children = {
            let mut lock = self.state.lock().expect("process manager lock poisoned");
            lock.is_closing = true;
            lock.children.drain(..).collect::<Vec<_>>()
        };

        let mut set = JoinSet::new();
        for mut child in children {
            set.spawn(async move { child.stop().await });
        }

        debug!("waiting for {} processes to exit", set.len());

        while let Some(out) = set.join_next().await {
            debug!("process exited: {:?}", out);
        }
    }

    /// Wait for every running child to exit on its own.
    pub async fn wait(&self) {
        let children = {
            let mut lock = self.state.lock().expect("process manager lock poisoned");
            lock.children.drain(..).collect::<Vec<_>>()
        };

        let mut set = JoinSet::new();
        for mut child in children {
            set.spawn(async move { child.wait().await });
        }

        while let Some(out) = set.join_next().await {
            debug!("process exited: {:?}", out);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.state
            .lock()
            .expect("process manager lock poisoned")
            .is_closing
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_basic() {
        let manager = ProcessManager::new();
        manager
            .spawn(Command::shell("sleep 1"), STOP_GRACE_PERIOD)
            .unwrap()
            .unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_multiple() {
        let manager = ProcessManager::new();
        for _ in 0..3 {
            manager
                .spawn(Command::shell("sleep 1"), STOP_GRACE_PERIOD)
                .unwrap()
                .unwrap();
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_no_spawns_after_stop() {
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager
            .spawn(Command::shell("echo hi"), STOP_GRACE_PERIOD)
            .is_none());
        assert!(manager.is_closing());
    }

    #[tokio::test]
    async fn test_wait_for_exit() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(Command::shell("exit 0"), STOP_GRACE_PERIOD)
            .unwrap()
            .unwrap();
        manager.wait().await;
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }
}
