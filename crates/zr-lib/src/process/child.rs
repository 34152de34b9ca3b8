//! Spawning and supervising a single child process.
//!
//! A spawned child is owned by a supervision task that waits for either
//! the process to exit or a command (stop/kill) to arrive. Stopping is
//! graceful: a termination signal to the process group, a grace period,
//! then a hard kill.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    join,
    process::Command as TokioCommand,
    sync::{mpsc, watch, RwLock},
};
use tracing::debug;

use super::Command;

#[derive(Debug)]
pub enum ChildState {
    Running(ChildCommandChannel),
    Exited(ChildExit),
}

impl ChildState {
    pub fn command_channel(&self) -> Option<ChildCommandChannel> {
        match self {
            ChildState::Running(channel) => Some(channel.clone()),
            ChildState::Exited(_) => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    Killed,
    /// Exited without an exit code and without us signalling it.
    KilledExternal,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ShutdownStyle {
    /// Send a termination signal to the process group, then follow up
    /// with a kill if `Duration` elapses without an exit.
    Graceful(Duration),
    Kill,
}

struct ChildHandle {
    pid: Option<u32>,
    child: tokio::process::Child,
}

impl ChildHandle {
    fn spawn(command: Command) -> io::Result<Self> {
        let mut command = TokioCommand::from(command);

        // A process group lets a stop signal reach the whole shell tree
        #[cfg(unix)]
        {
            use nix::unistd::setsid;
            unsafe {
                command.pre_exec(|| {
                    setsid()?;
                    Ok(())
                });
            }
        }

        let child = command.spawn()?;
        let pid = child.id();
        Ok(Self { pid, child })
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

impl ShutdownStyle {
    async fn process(&self, child: &mut ChildHandle) -> ChildState {
        match self {
            ShutdownStyle::Graceful(grace) => {
                // Windows offers no signal to forward, so a graceful stop
                // degrades to an immediate kill there.
                #[cfg(unix)]
                {
                    let fut = async {
                        if let Some(pid) = child.pid {
                            debug!("sending SIGTERM to process group of {pid}");
                            // Negative pid targets the process group
                            let pgid = -(pid as i32);
                            unsafe {
                                libc::kill(pgid, libc::SIGTERM);
                            }
                            child.wait().await
                        } else {
                            Ok(None)
                        }
                    };

                    let result = tokio::time::timeout(*grace, fut).await;
                    match result {
                        // The exit code after a signal we sent is noise;
                        // report the stop itself.
                        Ok(Ok(_exit_code)) => ChildState::Exited(ChildExit::Killed),
                        Ok(Err(_)) => ChildState::Exited(ChildExit::Failed),
                        Err(_) => {
                            debug!("graceful shutdown timed out, killing child");
                            match child.kill().await {
                                Ok(_) => ChildState::Exited(ChildExit::Killed),
                                Err(_) => ChildState::Exited(ChildExit::Failed),
                            }
                        }
                    }
                }

                #[cfg(windows)]
                {
                    let _ = grace;
                    debug!("graceful stop not supported on windows, killing");
                    match child.kill().await {
                        Ok(_) => ChildState::Exited(ChildExit::Killed),
                        Err(_) => ChildState::Exited(ChildExit::Failed),
                    }
                }
            }
            ShutdownStyle::Kill => match child.kill().await {
                Ok(_) => ChildState::Exited(ChildExit::Killed),
                Err(_) => ChildState::Exited(ChildExit::Failed),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildCommandChannel(mpsc::Sender<ChildCommand>);

impl ChildCommandChannel {
    pub fn new() -> (Self, mpsc::Receiver<ChildCommand>) {
        let (tx, rx) = mpsc::channel(1);
        (ChildCommandChannel(tx), rx)
    }

    pub async fn kill(&self) -> Result<(), mpsc::error::SendError<ChildCommand>> {
        self.0.send(ChildCommand::Kill).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<ChildCommand>> {
        self.0.send(ChildCommand::Stop).await
    }
}

pub enum ChildCommand {
    Stop,
    Kill,
}

struct ChildStateManager {
    shutdown_style: ShutdownStyle,
    task_state: Arc<RwLock<ChildState>>,
    exit_tx: watch::Sender<Option<ChildExit>>,
}

impl ChildStateManager {
    async fn handle_child_command(&self, command: Option<ChildCommand>, child: &mut ChildHandle) {
        let state = match command {
            // A closed channel means every handle was dropped; shut the
            // child down the same way an explicit stop would.
            Some(ChildCommand::Stop) | None => {
                debug!("stopping child process");
                self.shutdown_style.process(child).await
            }
            Some(ChildCommand::Kill) => {
                debug!("killing child process");
                ShutdownStyle::Kill.process(child).await
            }
        };

        if let ChildState::Exited(exit) = &state {
            self.exit_tx.send(Some(*exit)).ok();
        }
        let mut task_state = self.task_state.write().await;
        *task_state = state;
    }

    async fn handle_child_exit(&self, status: io::Result<Option<i32>>) {
        let exit = match status {
            Ok(Some(code)) => ChildExit::Finished(Some(code)),
            // A missing exit code means an external signal took the
            // process down
            Ok(None) => ChildExit::KilledExternal,
            Err(_) => ChildExit::Failed,
        };
        {
            let mut task_state = self.task_state.write().await;
            *task_state = ChildState::Exited(exit);
        }
        self.exit_tx.send(Some(exit)).ok();
    }
}

/// A handle to a spawned child process. Cheap to clone; all clones
/// observe the same exit.
#[derive(Clone, Debug)]
pub struct Child {
    pid: Option<u32>,
    state: Arc<RwLock<ChildState>>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    label: String,
}

impl Child {
    /// Spawn the command immediately and hand it to a supervision task.
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> io::Result<Self> {
        let label = command.label().to_string();
        let mut handle = ChildHandle::spawn(command)?;
        let pid = handle.pid;

        let (command_tx, mut command_rx) = ChildCommandChannel::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let state = Arc::new(RwLock::new(ChildState::Running(command_tx)));
        let task_state = state.clone();

        tokio::spawn(async move {
            let manager = ChildStateManager {
                shutdown_style,
                task_state,
                exit_tx,
            };
            tokio::select! {
                command = command_rx.recv() => {
                    manager.handle_child_command(command, &mut handle).await;
                }
                status = handle.wait() => {
                    manager.handle_child_exit(status).await;
                }
            }
        });

        Ok(Self {
            pid,
            state,
            exit_channel: exit_rx,
            label,
        })
    }

    /// Wait for the child to exit, returning how it went.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        if let Some(exit) = *self.exit_channel.borrow() {
            return Some(exit);
        }
        self.exit_channel.changed().await.ok()?;
        *self.exit_channel.borrow()
    }

    /// Gracefully shut the child down and wait for it.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        let mut watch = self.exit_channel.clone();

        let send_stop = async {
            let channel = {
                let state = self.state.read().await;
                match state.command_channel() {
                    Some(channel) => channel,
                    None => return,
                }
            };
            // A send failure means the supervisor already exited
            channel.stop().await.ok();
        };

        let (_, exit) = join! {
            send_stop,
            async {
                if let Some(exit) = *watch.borrow() {
                    return Some(exit);
                }
                watch.changed().await.ok()?;
                *watch.borrow()
            }
        };

        exit
    }

    /// Kill the child immediately and wait for it.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        let mut watch = self.exit_channel.clone();

        let send_kill = async {
            let channel = {
                let state = self.state.read().await;
                match state.command_channel() {
                    Some(channel) => channel,
                    None => return,
                }
            };
            channel.kill().await.ok();
        };

        let (_, exit) = join! {
            send_kill,
            async {
                if let Some(exit) = *watch.borrow() {
                    return Some(exit);
                }
                watch.changed().await.ok()?;
                *watch.borrow()
            }
        };

        exit
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const GRACE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_clean_exit() {
        let mut child =
            Child::spawn(Command::shell("exit 0"), ShutdownStyle::Graceful(GRACE)).unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let mut child =
            Child::spawn(Command::shell("exit 3"), ShutdownStyle::Graceful(GRACE)).unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_child() {
        let mut child =
            Child::spawn(Command::shell("sleep 10"), ShutdownStyle::Graceful(GRACE)).unwrap();
        let exit = child.stop().await;
        assert_eq!(exit, Some(ChildExit::Killed));
    }

    #[tokio::test]
    async fn test_wait_after_exit_still_returns() {
        let mut child =
            Child::spawn(Command::shell("exit 0"), ShutdownStyle::Graceful(GRACE)).unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
        // A second wait observes the stored exit rather than hanging
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_trap_is_force_killed_after_grace() {
        // The child ignores SIGTERM; stop must escalate to SIGKILL
        let script = "trap '' TERM; sleep 10";
        let mut child =
            Child::spawn(Command::shell(script), ShutdownStyle::Graceful(GRACE)).unwrap();
        let exit = child.stop().await;
        assert_eq!(exit, Some(ChildExit::Killed));
    }
}
