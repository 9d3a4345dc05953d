//! Peer subprocess: spawning and the bounded stop sequence.
//!
//! Stop policy: the caller closes the peer's stdin first. The peer then has
//! one grace period to exit on its own, another after SIGTERM (unix only),
//! and is killed after that.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different peer launch strategies.
pub trait PeerSpawner: Send + Sync {
    /// Start the peer with stdin and stdout piped.
    fn spawn(&self, config: &ClientConfig) -> Result<Child, SpawnError>;
}

/// Runs `config.program` with `config.args`; stderr is inherited.
pub struct CommandSpawner;

impl PeerSpawner for CommandSpawner {
    fn spawn(&self, config: &ClientConfig) -> Result<Child, SpawnError> {
        tracing::debug!(program = %config.program.display(), args = ?config.args, "Spawning peer");
        let child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Handle to a running peer process.
pub struct PeerProcess {
    child: Child,
}

impl PeerProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking exit check.
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for exit, escalating after each `grace` period.
    ///
    /// Expects stdin to be closed already.
    pub async fn stop(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return status;
        }

        #[cfg(unix)]
        if self.terminate() {
            tracing::warn!(pid = ?self.id(), "Peer still running after stdin closed, sent SIGTERM");
            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                return status;
            }
        }

        tracing::warn!(pid = ?self.id(), "Peer did not exit in time, killing");
        self.child.kill().await?;
        self.child.wait().await
    }

    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return false;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to send SIGTERM to peer");
                false
            }
        }
    }
}
