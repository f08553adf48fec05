//! Run an external program once per lease episode.
//!
//! The child is spawned with [`tokio::process::Command`]; while it runs the
//! lease is touched every `heartbeat`, and `done()` is signalled when it
//! exits, whatever its status.  On process shutdown the child is killed and
//! reaped before `done()`, and the lease is only released after that.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::coordination::Extension;
use crate::handle::LeaseHandle;
use crate::worker::{Worker, WorkerError};

#[derive(Debug)]
enum EpisodeEnd {
    Exited(ExitStatus),
    Killed,
    NotStarted,
}

/// Worker that executes `program args...` for every episode.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    heartbeat: Duration,
}

impl CommandWorker {
    /// `heartbeat` should be well below the lease ttl; half of it is the
    /// usual choice.
    pub fn new(program: impl Into<String>, args: Vec<String>, heartbeat: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            heartbeat,
        }
    }

    /// Heartbeat for a given ttl: half of it, never zero.
    pub fn heartbeat_for(ttl: Duration) -> Duration {
        (ttl / 2).max(Duration::from_millis(1))
    }

    #[instrument(skip_all, fields(program = %self.program, episode = handle.episode()))]
    async fn run_episode(&self, handle: &LeaseHandle) -> Result<EpisodeEnd> {
        // Taken before the spawn so shutdown either waits for this child or
        // happens before it exists.
        let Some(mut shutdown) = handle.on_shutdown() else {
            debug!("shutting down; command not started");
            return Ok(EpisodeEnd::NotStarted);
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("SOLO_LEASE_KEY", handle.key())
            .env("SOLO_EPISODE", handle.episode().to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("spawning worker command");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        let mut ticker = tokio::time::interval(self.heartbeat);
        // The first tick completes immediately; the lease was just acquired.
        ticker.tick().await;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.with_context(|| format!("failed to wait for {}", self.program))?;
                    return Ok(EpisodeEnd::Exited(status));
                }
                () = shutdown.recv() => {
                    info!("shutting down; killing command");
                    // Kills and reaps.
                    child
                        .kill()
                        .await
                        .with_context(|| format!("failed to kill {}", self.program))?;
                    return Ok(EpisodeEnd::Killed);
                }
                _ = ticker.tick() => {
                    match handle.touch().await {
                        Extension::Extended => debug!("lease touched"),
                        outcome => warn!(?outcome, "lease touch did not extend"),
                    }
                }
            }
        }
    }
}

impl Worker for CommandWorker {
    fn run(&self, _error: Option<WorkerError>, handle: LeaseHandle) {
        let worker = self.clone();
        tokio::spawn(async move {
            match worker.run_episode(&handle).await {
                Ok(EpisodeEnd::Exited(status)) if status.success() => {
                    info!(program = %worker.program, "command finished")
                }
                Ok(EpisodeEnd::Exited(status)) => {
                    warn!(program = %worker.program, %status, "command exited unsuccessfully")
                }
                Ok(EpisodeEnd::Killed) => info!(program = %worker.program, "command killed at shutdown"),
                Ok(EpisodeEnd::NotStarted) => {}
                Err(e) => error!(program = %worker.program, error = %e, "command failed"),
            }
            handle.done();
        });
    }
}
