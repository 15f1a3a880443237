//! Child-process supervision with restart backoff
//!
//! Control-plane processes (api-server, scheduler, storage backends, ...)
//! are bundled binaries that the components spawn and keep alive. The
//! supervisor restarts a crashed child with capped exponential backoff until
//! asked to stop; a missing or crash-looping binary is logged, not fatal,
//! because the component has already reached its "running" state from the
//! orchestrator's point of view.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Error;
use crate::Result;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A child that stayed up this long resets the backoff ladder
const STABLE_RUNTIME: Duration = Duration::from_secs(10);

/// Supervises one child process
pub struct Supervisor {
    name: String,
    bin: PathBuf,
    args: Vec<String>,
    running: Option<Running>,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    /// Create a supervisor for the given binary and arguments
    pub fn new(name: impl Into<String>, bin: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bin: bin.into(),
            args,
            running: None,
        }
    }

    /// Start supervising: spawns the monitor task and returns
    ///
    /// Idempotent; calling `spawn` on a running supervisor does nothing.
    pub fn spawn(&mut self) {
        if self.running.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let name = self.name.clone();
        let bin = self.bin.clone();
        let args = self.args.clone();
        let handle = tokio::spawn(monitor(name, bin, args, stop_rx));
        self.running = Some(Running { stop_tx, handle });
    }

    /// Stop the supervised process and wait for the monitor task to finish
    ///
    /// Idempotent; stopping a supervisor that never spawned is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop_tx.send(true);
        running
            .handle
            .await
            .map_err(|e| Error::component(&self.name, format!("monitor task failed: {e}")))
    }

    /// Whether the monitor task is active
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

async fn monitor(name: String, bin: PathBuf, args: Vec<String>, mut stop_rx: watch::Receiver<bool>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match Command::new(&bin).args(&args).spawn() {
            Ok(mut child) => {
                info!(process = %name, bin = %bin.display(), "process started");
                let started = Instant::now();
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => warn!(process = %name, %status, "process exited, restarting"),
                            Err(e) => warn!(process = %name, error = %e, "failed to reap process, restarting"),
                        }
                        if started.elapsed() >= STABLE_RUNTIME {
                            backoff = INITIAL_BACKOFF;
                        }
                    }
                    _ = stop_rx.changed() => {
                        // kill() delivers SIGKILL and reaps the child; the
                        // bundled binaries hold no state that needs a grace
                        // period beyond what their own components flushed.
                        if let Err(e) = child.kill().await {
                            warn!(process = %name, error = %e, "failed to kill process");
                        }
                        info!(process = %name, "process stopped");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(process = %name, bin = %bin.display(), error = %e, "failed to spawn process");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop_rx.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
