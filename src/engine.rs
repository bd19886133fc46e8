// The engine child process.
//
// The engine is started in its own process group so that whatever it spawns (the
// WebUI likes to fork helpers) can be signalled together. Shutdown is SIGTERM to
// the group, a grace period, then SIGKILL. If nobody calls shutdown(), Drop kills
// the group so GPU memory is never left behind.

use std::{io, process::{ExitStatus, Stdio}, time::Duration};

use log::{debug, info, warn};
use tokio::process::{Child, Command};

use crate::{config::EngineConfig, error::WorkerError};

pub struct EngineProcess {
    child: Child,
    // None once the group has been torn down.
    pgid: Option<i32>,
}

impl EngineProcess {
    pub fn spawn(config: &EngineConfig) -> Result<Self, WorkerError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // New process group, with the child as its leader.
            .process_group(0);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        debug!("Running {:?}", &command);
        let child = command.spawn().map_err(|e| {
            WorkerError::StartupFailure(format!("failed to spawn {}: {}", config.program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::StartupFailure("engine exited immediately".to_string()))?;
        info!("Engine started, pid {}", pid);
        Ok(Self {
            child,
            pgid: Some(pid as i32),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the engine to exit on its own. Cancel-safe.
    pub async fn exited(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminates the whole process group: SIGTERM, then SIGKILL after `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Result<ExitStatus, WorkerError> {
        let Some(pgid) = self.pgid else {
            return Ok(self.child.wait().await?);
        };
        info!("Sending SIGTERM to engine process group {}", pgid);
        signal_group(pgid, libc::SIGTERM)?;
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("Engine still alive after {:?}, sending SIGKILL", grace);
                signal_group(pgid, libc::SIGKILL)?;
                self.child.wait().await?
            }
        };
        // Stragglers in the group don't get a grace period of their own.
        signal_group(pgid, libc::SIGKILL)?;
        self.pgid = None;
        info!("Engine stopped: {}", status);
        Ok(status)
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            warn!("Engine dropped without shutdown, killing process group {}", pgid);
            if let Err(e) = signal_group(pgid, libc::SIGKILL) {
                warn!("Failed to kill engine process group: {}", e);
            }
        }
    }
}

/// Signals every process in the group. A group that no longer exists is not an error.
fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}
