//! Spawning and terminating per-slot worker processes.

use crate::error::CoreError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdout, Command};

/// Start a worker bound to one slot: `worker <device> <port>`.
///
/// Stdout is piped so the action engine can scan it; stderr is inherited.
/// The child is killed if its handle is dropped, so a crashing manager
/// never leaks workers.
pub(crate) fn spawn(
    binary: &Path,
    device_name: &str,
    primary_port: u16,
) -> Result<(Child, ChildStdout), CoreError> {
    let mut child = Command::new(binary)
        .arg(device_name)
        .arg(primary_port.to_string())
        .stdout(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(CoreError::WorkerStartFailed)?;

    // Piped above, so present on any freshly spawned child.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::WorkerStartFailed(std::io::Error::other("no stdout pipe")))?;

    tracing::info!(
        binary = %binary.display(),
        device = device_name,
        port = primary_port,
        pid = child.id(),
        "Worker started"
    );
    Ok((child, stdout))
}

/// Forcefully terminate a worker and wait for it to exit, bounded by
/// `timeout`. No graceful protocol is assumed. Returns `false` when the
/// wait timed out; the caller removes the lease either way and the
/// kill-on-drop guard reaps the process eventually.
pub(crate) async fn terminate(child: &mut Child, timeout: Duration) -> bool {
    if let Err(e) = child.start_kill() {
        // Already exited is the common benign case here.
        tracing::debug!(error = %e, "Kill signal not delivered");
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(%status, "Worker terminated");
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Wait for killed worker failed");
            true
        }
        Err(_) => {
            tracing::warn!(?timeout, "Worker did not exit within termination timeout");
            false
        }
    }
}
