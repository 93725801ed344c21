//! The opaque tunneling transport, driven as a subprocess.
//!
//! [`SshTransport`] shells out to an OpenSSH client in control-master
//! mode: one master process per (server, instance) carries every mapping,
//! and later invocations talk to it through the control socket. The trait
//! boundary exists so session logic can be tested without a real ssh.

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Attach/forward/detach primitives keyed by a control socket path.
///
/// A [`TunnelError::TransportRefused`] from any method means the transport
/// rejected that particular request (port in use, mapping denied); the
/// bounded retry loops in the session treat it as "try the next port".
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Probe an existing control connection for liveness.
    async fn check(&self, control_path: &Path) -> Result<()>;

    /// Create the control connection, optionally with a dynamic SOCKS
    /// listener on `socks_port`.
    async fn attach(&self, control_path: &Path, socks_port: Option<u16>) -> Result<()>;

    /// Tear the control connection down.
    async fn stop(&self, control_path: &Path) -> Result<()>;

    /// Add a `local:host:remote` forward mapping.
    async fn add_forward(&self, control_path: &Path, spec: &str) -> Result<()>;

    /// Add a `remote:host:local` reverse mapping.
    async fn add_remote(&self, control_path: &Path, spec: &str) -> Result<()>;
}

/// OpenSSH-backed transport.
pub struct SshTransport {
    binary: PathBuf,
    server: String,
    user: Option<String>,
}

impl SshTransport {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            binary: config.ssh.clone(),
            server: config.proxy.address.clone(),
            user: config.proxy.user.clone(),
        }
    }

    fn control_opt(control_path: &Path) -> String {
        format!("ControlPath={}", control_path.display())
    }

    /// Run an ssh invocation whose output is part of our own: stdout and
    /// stderr are drained to the caller's by two background copy tasks
    /// while we block on the exit status. There is no cancellation; the
    /// invocation runs to completion.
    async fn run_streamed(&self, mut command: Command, what: &str) -> Result<()> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()?;

        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::stdout()).await;
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await;
            });
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(TunnelError::TransportRefused(format!(
                "{what} exited with {status}"
            )));
        }
        Ok(())
    }

    /// Run an ssh invocation quietly, capturing output for the error.
    async fn run_captured(&self, mut command: Command, what: &str) -> Result<()> {
        let output = command.stdin(Stdio::null()).output().await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::TransportRefused(format!(
                "{what} exited with {}: {}",
                output.status,
                detail.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlTransport for SshTransport {
    async fn check(&self, control_path: &Path) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-O")
            .arg("check")
            .arg("-o")
            .arg(Self::control_opt(control_path))
            .arg(&self.server);
        tracing::debug!(server = %self.server, "Probing control connection");
        self.run_captured(command, "control check").await
    }

    async fn attach(&self, control_path: &Path, socks_port: Option<u16>) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(Self::control_opt(control_path))
            .arg("-o")
            .arg("TCPKeepAlive=yes")
            .arg("-o")
            .arg("ServerAliveInterval=60")
            .arg("-o")
            .arg("StrictHostKeyChecking=no");
        if let Some(port) = socks_port {
            command
                .arg("-o")
                .arg("ExitOnForwardFailure=yes")
                .arg("-D")
                .arg(port.to_string());
        }
        command.arg("-fNT");
        if let Some(user) = &self.user {
            command.arg("-l").arg(user);
        }
        command.arg(&self.server);

        tracing::debug!(server = %self.server, ?socks_port, "Creating control connection");
        self.run_streamed(command, "control master").await
    }

    async fn stop(&self, control_path: &Path) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-O")
            .arg("stop")
            .arg("-o")
            .arg(Self::control_opt(control_path))
            .arg(&self.server);
        tracing::debug!(server = %self.server, "Stopping control connection");
        self.run_captured(command, "control stop").await
    }

    async fn add_forward(&self, control_path: &Path, spec: &str) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-4")
            .arg("-O")
            .arg("forward")
            .arg("-o")
            .arg(Self::control_opt(control_path))
            .arg("-L")
            .arg(spec)
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg(&self.server);
        tracing::debug!(spec, "Adding forward mapping");
        self.run_streamed(command, "forward").await
    }

    async fn add_remote(&self, control_path: &Path, spec: &str) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-4")
            .arg("-O")
            .arg("forward")
            .arg("-o")
            .arg(Self::control_opt(control_path))
            .arg("-R")
            .arg(spec)
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg(&self.server);
        tracing::debug!(spec, "Adding remote mapping");
        self.run_streamed(command, "remote forward").await
    }
}
