//! Control-connection session: one per (server, instance) pair.
//!
//! The session owns two filesystem artifacts under `~/.ssh`:
//! the control socket marker `<server>.<hostname>.<instance>` whose
//! existence (plus a liveness probe) means Attached, and the record file
//! `<server>.<hostname>.<instance>.txt` listing active mappings.

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::records::{ForwardSpec, RecordFile, RemoteSpec, TargetSpec, TunnelKind, TunnelRecord};
use crate::transport::ControlTransport;
use std::path::PathBuf;

/// Result of a mapping verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingOutcome {
    /// Local port of the mapping.
    pub local_port: u16,
    /// True when an existing record satisfied the request and nothing was
    /// created.
    pub existing: bool,
}

/// One control-connection session.
pub struct Session {
    server: String,
    instance: u32,
    control_path: PathBuf,
    records: RecordFile,
}

impl Session {
    /// Derive paths from configuration: `~/.ssh/<server>.<hostname>.<instance>`.
    pub fn from_config(config: &TunnelConfig) -> Result<Self> {
        let home = dirs::home_dir().ok_or(TunnelError::MissingHome)?;
        let host = hostname::get()?.to_string_lossy().into_owned();
        let stem = format!("{}.{}.{}", config.proxy.address, host, config.instance);
        let control_path = home.join(".ssh").join(&stem);
        let records_path = home.join(".ssh").join(format!("{stem}.txt"));
        Ok(Self {
            server: config.proxy.address.clone(),
            instance: config.instance,
            control_path,
            records: RecordFile::new(records_path),
        })
    }

    /// Build a session with explicit paths. Used by tests.
    pub fn with_paths(
        server: impl Into<String>,
        instance: u32,
        control_path: PathBuf,
        records_path: PathBuf,
    ) -> Self {
        Self {
            server: server.into(),
            instance,
            control_path,
            records: RecordFile::new(records_path),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn control_path(&self) -> &PathBuf {
        &self.control_path
    }

    pub fn records(&self) -> &RecordFile {
        &self.records
    }

    /// Whether a control-connection marker is present. Liveness is only
    /// verified on attach; the other verbs trust the marker and let the
    /// transport report a dead master.
    pub fn attached(&self) -> bool {
        self.control_path.exists()
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached() {
            Ok(())
        } else {
            Err(TunnelError::NotAttached(self.server.clone()))
        }
    }

    /// The transport normally creates the control socket itself; make
    /// sure a marker exists even for transports that do not.
    fn ensure_marker(&self) -> Result<()> {
        if !self.control_path.exists() {
            std::fs::File::create(&self.control_path)?;
        }
        Ok(())
    }

    /// Remove marker and records together.
    fn clear_state(&self) -> Result<()> {
        match std::fs::remove_file(&self.control_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.records.clear()
    }

    /// Establish the control connection.
    ///
    /// An existing live connection is an error unless `force` (scripting
    /// mode assumes a fresh master is wanted each time and resets it); a
    /// stale marker is cleaned up silently. With `socks`, a dynamic
    /// listener is established by trying each port in the range in turn.
    ///
    /// Returns the SOCKS port, when one was established.
    pub async fn attach(
        &self,
        transport: &dyn ControlTransport,
        socks: Option<(u16, u16)>,
        force: bool,
    ) -> Result<Option<u16>> {
        if self.attached() {
            match transport.check(&self.control_path).await {
                Ok(()) => {
                    if !force {
                        return Err(TunnelError::AlreadyAttached(self.server.clone()));
                    }
                    tracing::debug!(server = %self.server, "Live control connection reset");
                    if let Err(e) = transport.stop(&self.control_path).await {
                        tracing::debug!(error = %e, "Stopping old master failed");
                    }
                    self.clear_state()?;
                }
                Err(e) => {
                    tracing::debug!(server = %self.server, error = %e, "Stale control marker removed");
                    self.clear_state()?;
                }
            }
        }
        self.records.clear()?;

        let socks_port = match socks {
            None => {
                transport.attach(&self.control_path, None).await?;
                None
            }
            Some((start, end)) => {
                let port = self.attach_with_socks(transport, start, end).await?;
                Some(port)
            }
        };

        self.ensure_marker()?;
        if let Some(port) = socks_port {
            self.records.append(&TunnelRecord::Socks { port })?;
        }
        tracing::info!(server = %self.server, ?socks_port, "Attached");
        Ok(socks_port)
    }

    /// Bounded search for a SOCKS port the transport accepts.
    async fn attach_with_socks(
        &self,
        transport: &dyn ControlTransport,
        start: u16,
        end: u16,
    ) -> Result<u16> {
        for port in start..=end {
            match transport.attach(&self.control_path, Some(port)).await {
                Ok(()) => return Ok(port),
                Err(TunnelError::TransportRefused(e)) => {
                    tracing::debug!(port, reason = %e, "SOCKS port refused, trying next");
                }
                Err(other) => return Err(other),
            }
        }
        Err(TunnelError::PortRangeExhausted { start, end })
    }

    /// Tear the control connection down. The record set is deleted even
    /// when the transport reports a failure, so no orphaned state stays
    /// behind.
    pub async fn detach(&self, transport: &dyn ControlTransport) -> Result<()> {
        if !self.attached() {
            return Err(TunnelError::NotAttached(self.server.clone()));
        }
        if let Err(e) = transport.stop(&self.control_path).await {
            tracing::warn!(server = %self.server, error = %e, "Transport failed to stop cleanly");
        }
        self.clear_state()?;
        tracing::info!(server = %self.server, "Detached");
        Ok(())
    }

    /// Add a forward mapping, idempotent on the remote port.
    pub async fn forward(
        &self,
        transport: &dyn ControlTransport,
        spec: &ForwardSpec,
    ) -> Result<MappingOutcome> {
        self.ensure_attached()?;
        if let Some(local) = self
            .records
            .local_port_for_remote(TunnelKind::Forward, spec.remote)?
        {
            tracing::debug!(%spec, local, "Forward mapping already active");
            return Ok(MappingOutcome {
                local_port: local,
                existing: true,
            });
        }

        transport
            .add_forward(&self.control_path, &spec.to_string())
            .await?;
        self.records.append(&TunnelRecord::Forward {
            local: spec.local,
            host: spec.host.clone(),
            remote: spec.remote,
        })?;
        tracing::info!(%spec, "Forward mapping active");
        Ok(MappingOutcome {
            local_port: spec.local,
            existing: false,
        })
    }

    /// Add a reverse mapping, idempotent on the remote port.
    pub async fn remote(
        &self,
        transport: &dyn ControlTransport,
        spec: &RemoteSpec,
    ) -> Result<MappingOutcome> {
        self.ensure_attached()?;
        if let Some(local) = self
            .records
            .local_port_for_remote(TunnelKind::Remote, spec.remote)?
        {
            tracing::debug!(%spec, local, "Remote mapping already active");
            return Ok(MappingOutcome {
                local_port: local,
                existing: true,
            });
        }

        transport
            .add_remote(&self.control_path, &spec.to_string())
            .await?;
        self.records.append(&TunnelRecord::Remote {
            remote: spec.remote,
            host: spec.host.clone(),
            local: spec.local,
        })?;
        tracing::info!(%spec, "Remote mapping active");
        Ok(MappingOutcome {
            local_port: spec.local,
            existing: false,
        })
    }

    /// Forward to `target`, picking the local port by bounded retry over
    /// `range`. Appends exactly one record on success, none on failure.
    pub async fn autoforward(
        &self,
        transport: &dyn ControlTransport,
        target: &TargetSpec,
        range: (u16, u16),
    ) -> Result<MappingOutcome> {
        self.ensure_attached()?;
        if let Some(local) = self
            .records
            .local_port_for_remote(TunnelKind::Forward, target.port)?
        {
            return Ok(MappingOutcome {
                local_port: local,
                existing: true,
            });
        }

        let (start, end) = range;
        for local in start..=end {
            let spec = ForwardSpec {
                local,
                host: target.host.clone(),
                remote: target.port,
            };
            match transport
                .add_forward(&self.control_path, &spec.to_string())
                .await
            {
                Ok(()) => {
                    self.records.append(&TunnelRecord::Forward {
                        local,
                        host: target.host.clone(),
                        remote: target.port,
                    })?;
                    tracing::info!(%spec, "Forward mapping active");
                    return Ok(MappingOutcome {
                        local_port: local,
                        existing: false,
                    });
                }
                Err(TunnelError::TransportRefused(e)) => {
                    tracing::debug!(local, reason = %e, "Local port refused, trying next");
                }
                Err(other) => return Err(other),
            }
        }
        Err(TunnelError::PortRangeExhausted { start, end })
    }

    /// Reverse-forward `target`, picking the local port by bounded retry.
    pub async fn autoremote(
        &self,
        transport: &dyn ControlTransport,
        target: &TargetSpec,
        range: (u16, u16),
    ) -> Result<MappingOutcome> {
        self.ensure_attached()?;
        if let Some(local) = self
            .records
            .local_port_for_remote(TunnelKind::Remote, target.port)?
        {
            return Ok(MappingOutcome {
                local_port: local,
                existing: true,
            });
        }

        let (start, end) = range;
        for local in start..=end {
            let spec = RemoteSpec {
                remote: target.port,
                host: target.host.clone(),
                local,
            };
            match transport
                .add_remote(&self.control_path, &spec.to_string())
                .await
            {
                Ok(()) => {
                    self.records.append(&TunnelRecord::Remote {
                        remote: target.port,
                        host: target.host.clone(),
                        local,
                    })?;
                    tracing::info!(%spec, "Remote mapping active");
                    return Ok(MappingOutcome {
                        local_port: local,
                        existing: false,
                    });
                }
                Err(TunnelError::TransportRefused(e)) => {
                    tracing::debug!(local, reason = %e, "Local port refused, trying next");
                }
                Err(other) => return Err(other),
            }
        }
        Err(TunnelError::PortRangeExhausted { start, end })
    }

    /// Read-only report: attachment state and the persisted record set.
    pub fn status(&self) -> Result<(bool, Vec<TunnelRecord>)> {
        Ok((self.attached(), self.records.load()?))
    }
}
