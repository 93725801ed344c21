//! Persisted tunnel records and mapping-spec parsing.
//!
//! Each active mapping is one text line in an append-only file:
//!
//! ```text
//! SOCKS server at 1080
//! Forward 8080:10.0.0.5:443
//! Remote 9000:10.0.0.5:22
//! ```
//!
//! Records are never rewritten individually; the whole file is deleted
//! when the control connection goes away.

use crate::error::{Result, TunnelError};
use regex::Regex;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

/// Which direction a port mapping runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Local listener, remote destination.
    Forward,
    /// Remote listener, local destination.
    Remote,
}

/// One persisted mapping line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRecord {
    /// Dynamic SOCKS listener established on attach.
    Socks { port: u16 },
    /// `-L`-style mapping: local listener to host:remote.
    Forward { local: u16, host: String, remote: u16 },
    /// `-R`-style mapping: remote listener to host:local.
    Remote { remote: u16, host: String, local: u16 },
}

impl fmt::Display for TunnelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks { port } => write!(f, "SOCKS server at {port}"),
            Self::Forward {
                local,
                host,
                remote,
            } => write!(f, "Forward {local}:{host}:{remote}"),
            Self::Remote {
                remote,
                host,
                local,
            } => write!(f, "Remote {remote}:{host}:{local}"),
        }
    }
}

impl TunnelRecord {
    /// Parse one record line. `None` for lines in no known format.
    pub fn parse(line: &str) -> Option<Self> {
        // Compiled from literals, cannot fail.
        let socks = Regex::new(r"^SOCKS server at (\d+)$").ok()?;
        let mapping = Regex::new(r"^(Forward|Remote) (\d+):([A-Za-z0-9_.-]+):(\d+)$").ok()?;

        if let Some(caps) = socks.captures(line) {
            return Some(Self::Socks {
                port: caps[1].parse().ok()?,
            });
        }
        let caps = mapping.captures(line)?;
        let first: u16 = caps[2].parse().ok()?;
        let host = caps[3].to_string();
        let last: u16 = caps[4].parse().ok()?;
        match &caps[1] {
            "Forward" => Some(Self::Forward {
                local: first,
                host,
                remote: last,
            }),
            _ => Some(Self::Remote {
                remote: first,
                host,
                local: last,
            }),
        }
    }

    /// The port identifying this mapping for idempotency checks: the
    /// far-side port clients keep asking for.
    pub fn remote_port(&self) -> Option<(TunnelKind, u16)> {
        match self {
            Self::Forward { remote, .. } => Some((TunnelKind::Forward, *remote)),
            Self::Remote { remote, .. } => Some((TunnelKind::Remote, *remote)),
            Self::Socks { .. } => None,
        }
    }

    /// The locally relevant port of this mapping.
    pub fn local_port(&self) -> u16 {
        match self {
            Self::Socks { port } => *port,
            Self::Forward { local, .. } => *local,
            Self::Remote { local, .. } => *local,
        }
    }
}

/// The append-only record file for one control connection.
#[derive(Debug, Clone)]
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// All records currently on disk. A missing file is an empty set;
    /// unparseable lines are skipped.
    pub fn load(&self) -> Result<Vec<TunnelRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match TunnelRecord::parse(line) {
                Some(record) => records.push(record),
                None => tracing::debug!(line, "Skipping unrecognized record line"),
            }
        }
        Ok(records)
    }

    /// Append one record line.
    pub fn append(&self, record: &TunnelRecord) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{record}")?;
        file.flush()?;
        Ok(())
    }

    /// Delete the whole record set. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Local port of an existing mapping of `kind` to `remote`, if any.
    pub fn local_port_for_remote(&self, kind: TunnelKind, remote: u16) -> Result<Option<u16>> {
        Ok(self
            .load()?
            .iter()
            .find(|r| r.remote_port() == Some((kind, remote)))
            .map(|r| r.local_port()))
    }
}

/// Parsed `local:host:remote` argument for `forward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local: u16,
    pub host: String,
    pub remote: u16,
}

/// Parsed `remote:host:local` argument for `remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub remote: u16,
    pub host: String,
    pub local: u16,
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.remote, self.host, self.local)
    }
}

/// Parsed `host:port` argument for the auto verbs, naming only the
/// far-side destination; the local port is found by retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
}

fn split3(spec: &str) -> Result<(u16, String, u16)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [first, host, last] = parts.as_slice() else {
        return Err(TunnelError::InvalidSpec(spec.to_string()));
    };
    if host.is_empty() {
        return Err(TunnelError::InvalidSpec(spec.to_string()));
    }
    let first = first
        .parse()
        .map_err(|_| TunnelError::InvalidSpec(spec.to_string()))?;
    let last = last
        .parse()
        .map_err(|_| TunnelError::InvalidSpec(spec.to_string()))?;
    Ok((first, host.to_string(), last))
}

impl ForwardSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (local, host, remote) = split3(spec)?;
        Ok(Self {
            local,
            host,
            remote,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local, self.host, self.remote)
    }
}

impl RemoteSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (remote, host, local) = split3(spec)?;
        Ok(Self {
            remote,
            host,
            local,
        })
    }
}

impl TargetSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidSpec(spec.to_string()))?;
        if host.is_empty() {
            return Err(TunnelError::InvalidSpec(spec.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port: port
                .parse()
                .map_err(|_| TunnelError::InvalidSpec(spec.to_string()))?,
        })
    }
}
