//! Tunnel client configuration.
//!
//! Loaded from a TOML file named by the `-c` flag (default
//! `tunnels.toml`). The proxy address is the only mandatory field.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for `tunnelctl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// First local port tried by the auto verbs.
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Last local port tried by the auto verbs.
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    /// Instance number, so one host can keep several independent control
    /// connections to the same server.
    #[serde(default)]
    pub instance: u32,

    /// ssh client binary.
    #[serde(default = "default_ssh")]
    pub ssh: PathBuf,

    /// Remote endpoint settings.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// The `[proxy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address of the server carrying the control connection. Mandatory.
    #[serde(default)]
    pub address: String,

    /// Login user on the server.
    #[serde(default)]
    pub user: Option<String>,

    /// First port tried for the SOCKS listener on attach.
    #[serde(default = "default_socks_start")]
    pub socks_start: u16,

    /// Last port tried for the SOCKS listener.
    #[serde(default = "default_socks_end")]
    pub socks_end: u16,

    /// Always establish a SOCKS listener on attach, as if `-s` were given.
    #[serde(default)]
    pub socks_active: bool,
}

fn default_port_start() -> u16 {
    10000
}

fn default_port_end() -> u16 {
    65535
}

fn default_ssh() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_socks_start() -> u16 {
    1080
}

fn default_socks_end() -> u16 {
    10800
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            user: None,
            socks_start: default_socks_start(),
            socks_end: default_socks_end(),
            socks_active: false,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_start: default_port_start(),
            port_end: default_port_end(),
            instance: 0,
            ssh: default_ssh(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::ConfigurationFatal(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            TunnelError::ConfigurationFatal(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.address.is_empty() {
            return Err(TunnelError::ConfigurationFatal(
                "proxy.address is mandatory".to_string(),
            ));
        }
        if self.port_start > self.port_end {
            return Err(TunnelError::ConfigurationFatal(format!(
                "port_start {} exceeds port_end {}",
                self.port_start, self.port_end
            )));
        }
        if self.proxy.socks_start > self.proxy.socks_end {
            return Err(TunnelError::ConfigurationFatal(format!(
                "socks_start {} exceeds socks_end {}",
                self.proxy.socks_start, self.proxy.socks_end
            )));
        }
        Ok(())
    }
}
