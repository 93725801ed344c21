//! Server configuration: listen address plus the embedded core sections.
//!
//! Loaded from a TOML file named by the `-c` flag. A missing file is not
//! an error; defaults produce a single-slot manager on localhost, matching
//! the smallest useful deployment.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tapnet_core::CoreConfig;
use thiserror::Error;

/// Errors loading the server configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Full configuration for `tapnetd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Pool sizing, addressing and action engine sections.
    #[serde(flatten)]
    pub core: CoreConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 18080))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 18080);
        assert_eq!(config.core.pool.allowed_slots, 1);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/tapnet.toml")).unwrap();
        assert_eq!(config.listen.port(), 18080);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapnet.toml");
        std::fs::write(
            &path,
            r#"
            listen = "0.0.0.0:9000"

            [pool]
            device_base = "tap"
            allowed_slots = 16
            base_address = "10.1.1.4"

            [action]
            dry_run = true
            "#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.core.pool.allowed_slots, 16);
        assert!(config.core.action.dry_run);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapnet.toml");
        std::fs::write(&path, "listen = 42").unwrap();
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
