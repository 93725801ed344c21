//! Configuration for the lease manager core.
//!
//! Deserialized from the `[pool]` and `[action]` sections of the server's
//! TOML configuration file. Every field has a default so a minimal file
//! (or none at all) yields a working single-slot manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Physical size of the slot table. The configured `allowed_slots` may
/// only ever be a subset of this.
pub const MAX_SLOTS: usize = 256;

/// Core configuration: slot derivation, worker binary, action engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Slot pool sizing and address derivation.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Output-stream pattern matching and command execution.
    #[serde(default)]
    pub action: ActionConfig,
}

/// Slot pool sizing and addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Base name for TAP devices; slot i is named `{device_base}{start_offset + i}`.
    #[serde(default = "default_device_base")]
    pub device_base: String,

    /// Offset added to the slot index when deriving the device name.
    #[serde(default)]
    pub start_offset: usize,

    /// IPv4 address of slot 0. Must parse as four octets; fatal otherwise.
    #[serde(default = "default_base_address")]
    pub base_address: String,

    /// Address increment per slot index.
    #[serde(default = "default_address_step")]
    pub address_step: u32,

    /// Primary port of slot 0; slot i gets `base_port + i`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of slots clients may actually lease (subset of [`MAX_SLOTS`]).
    #[serde(default = "default_allowed_slots")]
    pub allowed_slots: usize,

    /// Worker binary started per lease as `worker <device> <port>`.
    #[serde(default = "default_worker_binary")]
    pub worker_binary: PathBuf,

    /// How long `release` waits for a killed worker to exit before giving
    /// up on the wait (the lease is removed either way).
    #[serde(default = "default_terminate_timeout_secs")]
    pub terminate_timeout_secs: u64,
}

fn default_device_base() -> String {
    "tap".to_string()
}

fn default_base_address() -> String {
    "10.0.1.136".to_string()
}

fn default_address_step() -> u32 {
    4
}

fn default_base_port() -> u16 {
    50025
}

fn default_allowed_slots() -> usize {
    1
}

fn default_worker_binary() -> PathBuf {
    PathBuf::from("./tapdaemon")
}

fn default_terminate_timeout_secs() -> u64 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_base: default_device_base(),
            start_offset: 0,
            base_address: default_base_address(),
            address_step: default_address_step(),
            base_port: default_base_port(),
            allowed_slots: default_allowed_slots(),
            worker_binary: default_worker_binary(),
            terminate_timeout_secs: default_terminate_timeout_secs(),
        }
    }
}

impl PoolConfig {
    /// Termination timeout as a [`Duration`].
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Action engine configuration.
///
/// The worker announces its dynamically chosen server port via a line on
/// stdout; `pattern` extracts it and `template` turns the captures into a
/// command string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Regex with named capture groups matched against each output line.
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Command template; each `<group>` is replaced by its captured value.
    #[serde(default = "default_template")]
    pub template: String,

    /// When set, the substituted command is logged but never executed.
    #[serde(default)]
    pub dry_run: bool,

    /// Echo non-matching worker output lines.
    #[serde(default = "default_echo")]
    pub echo: bool,

    /// Append executed-command stdout to this file instead of discarding it.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_pattern() -> String {
    r"server listening at port (?P<port>\d+)".to_string()
}

fn default_template() -> String {
    "<port>".to_string()
}

fn default_echo() -> bool {
    true
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            template: default_template(),
            dry_run: false,
            echo: default_echo(),
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.device_base, "tap");
        assert_eq!(pool.base_port, 50025);
        assert_eq!(pool.address_step, 4);
        assert_eq!(pool.allowed_slots, 1);
        assert_eq!(pool.terminate_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_action_defaults() {
        let action = ActionConfig::default();
        assert!(action.pattern.contains("(?P<port>"));
        assert_eq!(action.template, "<port>");
        assert!(!action.dry_run);
        assert!(action.log_file.is_none());
    }

    #[test]
    fn test_minimal_toml() {
        let cfg: CoreConfig = toml::from_str(
            r#"
            [pool]
            allowed_slots = 8
            base_address = "10.1.1.4"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.allowed_slots, 8);
        assert_eq!(cfg.pool.base_address, "10.1.1.4");
        assert_eq!(cfg.pool.base_port, 50025);
    }
}
