//! Error types for the tunnel client.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur driving the control connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The verb requires an attached control connection.
    #[error("server {0} is not attached")]
    NotAttached(String),

    /// `attach` found a live control connection already in place.
    #[error("server {0} already attached")]
    AlreadyAttached(String),

    /// The transport rejected a control connection or mapping.
    #[error("transport refused: {0}")]
    TransportRefused(String),

    /// A bounded port-range search ran out of candidates.
    #[error("no port accepted in range {start}..={end}")]
    PortRangeExhausted { start: u16, end: u16 },

    /// A `local:host:remote`-shaped argument did not parse.
    #[error("invalid mapping spec: {0}")]
    InvalidSpec(String),

    /// Startup configuration cannot be used. Fatal before any verb runs.
    #[error("invalid configuration: {0}")]
    ConfigurationFatal(String),

    /// No home directory to place the control marker under.
    #[error("cannot determine home directory")]
    MissingHome,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
