//! # tapnet-tunnel
//!
//! Client side of tapnet: manages one reusable ssh control connection per
//! (server, instance) pair and the port mappings multiplexed over it.
//!
//! A control connection is represented by a filesystem marker (the ssh
//! control socket path); active mappings are persisted append-only, one
//! text line each, in a record file next to it. The record set doubles as
//! the idempotency check for `forward`/`remote` and is discarded whole on
//! `detach`.
//!
//! The transport itself is an opaque subprocess behind the
//! [`ControlTransport`] trait; tests drive the session logic with a fake.

pub mod config;
pub mod error;
pub mod records;
pub mod session;
pub mod transport;

pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use records::{ForwardSpec, RecordFile, RemoteSpec, TargetSpec, TunnelKind, TunnelRecord};
pub use session::{MappingOutcome, Session};
pub use transport::{ControlTransport, SshTransport};
