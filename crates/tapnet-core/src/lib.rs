//! # tapnet-core
//!
//! Lease management for a fixed pool of TAP network interfaces.
//!
//! This crate owns the core of tapnet: a deterministic table of slot
//! descriptors (device name, IPv4 address, primary port), a concurrency-safe
//! lease manager that binds each slot to a named owner and a supervised
//! worker process, and a pattern/template action engine that extracts the
//! worker's dynamically chosen listening port from its output stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LeaseManager                       │
//! ├─────────────────────────────────────────────────────────┤
//! │                                                         │
//! │  ┌────────────┐    ┌───────────────────────────────┐    │
//! │  │ SlotTable  │    │  Mutex<Vec<Option<Entry>>>    │    │
//! │  │ (immutable)│    │  owner / status / ports       │    │
//! │  └────────────┘    └───────────────────────────────┘    │
//! │        │                        ▲                       │
//! │        ▼                        │ set_secondary_port    │
//! │  ┌────────────┐   stdout   ┌────────────┐               │
//! │  │  worker    │───────────▶│ ActionWatch│               │
//! │  │  process   │            │ (per lease)│               │
//! │  └────────────┘            └────────────┘               │
//! │        │ exit                                           │
//! │        ▼                                                │
//! │  ┌────────────┐  exactly one of {supervisor, release}   │
//! │  │ supervisor │  frees the slot                         │
//! │  └────────────┘                                         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutation of the lease set goes through a single mutex; the per-lease
//! watch and supervisor tasks reach the table through the same path.

mod action;
mod config;
mod error;
mod manager;
mod slots;
mod worker;

pub use action::{watch, ActionTemplate, ExecOutput, ExecSink, MatchOutput, MatchSink};
pub use config::{ActionConfig, CoreConfig, PoolConfig};
pub use error::{CoreError, Result};
pub use manager::{Lease, LeaseManager, LeaseStatus};
pub use slots::{Slot, SlotTable};
