//! # tapnet-server
//!
//! HTTP resource API over the tapnet lease manager.
//!
//! Requests map one-to-one onto lease operations:
//!
//! - `GET /allocate/:name`: lease a slot (idempotent per name)
//! - `GET /remove/:name`: release a lease
//! - `GET /port/:name`, `GET /ip/:name`: query one lease field
//! - `GET /list`: one record per active lease
//! - `GET /health`: liveness probe
//!
//! Responses are newline-terminated JSON records with a `Status` field of
//! `OK` or `FAIL` (plus a `Reason` on failure), one record per line.

pub mod config;
pub mod http;

pub use config::ServerConfig;
pub use http::build_router;
