//! HTTP router and handlers for the resource API.
//!
//! Every handler turns its lease-manager result into a newline-terminated
//! JSON record with a `Status` field; errors become `FAIL` records instead
//! of HTTP error codes, so shell clients can parse one line per request
//! regardless of outcome. Handlers only ever hold the lease table lock for
//! the instant of the operation itself; a worker's command execution for
//! one owner never blocks a request for another.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tapnet_core::{CoreError, Lease, LeaseManager};
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct AllocateRecord<'a> {
    #[serde(rename = "Tap")]
    tap: &'a str,
    #[serde(rename = "Ip")]
    ip: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "ServerPort")]
    server_port: u16,
    #[serde(rename = "Status")]
    status: &'static str,
}

#[derive(Serialize)]
struct StatusRecord {
    #[serde(rename = "Status")]
    status: &'static str,
}

#[derive(Serialize)]
struct FailRecord {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Reason")]
    reason: String,
}

#[derive(Serialize)]
struct PortRecord {
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Status")]
    status: &'static str,
}

#[derive(Serialize)]
struct IpRecord {
    #[serde(rename = "Ip")]
    ip: String,
    #[serde(rename = "Status")]
    status: &'static str,
}

#[derive(Serialize)]
struct ListRecord<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Tap")]
    tap: &'a str,
    #[serde(rename = "Ip")]
    ip: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Status")]
    status: &'static str,
}

/// Serialize one record as a single JSON text line.
fn record<T: Serialize>(value: &T) -> String {
    // Serialization of these plain records cannot fail.
    let mut line = serde_json::to_string(value).unwrap_or_default();
    line.push('\n');
    line
}

/// Map a lease error to the wire `Reason`.
fn fail(err: &CoreError) -> String {
    let reason = match err {
        CoreError::ResourceExhausted(_) => "Full".to_string(),
        CoreError::NotFound(_) => "Not found".to_string(),
        other => other.to_string(),
    };
    record(&FailRecord {
        status: "FAIL",
        reason,
    })
}

fn allocate_record(manager: &LeaseManager, lease: &Lease) -> String {
    let slot = manager.slot(lease.slot_index);
    record(&AllocateRecord {
        tap: &slot.device_name,
        ip: slot.address.to_string(),
        port: slot.primary_port,
        // Zero until the worker has announced its port.
        server_port: lease.server_port.unwrap_or(0),
        status: "OK",
    })
}

async fn allocate(State(manager): State<LeaseManager>, Path(name): Path<String>) -> Response {
    tracing::debug!(name, "allocate request");
    match manager.allocate(&name).await {
        Ok(lease) => allocate_record(&manager, &lease).into_response(),
        Err(err) => fail(&err).into_response(),
    }
}

async fn remove(State(manager): State<LeaseManager>, Path(name): Path<String>) -> Response {
    tracing::debug!(name, "remove request");
    match manager.release(&name).await {
        Ok(()) => record(&StatusRecord { status: "OK" }).into_response(),
        Err(err) => fail(&err).into_response(),
    }
}

async fn port(State(manager): State<LeaseManager>, Path(name): Path<String>) -> Response {
    tracing::debug!(name, "port request");
    match manager.lookup(&name).await {
        Ok(lease) => record(&PortRecord {
            port: manager.slot(lease.slot_index).primary_port,
            status: "OK",
        })
        .into_response(),
        Err(err) => fail(&err).into_response(),
    }
}

async fn ip(State(manager): State<LeaseManager>, Path(name): Path<String>) -> Response {
    tracing::debug!(name, "ip request");
    match manager.lookup(&name).await {
        Ok(lease) => record(&IpRecord {
            ip: manager.slot(lease.slot_index).address.to_string(),
            status: "OK",
        })
        .into_response(),
        Err(err) => fail(&err).into_response(),
    }
}

async fn list(State(manager): State<LeaseManager>) -> Response {
    let leases = manager.list().await;
    tracing::debug!(count = leases.len(), "list request");
    let mut body = String::new();
    for lease in &leases {
        let slot = manager.slot(lease.slot_index);
        body.push_str(&record(&ListRecord {
            name: &lease.owner,
            tap: &slot.device_name,
            ip: slot.address.to_string(),
            port: slot.primary_port,
            status: "OK",
        }));
    }
    body.into_response()
}

async fn health() -> Response {
    record(&StatusRecord { status: "OK" }).into_response()
}

/// Build the API router over a lease manager.
pub fn build_router(manager: LeaseManager) -> Router {
    Router::new()
        .route("/allocate/:name", get(allocate))
        .route("/remove/:name", get(remove))
        .route("/port/:name", get(port))
        .route("/ip/:name", get(ip))
        .route("/list", get(list))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use tapnet_core::CoreConfig;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_router(dir: &TempDir, allowed_slots: usize) -> Router {
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut config = CoreConfig::default();
        config.pool.worker_binary = script;
        config.pool.allowed_slots = allowed_slots;
        config.action.dry_run = true;
        config.action.echo = false;
        build_router(LeaseManager::new(config).unwrap())
    }

    async fn get_body(router: &Router, uri: &str) -> String {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir, 1);
        assert_eq!(get_body(&router, "/health").await, "{\"Status\":\"OK\"}\n");
    }

    #[tokio::test]
    async fn test_allocate_and_query() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir, 2);

        let body = get_body(&router, "/allocate/sig1_0").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Status"], "OK");
        assert_eq!(value["Tap"], "tap0");
        assert_eq!(value["Ip"], "10.0.1.136");
        assert_eq!(value["Port"], 50025);
        assert_eq!(value["ServerPort"], 0);

        let body = get_body(&router, "/port/sig1_0").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Port"], 50025);

        let body = get_body(&router, "/ip/sig1_0").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Ip"], "10.0.1.136");

        let body = get_body(&router, "/list").await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["Name"], "sig1_0");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_full() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir, 1);

        get_body(&router, "/allocate/a").await;
        let body = get_body(&router, "/allocate/b").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Status"], "FAIL");
        assert_eq!(value["Reason"], "Full");
    }

    #[tokio::test]
    async fn test_remove_and_not_found() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir, 1);

        get_body(&router, "/allocate/a").await;
        assert_eq!(get_body(&router, "/remove/a").await, "{\"Status\":\"OK\"}\n");

        let body = get_body(&router, "/remove/a").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Status"], "FAIL");
        assert_eq!(value["Reason"], "Not found");

        let body = get_body(&router, "/port/a").await;
        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["Status"], "FAIL");
    }
}
