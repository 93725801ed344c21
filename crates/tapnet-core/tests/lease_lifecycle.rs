//! Lease lifecycle tests against stub worker processes.
//!
//! Workers are small shell scripts generated per test: one announces a
//! server port and sleeps, one exits immediately to simulate a crash.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tapnet_core::{CoreConfig, CoreError, LeaseManager};
use tempfile::TempDir;

/// Write an executable stub worker script into `dir`.
fn stub_worker(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn manager_with(dir: &TempDir, script: &str, allowed_slots: usize) -> LeaseManager {
    let mut config = CoreConfig::default();
    config.pool.worker_binary = stub_worker(dir, script);
    config.pool.allowed_slots = allowed_slots;
    config.pool.terminate_timeout_secs = 2;
    config.action.dry_run = true;
    config.action.echo = false;
    LeaseManager::new(config).unwrap()
}

const SLEEPER: &str = "exec sleep 30";
const ANNOUNCER: &str = "echo \"server listening at port 4512\"\nexec sleep 30";
const CRASHER: &str = "exit 0";

/// Poll `f` until it returns `Some` or the deadline passes.
async fn poll_until<T, F, Fut>(timeout: Duration, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f().await {
            return Some(v);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn allocate_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 4);

    let first = manager.allocate("sig1_0").await.unwrap();
    let second = manager.allocate("sig1_0").await.unwrap();

    assert_eq!(first.slot_index, second.slot_index);
    assert_eq!(first.lease_id, second.lease_id);
    assert_eq!(manager.list().await.len(), 1);

    manager.release_all().await;
}

#[tokio::test]
async fn pool_bound_is_enforced() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 2);

    let a = manager.allocate("a").await.unwrap();
    let b = manager.allocate("b").await.unwrap();
    assert_ne!(a.slot_index, b.slot_index);

    let err = manager.allocate("c").await.unwrap_err();
    assert!(err.is_exhausted());

    let leases = manager.list().await;
    assert_eq!(leases.len(), 2);

    manager.release_all().await;
}

#[tokio::test]
async fn release_frees_the_slot_for_reuse() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 1);

    let a = manager.allocate("a").await.unwrap();
    manager.release("a").await.unwrap();
    assert!(manager.lookup("a").await.unwrap_err().is_not_found());

    // The single slot is immediately allocatable again.
    let b = manager.allocate("b").await.unwrap();
    assert_eq!(b.slot_index, a.slot_index);
    assert_ne!(b.lease_id, a.lease_id);

    manager.release_all().await;
}

#[tokio::test]
async fn reallocation_never_collides_with_a_live_lease() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 2);

    manager.allocate("a").await.unwrap();
    let b = manager.allocate("b").await.unwrap();
    manager.release("a").await.unwrap();

    let c = manager.allocate("c").await.unwrap();
    assert_ne!(c.slot_index, b.slot_index);

    manager.release_all().await;
}

#[tokio::test]
async fn crashed_worker_frees_its_slot_without_release() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, CRASHER, 1);

    manager.allocate("a").await.unwrap();

    // The supervisor notices the exit and frees the slot on its own.
    let freed = poll_until(Duration::from_secs(5), || async {
        manager.lookup("a").await.err().map(|_| ())
    })
    .await;
    assert!(freed.is_some(), "slot was not freed after worker exit");

    // And the slot is allocatable again.
    manager.allocate("b").await.unwrap();
}

#[tokio::test]
async fn announced_server_port_reaches_the_lease() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, ANNOUNCER, 1);

    let lease = manager.allocate("a").await.unwrap();
    // The port arrives asynchronously; the first snapshot may not have it.
    let port = poll_until(Duration::from_secs(5), || async {
        manager.lookup("a").await.ok().and_then(|l| l.server_port)
    })
    .await;

    assert_eq!(port, Some(4512));
    assert_eq!(lease.server_port, None);

    manager.release_all().await;
}

#[tokio::test]
async fn release_terminates_a_hanging_worker() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 1);

    manager.allocate("a").await.unwrap();
    let started = Instant::now();
    manager.release("a").await.unwrap();

    // Killed, not waited out for the full 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn random_interleaving_never_exceeds_the_pool() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 3);

    // Alternate allocate/release across more owners than slots and check
    // the invariants after every step.
    let owners = ["a", "b", "c", "d", "e"];
    for round in 0..4usize {
        for (i, owner) in owners.iter().enumerate() {
            let result = manager.allocate(owner).await;
            if let Err(e) = &result {
                assert!(e.is_exhausted(), "unexpected error: {e}");
            }
            if (round + i) % 2 == 0 {
                let _ = manager.release(owner).await;
            }

            let leases = manager.list().await;
            assert!(leases.len() <= 3);
            let mut indices: Vec<_> = leases.iter().map(|l| l.slot_index).collect();
            indices.sort_unstable();
            indices.dedup();
            assert_eq!(indices.len(), leases.len(), "slot index shared");
        }
    }

    manager.release_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_the_pool() {
    const OWNERS: [&str; 5] = ["a", "b", "c", "d", "e"];
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, SLEEPER, 3);

    // Four tasks hammer overlapping owner names in parallel; the table
    // invariants must hold in every snapshot any of them takes.
    let mut tasks = Vec::new();
    for task in 0..4usize {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..6usize {
                let owner = OWNERS[(task + round) % OWNERS.len()];
                if let Err(e) = manager.allocate(owner).await {
                    assert!(e.is_exhausted(), "unexpected allocate error: {e}");
                }
                if (task + round) % 2 == 0 {
                    if let Err(e) = manager.release(owner).await {
                        // Another task may have released (or be releasing)
                        // the same owner first.
                        assert!(e.is_not_found(), "unexpected release error: {e}");
                    }
                }

                let leases = manager.list().await;
                assert!(leases.len() <= 3, "pool bound exceeded: {}", leases.len());
                let mut indices: Vec<_> = leases.iter().map(|l| l.slot_index).collect();
                indices.sort_unstable();
                indices.dedup();
                assert_eq!(indices.len(), leases.len(), "slot index shared");
                let mut names: Vec<_> = leases.iter().map(|l| l.owner.as_str()).collect();
                names.sort_unstable();
                names.dedup();
                assert_eq!(names.len(), leases.len(), "owner holds two leases");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    manager.release_all().await;
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn worker_start_failure_is_reported_and_rolled_back() {
    let mut config = CoreConfig::default();
    config.pool.worker_binary = PathBuf::from("/nonexistent/tapdaemon");
    config.pool.allowed_slots = 1;
    config.action.dry_run = true;
    let manager = LeaseManager::new(config).unwrap();

    let err = manager.allocate("a").await.unwrap_err();
    assert!(matches!(err, CoreError::WorkerStartFailed(_)));
    assert!(manager.list().await.is_empty());
}
