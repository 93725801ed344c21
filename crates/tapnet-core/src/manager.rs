//! Lease manager: binds slots to owners and supervises their workers.
//!
//! All mutation of the lease set goes through one mutex-guarded table.
//! The per-lease supervisor task and the action engine reach the table
//! through the same lock, so watchers, handlers, and explicit releases
//! can never race on a slot.

use crate::action::{self, ActionTemplate, ExecOutput, ExecSink};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::slots::{Slot, SlotTable};
use crate::worker;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Current state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Created, worker not yet started.
    Pending,
    /// Worker running; the server port may still be unknown.
    Active,
    /// Release in progress; the slot is not yet reusable.
    Releasing,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Releasing => write!(f, "releasing"),
        }
    }
}

/// The binding of one slot to one owner.
///
/// `server_port` is discovered asynchronously from the worker's output;
/// readers must tolerate `None` and poll [`LeaseManager::lookup`] until the
/// worker has announced it.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Opaque client-supplied name, unique among live leases.
    pub owner: String,
    /// Index into the slot table.
    pub slot_index: usize,
    /// Generation counter distinguishing reuses of the same slot.
    pub lease_id: u64,
    /// Lifecycle state.
    pub status: LeaseStatus,
    /// Port the worker chose at runtime, once announced.
    pub server_port: Option<u16>,
    /// When the lease was allocated.
    pub created_at: DateTime<Utc>,
}

struct Entry {
    lease: Lease,
    /// Request channel to the supervisor task owning the child process.
    /// Sending an ack channel asks it to kill the worker and confirm exit.
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
}

struct Inner {
    config: CoreConfig,
    slots: SlotTable,
    template: ActionTemplate,
    /// One entry per physical slot, `None` when free.
    state: Mutex<Vec<Option<Entry>>>,
    next_lease_id: AtomicU64,
}

/// Manages the slot pool and all active leases.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    /// Build a manager from configuration.
    ///
    /// Derives the slot table and compiles the action pattern/template;
    /// both fail with [`CoreError::ConfigurationFatal`]-class errors that
    /// callers treat as fatal at startup.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let slots = SlotTable::new(&config.pool)?;
        let template = ActionTemplate::new(&config.action.pattern, &config.action.template)?;

        tracing::info!(
            allowed = config.pool.allowed_slots,
            worker = %config.pool.worker_binary.display(),
            "Lease manager ready"
        );

        let state = (0..slots.len()).map(|_| None).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                slots,
                template,
                state: Mutex::new(state),
                next_lease_id: AtomicU64::new(1),
            }),
        })
    }

    /// Slot descriptor by index. The table is immutable, so this needs no
    /// lock.
    pub fn slot(&self, index: usize) -> &Slot {
        self.inner.slots.get(index)
    }

    /// Number of slots clients may lease.
    pub fn allowed_slots(&self) -> usize {
        self.inner.config.pool.allowed_slots.min(self.inner.slots.len())
    }

    /// Allocate a slot for `owner`, starting its worker.
    ///
    /// Idempotent: if `owner` already holds a lease, that lease is
    /// returned unchanged. Otherwise the first free slot in index order is
    /// bound. The returned snapshot may not yet carry the server port.
    ///
    /// # Errors
    ///
    /// [`CoreError::ResourceExhausted`] when every allowed slot is in use;
    /// [`CoreError::WorkerStartFailed`] when the worker cannot be spawned,
    /// in which case the slot stays free.
    pub async fn allocate(&self, owner: &str) -> Result<Lease> {
        let mut state = self.inner.state.lock().await;

        if let Some(entry) = state.iter().flatten().find(|e| e.lease.owner == owner) {
            tracing::debug!(owner, slot = entry.lease.slot_index, "Re-allocation, returning existing lease");
            return Ok(entry.lease.clone());
        }

        let allowed = self.allowed_slots();
        let index = (0..allowed)
            .find(|&i| state[i].is_none())
            .ok_or(CoreError::ResourceExhausted(allowed))?;
        let slot = self.inner.slots.get(index);

        let mut lease = Lease {
            owner: owner.to_string(),
            slot_index: index,
            lease_id: self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed),
            status: LeaseStatus::Pending,
            server_port: None,
            created_at: Utc::now(),
        };

        // Nothing was registered yet, so a spawn failure leaves the slot
        // free with no partially allocated lease visible.
        let (child, stdout) = worker::spawn(
            &self.inner.config.pool.worker_binary,
            &slot.device_name,
            slot.primary_port,
        )?;
        lease.status = LeaseStatus::Active;

        let (kill_tx, kill_rx) = mpsc::channel(1);
        state[index] = Some(Entry {
            lease: lease.clone(),
            kill_tx,
        });
        drop(state);

        self.spawn_supervisor(lease.lease_id, child, kill_rx);
        self.spawn_watcher(lease.lease_id, stdout);

        tracing::info!(
            owner,
            slot = index,
            device = %slot.device_name,
            ip = %slot.address,
            port = slot.primary_port,
            "Lease allocated"
        );
        Ok(lease)
    }

    /// Snapshot of the lease held by `owner`.
    pub async fn lookup(&self, owner: &str) -> Result<Lease> {
        let state = self.inner.state.lock().await;
        state
            .iter()
            .flatten()
            .find(|e| e.lease.owner == owner)
            .map(|e| e.lease.clone())
            .ok_or_else(|| CoreError::NotFound(owner.to_string()))
    }

    /// Snapshot of every live lease, in slot index order.
    pub async fn list(&self) -> Vec<Lease> {
        let state = self.inner.state.lock().await;
        state.iter().flatten().map(|e| e.lease.clone()).collect()
    }

    /// Release `owner`'s lease: kill the worker, wait for it to exit
    /// (bounded by the configured termination timeout), free the slot.
    ///
    /// The table lock is not held across the wait, so other owners'
    /// requests keep flowing while a worker shuts down.
    pub async fn release(&self, owner: &str) -> Result<()> {
        let (lease_id, slot_index, kill_tx) = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .iter_mut()
                .flatten()
                .find(|e| e.lease.owner == owner)
                .ok_or_else(|| CoreError::NotFound(owner.to_string()))?;
            if entry.lease.status == LeaseStatus::Releasing {
                // Another release already owns the teardown.
                return Err(CoreError::NotFound(owner.to_string()));
            }
            entry.lease.status = LeaseStatus::Releasing;
            (
                entry.lease.lease_id,
                entry.lease.slot_index,
                entry.kill_tx.clone(),
            )
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).await.is_ok() {
            // Supervisor confirms once the worker is gone (or the
            // termination timeout elapsed; the slot is reclaimed either
            // way and the stray process is reaped on handle drop).
            let _ = ack_rx.await;
        }

        let mut state = self.inner.state.lock().await;
        if state[slot_index]
            .as_ref()
            .is_some_and(|e| e.lease.lease_id == lease_id)
        {
            state[slot_index] = None;
        }
        tracing::info!(owner, slot = slot_index, "Lease released");
        Ok(())
    }

    /// Release every live lease. Used on server shutdown.
    pub async fn release_all(&self) {
        let owners: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .iter()
                .flatten()
                .map(|e| e.lease.owner.clone())
                .collect()
        };
        for owner in owners {
            if let Err(e) = self.release(&owner).await {
                tracing::debug!(owner = %owner, error = %e, "Release during shutdown");
            }
        }
    }

    /// Record the server port the worker announced. Called by the action
    /// engine; takes the same lock as every other mutation.
    pub async fn set_secondary_port(&self, lease_id: u64, port: u16) {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state
            .iter_mut()
            .flatten()
            .find(|e| e.lease.lease_id == lease_id)
        else {
            tracing::debug!(lease_id, port, "Server port announced for a lease already gone");
            return;
        };
        entry.lease.server_port = Some(port);
        tracing::info!(
            owner = %entry.lease.owner,
            slot = entry.lease.slot_index,
            server_port = port,
            "Worker announced server port"
        );
    }

    /// Free a slot whose worker exited on its own. Skipped when a release
    /// is already tearing the lease down; exactly one of the supervisor
    /// and an explicit release performs the free.
    async fn free_on_exit(&self, lease_id: u64) {
        let mut state = self.inner.state.lock().await;
        for slot in state.iter_mut() {
            let Some(entry) = slot else { continue };
            if entry.lease.lease_id != lease_id {
                continue;
            }
            if entry.lease.status == LeaseStatus::Active {
                tracing::warn!(
                    owner = %entry.lease.owner,
                    slot = entry.lease.slot_index,
                    "Worker exited unexpectedly, freeing slot"
                );
                *slot = None;
            }
            return;
        }
    }

    /// One supervisor per lease: owns the child, observes its exit, and
    /// services kill requests from `release`.
    fn spawn_supervisor(
        &self,
        lease_id: u64,
        mut child: Child,
        mut kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        let manager = self.clone();
        let timeout: Duration = self.inner.config.pool.terminate_timeout();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::debug!(lease_id, %status, "Worker exited"),
                        Err(e) => tracing::warn!(lease_id, error = %e, "Wait for worker failed"),
                    }
                    manager.free_on_exit(lease_id).await;
                }
                Some(ack) = kill_rx.recv() => {
                    worker::terminate(&mut child, timeout).await;
                    let _ = ack.send(());
                }
            }
        });
    }

    /// One action-engine watch per lease over the worker's stdout.
    fn spawn_watcher(&self, lease_id: u64, stdout: tokio::process::ChildStdout) {
        let manager = self.clone();
        let template = self.inner.template.clone();
        let action = self.inner.config.action.clone();
        tokio::spawn(async move {
            let output = match &action.log_file {
                Some(path) => ExecOutput::LogFile(path.clone()),
                None => ExecOutput::Echo,
            };
            let sink = ExecSink::new(manager, lease_id, action.dry_run, output);
            action::watch(BufReader::new(stdout), &template, action.echo, &sink).await;
        });
    }
}
