//! Membership coordinator.
//!
//! Holds this supernode's lease, publishes its membership record, discovers
//! the other supernodes and keeps the peer registry in line with the
//! membership set as it changes.
//!
//! The watch loop re-lists the prefix before every reconciliation, so it
//! always acts on the store's current view rather than on the event payload.
//! Departures are judged against every supernode seen since the last leave
//! pass, so a node already gone from a relist taken for a join is still
//! removed when its deletion arrives.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use drift_core::config::HaConfig;
use drift_core::wire::{RecordError, SupernodeRecord};

use crate::control::ControlError;
use crate::membership::{MembershipTable, SupernodeInfo};
use crate::reconcile::{reconcile_joins, reconcile_leaves};
use crate::registry::{PeerRegistry, ProgressStore};
use crate::store::{CoordinationStore, EventKind, KeepAliveStream, LeaseId, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordination store: {0}")]
    Store(#[from] StoreError),
    #[error("membership record: {0}")]
    Record(#[from] RecordError),
    #[error("connect to supernode {pid}: {source}")]
    Connect {
        pid: String,
        #[source]
        source: ControlError,
    },
    #[error("no lease held")]
    NoLease,
    #[error("membership watch closed")]
    WatchClosed,
    #[error("cancelled")]
    Cancelled,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

struct HeldLease {
    id: LeaseId,
    stop: CancellationToken,
    drain: JoinHandle<()>,
}

impl HeldLease {
    async fn stop_drain(self) -> LeaseId {
        self.stop.cancel();
        if let Err(e) = self.drain.await {
            tracing::warn!(lease = self.id, error = %e, "keep-alive drain task failed");
        }
        self.id
    }
}

pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    table: Arc<MembershipTable>,
    peers: Arc<dyn PeerRegistry>,
    progress: Arc<dyn ProgressStore>,
    prefix: String,
    strict_connect: bool,
    lease: Mutex<Option<HeldLease>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        table: Arc<MembershipTable>,
        peers: Arc<dyn PeerRegistry>,
        progress: Arc<dyn ProgressStore>,
        ha: &HaConfig,
    ) -> Self {
        Self {
            store,
            table,
            peers,
            progress,
            prefix: ha.key_prefix.clone(),
            strict_connect: ha.strict_connect,
            lease: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn lease_id(&self) -> Option<LeaseId> {
        self.lease.lock().await.as_ref().map(|l| l.id)
    }

    // ── Lease ─────────────────────────────────────────────────────────────────

    /// Publish `record` under a fresh lease and keep the lease alive.
    ///
    /// Nothing is granted for a record that does not encode, and nothing is
    /// renewed if the grant or the write fails.
    pub async fn publish(&self, record: &SupernodeRecord, ttl_secs: i64) -> CoordinatorResult<LeaseId> {
        let value = record.encode()?;
        let lease = self.store.grant(ttl_secs).await?;
        let key = record.key(&self.prefix);
        self.store.put(&key, &value, Some(lease)).await?;
        let acks = self.store.keep_alive(lease).await?;

        let stop = CancellationToken::new();
        let drain = tokio::spawn(drain_keep_alive(lease, acks, stop.clone()));

        let previous = self.lease.lock().await.replace(HeldLease { id: lease, stop, drain });
        if let Some(old) = previous {
            let old_id = old.stop_drain().await;
            tracing::warn!(lease = old_id, "replaced a held lease without revoking it");
        }
        tracing::info!(key = %key, lease, ttl_secs, "published membership record");
        Ok(lease)
    }

    /// Revoke the held lease. The membership record disappears with it.
    pub async fn release_lease(&self) -> CoordinatorResult<()> {
        let held = self.lease.lock().await.take().ok_or(CoordinatorError::NoLease)?;
        let id = held.stop_drain().await;
        self.store.revoke(id).await?;
        tracing::info!(lease = id, "lease revoked");
        Ok(())
    }

    /// Stop renewing and close the store client.
    pub async fn shutdown(&self) -> CoordinatorResult<()> {
        if let Some(held) = self.lease.lock().await.take() {
            held.stop_drain().await;
        }
        self.store.close().await?;
        tracing::info!("coordinator shut down");
        Ok(())
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// List the other supernodes and install them in the membership table.
    ///
    /// Records that fail to decode are skipped. In strict mode every listed
    /// supernode is dialed and the first failure fails the call, leaving the
    /// table untouched.
    pub async fn list_peers(&self, cancel: &CancellationToken) -> CoordinatorResult<Vec<SupernodeInfo>> {
        let kvs = tokio::select! {
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
            r = self.store.get_prefix(&self.prefix) => r?,
        };

        let local = self.table.local_pid();
        let mut records = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match SupernodeRecord::decode(&kv.value) {
                Ok(r) if r.pid == local => {}
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "skipping bad membership record"),
            }
        }

        let infos = self.table.resolve(records).await;
        if self.strict_connect {
            for info in &infos {
                let dialed = tokio::select! {
                    _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                    r = info.control.ensure_connected() => r,
                };
                dialed.map_err(|source| CoordinatorError::Connect {
                    pid: info.pid().to_string(),
                    source,
                })?;
            }
        }
        self.table.install(infos.clone()).await;
        Ok(infos)
    }

    // ── Watch ─────────────────────────────────────────────────────────────────

    /// Follow membership changes until the stream ends, a re-list fails or
    /// `cancel` fires. Never returns `Ok`.
    pub async fn watch_membership(&self, cancel: &CancellationToken) -> CoordinatorResult<()> {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
            r = self.store.watch(&self.prefix) => r?,
        };

        let mut current = self.list_peers(cancel).await?;
        let mut seen = current.clone();
        let local = self.table.local_pid();
        let joined = reconcile_joins(self.peers.as_ref(), local, &current).await;
        tracing::info!(
            supernodes = current.len(),
            registered = joined.registered.len(),
            "membership watch started"
        );

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                b = events.recv() => b,
            };
            let Some(batch) = batch else {
                tracing::warn!(prefix = %self.prefix, "membership watch stream closed");
                return Err(CoordinatorError::WatchClosed);
            };

            for event in batch.events {
                tracing::info!(kind = ?event.kind, key = %event.key, revision = event.revision, "membership change");
                current = self.list_peers(cancel).await?;
                match event.kind {
                    EventKind::Put => {
                        reconcile_joins(self.peers.as_ref(), local, &current).await;
                        merge_seen(&mut seen, &current);
                    }
                    EventKind::Delete => {
                        reconcile_leaves(
                            self.peers.as_ref(),
                            self.progress.as_ref(),
                            &seen,
                            &current,
                        )
                        .await;
                        seen = current.clone();
                    }
                    EventKind::Unknown(kind) => {
                        tracing::warn!(kind, "ignoring unknown membership event");
                    }
                }
            }
        }
    }
}

/// Add the supernodes of `current` that `seen` does not hold yet.
fn merge_seen(seen: &mut Vec<SupernodeInfo>, current: &[SupernodeInfo]) {
    for info in current {
        if !seen.iter().any(|s| s.pid() == info.pid()) {
            seen.push(info.clone());
        }
    }
}

/// Consume keep-alive acknowledgements until stopped or the stream ends.
async fn drain_keep_alive(lease: LeaseId, mut acks: KeepAliveStream, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            ack = acks.recv() => match ack {
                Some(ack) => tracing::trace!(lease = ack.lease, ttl_secs = ack.ttl_secs, "lease renewed"),
                None => {
                    tracing::warn!(lease, "keep-alive stream ended, lease will expire");
                    break;
                }
            },
        }
    }
}
