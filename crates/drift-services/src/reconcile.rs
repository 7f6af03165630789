//! Peer reconciliation on membership change.
//!
//! Supernodes in the membership set are mirrored into the peer registry so
//! that clients can fetch pieces from them. Identity is the PID and nothing
//! else. Failures are per entry: they are logged and the rest of the set is
//! still processed.

use drift_core::types::PeerCreateRequest;

use crate::membership::SupernodeInfo;
use crate::registry::{PeerRegistry, ProgressStore};

/// What one join pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinSummary {
    pub registered: Vec<String>,
    pub skipped: usize,
    pub failed: usize,
}

/// What one leave pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LeaveSummary {
    pub departed: Vec<String>,
    pub failed: usize,
}

fn peer_request(info: &SupernodeInfo) -> PeerCreateRequest {
    PeerCreateRequest {
        ip: info.record.ip.clone(),
        host_name: info.record.hostname.clone(),
        port: i32::from(info.record.download_port),
        version: String::new(),
        peer_id: Some(info.record.pid.clone()),
    }
}

/// Register every supernode in `current` that the peer registry lacks.
pub async fn reconcile_joins(
    peers: &dyn PeerRegistry,
    local_pid: &str,
    current: &[SupernodeInfo],
) -> JoinSummary {
    let mut summary = JoinSummary::default();
    for info in current {
        let pid = info.pid();
        if pid.is_empty() {
            tracing::warn!(ip = %info.record.ip, "supernode record without pid, skipping");
            summary.skipped += 1;
            continue;
        }
        if pid == local_pid {
            summary.skipped += 1;
            continue;
        }
        match peers.get(pid).await {
            Ok(Some(_)) => {
                summary.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = %pid, error = %e, "peer lookup failed, registering anyway");
            }
        }
        match peers.register(peer_request(info)).await {
            Ok(resp) => {
                tracing::info!(pid = %resp.id, addr = %info.record, "registered supernode as peer");
                summary.registered.push(resp.id);
            }
            Err(e) => {
                tracing::error!(pid = %pid, error = %e, "failed to register supernode as peer");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Remove every supernode in `previous` that is missing from `current`.
///
/// Progress state goes first, then the peer record. Both are best-effort.
pub async fn reconcile_leaves(
    peers: &dyn PeerRegistry,
    progress: &dyn ProgressStore,
    previous: &[SupernodeInfo],
    current: &[SupernodeInfo],
) -> LeaveSummary {
    let mut summary = LeaveSummary::default();
    for gone in previous
        .iter()
        .filter(|p| !current.iter().any(|c| c.pid() == p.pid()))
    {
        let pid = gone.pid();
        let mut ok = true;
        if let Err(e) = progress.delete_peer_state(pid).await {
            tracing::warn!(pid = %pid, error = %e, "failed to delete progress of departed supernode");
            ok = false;
        }
        if let Err(e) = peers.deregister(pid).await {
            tracing::warn!(pid = %pid, error = %e, "failed to deregister departed supernode");
            ok = false;
        }
        tracing::info!(pid = %pid, "supernode departed");
        summary.departed.push(pid.to_string());
        if !ok {
            summary.failed += 1;
        }
    }
    summary
}
