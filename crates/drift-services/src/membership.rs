//! The supernodes this node currently knows about.
//!
//! Owned by the coordinator and shared read-only with the protocol handlers.
//! Replacement swaps the whole list under the write lock, so readers see
//! either the old list or the new one.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use drift_core::wire::SupernodeRecord;

use crate::control::{ConnectionState, ControlClient};

/// A remote supernode and its control channel.
#[derive(Debug, Clone)]
pub struct SupernodeInfo {
    pub record: SupernodeRecord,
    pub control: Arc<ControlClient>,
}

impl SupernodeInfo {
    pub fn new(record: SupernodeRecord, dial_timeout: Duration) -> Self {
        let control = Arc::new(ControlClient::new(record.control_addr(), dial_timeout));
        Self { record, control }
    }

    pub fn pid(&self) -> &str {
        &self.record.pid
    }
}

/// Row of `GET /supernodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupernodeStatus {
    pub pid: String,
    pub ip: String,
    pub hostname: String,
    pub listen_port: u16,
    pub download_port: u16,
    pub control_port: u16,
    pub connection: ConnectionState,
}

impl From<&SupernodeInfo> for SupernodeStatus {
    fn from(info: &SupernodeInfo) -> Self {
        let r = &info.record;
        Self {
            pid: r.pid.clone(),
            ip: r.ip.clone(),
            hostname: r.hostname.clone(),
            listen_port: r.listen_port,
            download_port: r.download_port,
            control_port: r.control_port,
            connection: info.control.state(),
        }
    }
}

pub struct MembershipTable {
    local_pid: String,
    dial_timeout: Duration,
    peers: RwLock<Vec<SupernodeInfo>>,
}

impl MembershipTable {
    pub fn new(local_pid: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            local_pid: local_pid.into(),
            dial_timeout,
            peers: RwLock::new(Vec::new()),
        }
    }

    pub fn local_pid(&self) -> &str {
        &self.local_pid
    }

    /// Build entries for `records` without installing them.
    ///
    /// A supernode whose PID and control address are unchanged keeps its
    /// existing control client and connection state.
    pub async fn resolve(&self, records: Vec<SupernodeRecord>) -> Vec<SupernodeInfo> {
        let peers = self.peers.read().await;
        records
            .into_iter()
            .map(|record| {
                let reused = peers.iter().find(|p| {
                    p.record.pid == record.pid && p.control.addr() == record.control_addr()
                });
                match reused {
                    Some(existing) => SupernodeInfo {
                        record,
                        control: Arc::clone(&existing.control),
                    },
                    None => SupernodeInfo::new(record, self.dial_timeout),
                }
            })
            .collect()
    }

    pub async fn install(&self, infos: Vec<SupernodeInfo>) {
        *self.peers.write().await = infos;
    }

    /// Resolve and install in one step.
    pub async fn replace(&self, records: Vec<SupernodeRecord>) -> Vec<SupernodeInfo> {
        let next = self.resolve(records).await;
        self.install(next.clone()).await;
        next
    }

    pub async fn snapshot(&self) -> Vec<SupernodeInfo> {
        self.peers.read().await.clone()
    }

    pub async fn get(&self, pid: &str) -> Option<SupernodeInfo> {
        self.peers.read().await.iter().find(|p| p.pid() == pid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn status(&self) -> Vec<SupernodeStatus> {
        self.peers.read().await.iter().map(SupernodeStatus::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: &str, control_port: u16) -> SupernodeRecord {
        SupernodeRecord {
            ip: "10.0.0.2".into(),
            listen_port: 8002,
            download_port: 8001,
            control_port,
            hostname: format!("host-{pid}"),
            pid: pid.into(),
        }
    }

    #[tokio::test]
    async fn replace_reuses_unchanged_clients() {
        let table = MembershipTable::new("local", Duration::from_secs(1));
        let first = table.replace(vec![record("p1", 8005), record("p2", 8005)]).await;
        let second = table.replace(vec![record("p1", 8005), record("p2", 9005)]).await;

        assert!(Arc::ptr_eq(&first[0].control, &second[0].control));
        assert!(!Arc::ptr_eq(&first[1].control, &second[1].control));
        assert_eq!(second[1].control.addr(), "10.0.0.2:9005");
    }

    #[tokio::test]
    async fn get_and_status() {
        let table = MembershipTable::new("local", Duration::from_secs(1));
        table.replace(vec![record("p1", 8005)]).await;

        assert!(table.get("p1").await.is_some());
        assert!(table.get("p9").await.is_none());
        let status = table.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].connection, ConnectionState::Unconnected);
        assert_eq!(table.local_pid(), "local");
    }
}
