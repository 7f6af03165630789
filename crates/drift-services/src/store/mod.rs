//! Coordination store — the lease/watch key-value store supernodes meet in.
//!
//! A supernode is alive exactly as long as its lease is. The store deletes
//! every key bound to a lease when the lease expires or is revoked, and
//! reports the deletion to watchers. That deletion is the only failure
//! signal the cluster has.
//!
//! `MemoryStore` is the store itself. Two clients talk to it:
//! `MemoryClient` in the same process, `HttpStore` from another supernode
//! through the routes drift-api mounts on the hosting node's control port.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use http::HttpStore;
pub use memory::{MemoryClient, MemoryStore};

/// Lease identifier. Never 0 for a granted lease.
pub type LeaseId = i64;

/// Store revision. Every mutation bumps it by one.
pub type Revision = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub mod_revision: Revision,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
    /// A kind this client does not know about.
    Unknown(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub revision: Revision,
}

/// One batch of events delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub events: Vec<WatchEvent>,
}

impl WatchResponse {
    /// Batch telling a watcher it missed events and must rebuild its view.
    /// Carries both kinds so joins and departures are both reconsidered.
    pub fn resync(prefix: &str, revision: Revision) -> Self {
        Self {
            events: vec![
                WatchEvent {
                    kind: EventKind::Put,
                    key: prefix.to_string(),
                    revision,
                },
                WatchEvent {
                    kind: EventKind::Delete,
                    key: prefix.to_string(),
                    revision,
                },
            ],
        }
    }
}

/// Acknowledgement of one lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    pub ttl_secs: i64,
}

/// Renewal acknowledgements. Renewal stops when this receiver is dropped.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveResponse>;

/// Change notifications. Closed when the watch ends.
pub type WatchStream = mpsc::Receiver<WatchResponse>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("invalid ttl {0}")]
    InvalidTtl(i64),
    #[error("store client closed")]
    Closed,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client view of the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Grant a lease that expires `ttl_secs` after its last renewal.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// Keep renewing `lease` until the returned stream is dropped.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Stream changes to keys under `prefix` made after this call.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;

    /// Revoke a lease, deleting its keys now.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Close this client. Its keep-alives and watches end.
    async fn close(&self) -> Result<(), StoreError>;
}
