//! In-process coordination store.
//!
//! Revisioned key space, lease table, and a bounded event log. A sweeper
//! task expires leases whose deadline passed and deletes their keys.
//! Watchers are fed from a broadcast channel; a watcher that falls behind
//! gets a resync batch instead of the events it missed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    CoordinationStore, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId,
    Revision, StoreError, WatchEvent, WatchResponse, WatchStream,
};

/// Events kept for long-polling watchers.
const EVENT_LOG_CAPACITY: usize = 1024;

/// How often expired leases are swept.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Floor for the keep-alive renewal period.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(100);

/// Stand-in for poll timeouts too long to express as a deadline.
const LONGEST_POLL: Duration = Duration::from_secs(3600);

/// Longest lease TTL granted, in seconds.
pub const MAX_TTL_SECS: i64 = 9_000_000_000;

/// Deadline for a lease renewed now, or `InvalidTtl` if `ttl_secs` is out of range.
fn lease_deadline(ttl_secs: i64) -> Result<Instant, StoreError> {
    if !(1..=MAX_TTL_SECS).contains(&ttl_secs) {
        return Err(StoreError::InvalidTtl(ttl_secs));
    }
    Instant::now()
        .checked_add(Duration::from_secs(ttl_secs as u64))
        .ok_or(StoreError::InvalidTtl(ttl_secs))
}

struct Lease {
    ttl_secs: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
    mod_revision: Revision,
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    last_lease: LeaseId,
    revision: Revision,
    log: VecDeque<WatchEvent>,
}

impl State {
    fn record(&mut self, kind: EventKind, key: &str) -> WatchEvent {
        self.revision += 1;
        let event = WatchEvent {
            kind,
            key: key.to_string(),
            revision: self.revision,
        };
        if self.log.len() == EVENT_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(event.clone());
        event
    }

    /// Drop a lease and every key still bound to it.
    fn remove_lease(&mut self, id: LeaseId) -> Option<Vec<WatchEvent>> {
        let lease = self.leases.remove(&id)?;
        let mut events = Vec::new();
        for key in lease.keys {
            let bound = self
                .kvs
                .get(&key)
                .map(|e| e.lease == Some(id))
                .unwrap_or(false);
            if bound {
                self.kvs.remove(&key);
                events.push(self.record(EventKind::Delete, &key));
            }
        }
        Some(events)
    }

    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut events = Vec::new();
        for id in expired {
            tracing::debug!(lease = id, "lease expired");
            events.extend(self.remove_lease(id).unwrap_or_default());
        }
        events
    }

    /// Matching events after `after`, or `None` if some were already dropped from the log.
    fn events_after(&self, prefix: &str, after: Revision) -> Option<Vec<WatchEvent>> {
        if let Some(oldest) = self.log.front() {
            if oldest.revision > after.saturating_add(1) {
                return None;
            }
        }
        Some(
            self.log
                .iter()
                .filter(|e| e.revision > after && e.key.starts_with(prefix))
                .cloned()
                .collect(),
        )
    }
}

/// Result of a long-poll for watch events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPoll {
    /// Store revision when the poll returned. Pass it back as `after`.
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    /// Events after the requested revision were already discarded.
    pub compacted: bool,
}

/// The store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
    shutdown: CancellationToken,
}

impl MemoryStore {
    /// Create a store and start its lease sweeper. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_LOG_CAPACITY);
        let store = Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(sweep_loop(store.clone()));
        store
    }

    /// A client bound to this store.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            store: self.clone(),
            closed: self.shutdown.child_token(),
        }
    }

    /// Stop the sweeper and end every client's streams.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    pub async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let deadline = lease_deadline(ttl_secs)?;
        let mut state = self.state.lock().await;
        state.last_lease += 1;
        let id = state.last_lease;
        state.leases.insert(
            id,
            Lease {
                ttl_secs,
                deadline,
                keys: HashSet::new(),
            },
        );
        tracing::debug!(lease = id, ttl_secs, "lease granted");
        Ok(id)
    }

    /// Push a lease's deadline out by its TTL.
    pub async fn renew(&self, lease: LeaseId) -> Result<KeepAliveResponse, StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = lease_deadline(entry.ttl_secs)?;
        Ok(KeepAliveResponse {
            lease,
            ttl_secs: entry.ttl_secs,
        })
    }

    pub async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let event = {
            let mut state = self.state.lock().await;
            if let Some(id) = lease {
                if !state.leases.contains_key(&id) {
                    return Err(StoreError::LeaseNotFound(id));
                }
            }
            let previous = state.kvs.get(key).and_then(|e| e.lease);
            if let Some(old) = previous.filter(|old| Some(*old) != lease) {
                if let Some(l) = state.leases.get_mut(&old) {
                    l.keys.remove(key);
                }
            }
            if let Some(id) = lease {
                if let Some(l) = state.leases.get_mut(&id) {
                    l.keys.insert(key.to_string());
                }
            }
            let event = state.record(EventKind::Put, key);
            state.kvs.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    lease,
                    mod_revision: event.revision,
                },
            );
            event
        };
        let revision = event.revision;
        let _ = self.events.send(event);
        Ok(revision)
    }

    pub async fn get_prefix(&self, prefix: &str) -> Vec<KeyValue> {
        let state = self.state.lock().await;
        state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                lease: e.lease,
                mod_revision: e.mod_revision,
            })
            .collect()
    }

    pub async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let events = {
            let mut state = self.state.lock().await;
            state
                .remove_lease(lease)
                .ok_or(StoreError::LeaseNotFound(lease))?
        };
        tracing::debug!(lease, deleted = events.len(), "lease revoked");
        self.publish(events);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Wait up to `timeout` for events under `prefix` newer than `after`.
    pub async fn poll_events(&self, prefix: &str, after: Revision, timeout: Duration) -> WatchPoll {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + LONGEST_POLL);
        let mut rx = self.events.subscribe();
        loop {
            {
                let state = self.state.lock().await;
                match state.events_after(prefix, after) {
                    None => {
                        return WatchPoll {
                            revision: state.revision,
                            events: Vec::new(),
                            compacted: true,
                        }
                    }
                    Some(events) if !events.is_empty() => {
                        return WatchPoll {
                            revision: state.revision,
                            events,
                            compacted: false,
                        }
                    }
                    Some(_) => {}
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = tokio::time::timeout_at(deadline, rx.recv()) => match r {
                    Err(_) | Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Ok(_) => continue,
                },
            }
        }
        WatchPoll {
            revision: self.revision().await.max(after),
            events: Vec::new(),
            compacted: false,
        }
    }

    async fn sweep(&self) {
        let events = self.state.lock().await.expire(Instant::now());
        self.publish(events);
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Expire leases until the store shuts down.
async fn sweep_loop(store: MemoryStore) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = store.shutdown.cancelled() => break,
            _ = interval.tick() => store.sweep().await,
        }
    }
    tracing::debug!("lease sweeper stopped");
}

// ── Client ────────────────────────────────────────────────────────────────────

/// In-process client. Closing it ends only its own keep-alives and watches.
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    closed: CancellationToken,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryClient {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.ensure_open()?;
        self.store.grant(ttl_secs).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        self.ensure_open()?;
        let first = self.store.renew(lease).await?;
        let period = renew_period(first.ttl_secs);

        let (tx, rx) = mpsc::channel(16);
        let store = self.store.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }
                match store.renew(lease).await {
                    Ok(ack) => {
                        if tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(lease, error = %e, "keep-alive stopped");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.put(key, value, lease).await.map(|_| ())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.ensure_open()?;
        Ok(self.store.get_prefix(prefix).await)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.ensure_open()?;
        let mut events = self.store.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let store = self.store.clone();
        let closed = self.closed.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    r = events.recv() => r,
                };
                let batch = match first {
                    Ok(event) => {
                        let mut batch = vec![event];
                        while let Ok(more) = events.try_recv() {
                            batch.push(more);
                        }
                        batch.retain(|e| e.key.starts_with(&prefix));
                        if batch.is_empty() {
                            continue;
                        }
                        WatchResponse { events: batch }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, prefix = %prefix, "watcher lagged, resyncing");
                        WatchResponse::resync(&prefix, store.revision().await)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.revoke(lease).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.cancel();
        Ok(())
    }
}

/// Renew three times per TTL.
pub(crate) fn renew_period(ttl_secs: i64) -> Duration {
    let millis = (ttl_secs.clamp(1, MAX_TTL_SECS) as u64).saturating_mul(1000) / 3;
    Duration::from_millis(millis).max(MIN_RENEW_PERIOD)
}
