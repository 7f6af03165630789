//! In-memory registries.
//!
//! Standalone implementations of the registry seams. The daemon runs on
//! these when no external registry is wired in, and tests use them as
//! fixtures. State lives in `DashMap`s behind `Arc`, so clones share it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use drift_core::types::{
    DfgetTask, PeerCreateRequest, PeerCreateResponse, PeerInfo, PieceInfo, PiecePullRequest,
    PieceUpdateRequest, TaskCreateRequest, TaskInfo,
};
use drift_core::wire::{task_id, DfgetStatus, PieceResult};

use crate::registry::{
    DfgetTaskRegistry, OriginClient, PeerRegistry, ProgressStore, PullOutcome, RegistryError,
    Registries, RegistryResult, TaskRegistry,
};

/// Piece size handed out for new tasks.
pub const DEFAULT_PIECE_SIZE: i32 = 4 * 1024 * 1024;

// ── Peers ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryPeerRegistry {
    peers: Arc<DashMap<String, PeerInfo>>,
}

impl MemoryPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: &str) -> bool {
        self.peers.contains_key(pid)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All registered PIDs, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// `hostname-ip-nanos`, unique enough for a single registry.
fn generate_peer_id(req: &PeerCreateRequest) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}-{}", req.host_name, req.ip, nanos)
}

#[async_trait]
impl PeerRegistry for MemoryPeerRegistry {
    async fn get(&self, pid: &str) -> RegistryResult<Option<PeerInfo>> {
        Ok(self.peers.get(pid).map(|p| p.value().clone()))
    }

    async fn register(&self, req: PeerCreateRequest) -> RegistryResult<PeerCreateResponse> {
        if req.ip.is_empty() {
            return Err(RegistryError::InvalidValue("peer ip is empty".into()));
        }
        let id = match &req.peer_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_peer_id(&req),
        };
        self.peers.insert(
            id.clone(),
            PeerInfo {
                id: id.clone(),
                ip: req.ip,
                host_name: req.host_name,
                port: req.port,
                version: req.version,
            },
        );
        Ok(PeerCreateResponse { id })
    }

    async fn deregister(&self, pid: &str) -> RegistryResult<()> {
        self.peers
            .remove(pid)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(format!("peer {pid}")))
    }
}

// ── Per-client tasks ──────────────────────────────────────────────────────────

/// Key of everything tracked per client: (cid, task id).
type ClientKey = (String, String);

fn client_key(cid: &str, task_id: &str) -> ClientKey {
    (cid.to_string(), task_id.to_string())
}

/// Per-client task records, plus the client's last pull and last piece
/// report. Deleting a client's task drops all three.
#[derive(Clone, Default)]
pub struct MemoryDfgetTaskRegistry {
    tasks: Arc<DashMap<ClientKey, DfgetTask>>,
    last_pulls: Arc<DashMap<ClientKey, PiecePullRequest>>,
    last_updates: Arc<DashMap<ClientKey, (String, PieceUpdateRequest)>>,
}

impl MemoryDfgetTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: DfgetTask) {
        self.tasks
            .insert(client_key(&task.cid, &task.task_id), task);
    }

    pub fn contains(&self, cid: &str, task_id: &str) -> bool {
        self.tasks.contains_key(&client_key(cid, task_id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn record_pull(&self, cid: &str, task_id: &str, req: &PiecePullRequest) {
        self.last_pulls.insert(client_key(cid, task_id), req.clone());
    }

    fn record_update(&self, task_id: &str, piece_range: &str, req: &PieceUpdateRequest) {
        self.last_updates.insert(
            client_key(&req.client_id, task_id),
            (piece_range.to_string(), req.clone()),
        );
    }

    /// Number of clients with a pull or report still tracked.
    pub fn tracked_clients(&self) -> usize {
        let mut keys: HashSet<ClientKey> =
            self.last_pulls.iter().map(|e| e.key().clone()).collect();
        keys.extend(self.last_updates.iter().map(|e| e.key().clone()));
        keys.len()
    }
}

#[async_trait]
impl DfgetTaskRegistry for MemoryDfgetTaskRegistry {
    async fn get(&self, cid: &str, task_id: &str) -> RegistryResult<DfgetTask> {
        self.tasks
            .get(&client_key(cid, task_id))
            .map(|t| t.value().clone())
            .ok_or_else(|| RegistryError::NotFound(format!("dfget task {cid}/{task_id}")))
    }

    async fn delete(&self, cid: &str, task_id: &str) -> RegistryResult<()> {
        let key = client_key(cid, task_id);
        self.last_pulls.remove(&key);
        self.last_updates.remove(&key);
        self.tasks
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(format!("dfget task {cid}/{task_id}")))
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Piece bookkeeping for one task: range → (piece, clients holding it).
type PieceTable = BTreeMap<String, (PieceInfo, HashSet<String>)>;

/// Task registry that hands out seeded pieces and tracks who holds them.
#[derive(Clone)]
pub struct MemoryTaskRegistry {
    tasks: Arc<DashMap<String, TaskInfo>>,
    pieces: Arc<DashMap<String, PieceTable>>,
    dfget_tasks: MemoryDfgetTaskRegistry,
}

impl MemoryTaskRegistry {
    pub fn new(dfget_tasks: MemoryDfgetTaskRegistry) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            pieces: Arc::new(DashMap::new()),
            dfget_tasks,
        }
    }

    /// Insert or replace a task, e.g. one replicated from its CDN owner.
    pub fn insert_task(&self, task: TaskInfo) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Make a piece available for download.
    pub fn add_piece(&self, task_id: &str, piece: PieceInfo) {
        self.pieces
            .entry(task_id.to_string())
            .or_default()
            .insert(piece.piece_range.clone(), (piece, HashSet::new()));
    }

    /// The last pull request a client made for a task.
    pub fn last_pull(&self, task_id: &str, cid: &str) -> Option<PiecePullRequest> {
        self.dfget_tasks
            .last_pulls
            .get(&client_key(cid, task_id))
            .map(|r| r.value().clone())
    }

    /// The last piece report a client made for a task, with its range.
    pub fn last_update(&self, task_id: &str, cid: &str) -> Option<(String, PieceUpdateRequest)> {
        self.dfget_tasks
            .last_updates
            .get(&client_key(cid, task_id))
            .map(|u| u.value().clone())
    }

    fn require(&self, task_id: &str) -> RegistryResult<TaskInfo> {
        self.tasks
            .get(task_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RegistryError::NotFound(format!("task {task_id}")))
    }
}

#[async_trait]
impl TaskRegistry for MemoryTaskRegistry {
    async fn get(&self, task_id: &str) -> RegistryResult<TaskInfo> {
        self.require(task_id)
    }

    async fn register(&self, req: TaskCreateRequest) -> RegistryResult<TaskInfo> {
        if req.raw_url.is_empty() {
            return Err(RegistryError::InvalidValue("raw url is empty".into()));
        }
        let id = task_id(&req.raw_url, &req.identifier);
        let task = self
            .tasks
            .entry(id.clone())
            .or_insert_with(|| TaskInfo {
                id: id.clone(),
                raw_url: req.raw_url.clone(),
                task_url: req.task_url.clone(),
                md5: req.md5.clone(),
                file_length: -1,
                piece_size: DEFAULT_PIECE_SIZE,
                cdn_peer_id: req.cdn_peer_id.clone(),
            })
            .value()
            .clone();
        self.dfget_tasks.insert(DfgetTask {
            cid: req.cid,
            task_id: id,
            peer_id: req.peer_id,
            path: req.path,
        });
        Ok(task)
    }

    async fn get_pieces(
        &self,
        task_id: &str,
        src_cid: &str,
        req: &PiecePullRequest,
    ) -> RegistryResult<PullOutcome> {
        self.require(task_id)?;
        self.dfget_tasks.record_pull(src_cid, task_id, req);

        if req.dfget_task_status == DfgetStatus::Finished {
            return Ok(PullOutcome::Finished);
        }

        let Some(table) = self.pieces.get(task_id) else {
            return Err(RegistryError::PeerWait(format!("no pieces for {task_id}")));
        };
        let wanted: Vec<PieceInfo> = table
            .values()
            .filter(|(_, holders)| !holders.contains(src_cid))
            .map(|(piece, _)| piece.clone())
            .collect();
        if wanted.is_empty() && !table.is_empty() {
            return Ok(PullOutcome::Finished);
        }
        Ok(PullOutcome::Continue(wanted))
    }

    async fn update_piece_status(
        &self,
        task_id: &str,
        piece_range: &str,
        req: &PieceUpdateRequest,
    ) -> RegistryResult<()> {
        self.require(task_id)?;
        if req.piece_status == PieceResult::Success {
            if let Some(mut table) = self.pieces.get_mut(task_id) {
                if let Some((_, holders)) = table.get_mut(piece_range) {
                    holders.insert(req.client_id.clone());
                }
            }
        }
        self.dfget_tasks.record_update(task_id, piece_range, req);
        Ok(())
    }
}

// ── Progress ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryProgressStore {
    peer_states: Arc<DashMap<String, u32>>,
    piece_progress: Arc<DashMap<(String, String), Vec<String>>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more running download served by `pid`.
    pub fn touch_peer(&self, pid: &str) {
        *self.peer_states.entry(pid.to_string()).or_default() += 1;
    }

    pub fn record_piece(&self, task_id: &str, cid: &str, range: &str) {
        self.piece_progress
            .entry((task_id.to_string(), cid.to_string()))
            .or_default()
            .push(range.to_string());
    }

    pub fn has_peer_state(&self, pid: &str) -> bool {
        self.peer_states.contains_key(pid)
    }

    pub fn has_piece_progress(&self, task_id: &str, cid: &str) -> bool {
        self.piece_progress
            .contains_key(&(task_id.to_string(), cid.to_string()))
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn delete_peer_state(&self, pid: &str) -> RegistryResult<()> {
        self.peer_states.remove(pid);
        Ok(())
    }

    async fn delete_piece_progress_by_cid(&self, task_id: &str, cid: &str) -> RegistryResult<()> {
        self.piece_progress
            .remove(&(task_id.to_string(), cid.to_string()));
        Ok(())
    }
}

// ── Origin ────────────────────────────────────────────────────────────────────

/// Records TLS settings per URL; fetching itself happens elsewhere.
#[derive(Clone, Default)]
pub struct MemoryOriginClient {
    tls: Arc<DashMap<String, (bool, Vec<String>)>>,
}

impl MemoryOriginClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tls_config(&self, raw_url: &str) -> Option<(bool, Vec<String>)> {
        self.tls.get(raw_url).map(|c| c.value().clone())
    }
}

impl OriginClient for MemoryOriginClient {
    fn register_tls_config(&self, raw_url: &str, insecure: bool, root_cas: &[String]) {
        if !insecure && root_cas.is_empty() {
            return;
        }
        self.tls
            .insert(raw_url.to_string(), (insecure, root_cas.to_vec()));
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// One of each in-memory collaborator. The task registry records dfget
/// tasks into the same per-client registry exposed here.
#[derive(Clone)]
pub struct MemoryRegistries {
    pub peers: MemoryPeerRegistry,
    pub tasks: MemoryTaskRegistry,
    pub dfget_tasks: MemoryDfgetTaskRegistry,
    pub progress: MemoryProgressStore,
    pub origin: MemoryOriginClient,
}

impl Default for MemoryRegistries {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistries {
    pub fn new() -> Self {
        let dfget_tasks = MemoryDfgetTaskRegistry::new();
        Self {
            peers: MemoryPeerRegistry::new(),
            tasks: MemoryTaskRegistry::new(dfget_tasks.clone()),
            dfget_tasks,
            progress: MemoryProgressStore::new(),
            origin: MemoryOriginClient::new(),
        }
    }

    pub fn registries(&self) -> Registries {
        Registries {
            peers: Arc::new(self.peers.clone()),
            tasks: Arc::new(self.tasks.clone()),
            dfget_tasks: Arc::new(self.dfget_tasks.clone()),
            progress: Arc::new(self.progress.clone()),
            origin: Arc::new(self.origin.clone()),
        }
    }
}
