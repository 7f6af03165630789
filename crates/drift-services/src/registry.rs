//! Registry seams: the services the coordinator and protocol handlers call into.
//!
//! Peers, tasks, per-client tasks and progress are owned elsewhere. This
//! module fixes the calls the core makes and the error kinds it reacts to.
//! Every implementation must make each call individually atomic; sequences
//! of calls are not transactional.

use std::sync::Arc;

use async_trait::async_trait;

use drift_core::types::{
    DfgetTask, PeerCreateRequest, PeerCreateResponse, PeerInfo, PieceInfo, PiecePullRequest,
    PieceUpdateRequest, TaskCreateRequest, TaskInfo,
};
use drift_core::wire::codes;

/// Error returned by any registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// The origin fetch for a task failed.
    #[error("cdn failed: {0}")]
    CdnFail(String),
    /// No piece is available yet; the client should retry.
    #[error("peer should wait: {0}")]
    PeerWait(String),
    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    pub fn is_cdn_fail(&self) -> bool {
        matches!(self, Self::CdnFail(_))
    }

    /// Result code reported to the client for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) => codes::TARGET_NOT_FOUND,
            Self::InvalidValue(_) => codes::PARAM_ERROR,
            Self::CdnFail(_) => codes::SOURCE_ERROR,
            Self::PeerWait(_) => codes::PEER_WAIT,
            Self::Other(_) => codes::SYSTEM_ERROR,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Peer records, keyed by PID.
#[async_trait]
pub trait PeerRegistry: Send + Sync + 'static {
    async fn get(&self, pid: &str) -> RegistryResult<Option<PeerInfo>>;
    async fn register(&self, req: PeerCreateRequest) -> RegistryResult<PeerCreateResponse>;
    async fn deregister(&self, pid: &str) -> RegistryResult<()>;
}

/// Outcome of asking the task registry for pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The requesting client has everything it needs.
    Finished,
    /// Pieces to fetch next.
    Continue(Vec<PieceInfo>),
}

/// Distribution tasks and their per-piece state.
#[async_trait]
pub trait TaskRegistry: Send + Sync + 'static {
    async fn get(&self, task_id: &str) -> RegistryResult<TaskInfo>;
    async fn register(&self, req: TaskCreateRequest) -> RegistryResult<TaskInfo>;
    async fn get_pieces(
        &self,
        task_id: &str,
        src_cid: &str,
        req: &PiecePullRequest,
    ) -> RegistryResult<PullOutcome>;
    async fn update_piece_status(
        &self,
        task_id: &str,
        piece_range: &str,
        req: &PieceUpdateRequest,
    ) -> RegistryResult<()>;
}

/// Per-client (dfget) task records, keyed by (cid, task id).
#[async_trait]
pub trait DfgetTaskRegistry: Send + Sync + 'static {
    async fn get(&self, cid: &str, task_id: &str) -> RegistryResult<DfgetTask>;
    async fn delete(&self, cid: &str, task_id: &str) -> RegistryResult<()>;
}

/// Piece progress bookkeeping.
#[async_trait]
pub trait ProgressStore: Send + Sync + 'static {
    async fn delete_peer_state(&self, pid: &str) -> RegistryResult<()>;
    async fn delete_piece_progress_by_cid(&self, task_id: &str, cid: &str) -> RegistryResult<()>;
}

/// Origin (CDN) fetch client.
pub trait OriginClient: Send + Sync + 'static {
    /// Remember TLS settings for fetches of `raw_url`.
    fn register_tls_config(&self, raw_url: &str, insecure: bool, root_cas: &[String]);
}

/// The collaborators the protocol handlers and coordinator call into.
#[derive(Clone)]
pub struct Registries {
    pub peers: Arc<dyn PeerRegistry>,
    pub tasks: Arc<dyn TaskRegistry>,
    pub dfget_tasks: Arc<dyn DfgetTaskRegistry>,
    pub progress: Arc<dyn ProgressStore>,
    pub origin: Arc<dyn OriginClient>,
}
