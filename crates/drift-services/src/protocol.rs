//! Piece transfer protocol handlers.
//!
//! Every handler looks up the task first and routes by its CDN owner. When
//! another supernode owns the task, pulls and reports name that owner as the
//! destination peer and reports are flagged for replication to it.

use std::sync::Arc;
use std::time::Duration;

use drift_core::types::{
    PeerCreateRequest, PieceTaskEntry, PiecePullRequest, PieceUpdateRequest, PullPieceParams,
    RegisterResponseData, ReportPieceParams, ResultInfo, ServerDownRequest, ServiceDownParams,
    TaskCreateRequest, TaskRegisterRequest, parse_headers,
};
use drift_core::wire::{codes, DfgetStatus, PieceResult};

use crate::membership::MembershipTable;
use crate::registry::{PullOutcome, Registries, RegistryError};
use crate::router::{route, CdnRoute};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProtocolError {
    /// Result code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParam(_) => codes::PARAM_ERROR,
            Self::Registry(e) => e.code(),
        }
    }

    pub fn to_result(&self) -> ResultInfo {
        ResultInfo::new(self.code(), self.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

fn require(name: &str, value: &str) -> ProtocolResult<()> {
    if value.trim().is_empty() {
        return Err(ProtocolError::InvalidParam(format!("{name} is required")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Protocol {
    ha_enabled: bool,
    notify_timeout: Duration,
    table: Arc<MembershipTable>,
    registries: Registries,
}

impl Protocol {
    pub fn new(
        ha_enabled: bool,
        notify_timeout: Duration,
        table: Arc<MembershipTable>,
        registries: Registries,
    ) -> Self {
        Self {
            ha_enabled,
            notify_timeout,
            table,
            registries,
        }
    }

    pub fn local_pid(&self) -> &str {
        self.table.local_pid()
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }

    fn route(&self, owner_pid: &str) -> CdnRoute {
        route(self.ha_enabled, owner_pid, self.table.local_pid())
    }

    // ── Register ──────────────────────────────────────────────────────────────

    /// Register the client as a peer and the download as a task owned by this supernode.
    pub async fn register(&self, req: TaskRegisterRequest) -> ProtocolResult<RegisterResponseData> {
        req.validate().map_err(ProtocolError::InvalidParam)?;

        let peer_req = PeerCreateRequest {
            ip: req.ip.clone(),
            host_name: req.host_name.clone(),
            port: req.port,
            version: req.version.clone(),
            peer_id: req.peer_id.clone(),
        };
        let peer = self.registries.peers.register(peer_req).await.map_err(|e| {
            tracing::error!(ip = %req.ip, error = %e, "failed to register peer");
            e
        })?;
        tracing::info!(pid = %peer.id, ip = %req.ip, "registered peer");

        self.registries
            .origin
            .register_tls_config(&req.raw_url, req.insecure, &req.root_cas);

        let task_req = TaskCreateRequest {
            cid: req.cid.clone(),
            call_system: req.call_system.clone(),
            dfdaemon: req.dfdaemon,
            headers: parse_headers(&req.headers),
            identifier: req.identifier.clone(),
            md5: req.md5.clone(),
            path: req.path.clone(),
            peer_id: peer.id,
            raw_url: req.raw_url.clone(),
            task_url: req.task_url.clone(),
            supernode_ip: req.super_node_ip.clone(),
            cdn_peer_id: self.table.local_pid().to_string(),
        };
        let task = self.registries.tasks.register(task_req).await.map_err(|e| {
            tracing::error!(cid = %req.cid, url = %req.raw_url, error = %e, "failed to register task");
            e
        })?;
        tracing::debug!(task = %task.id, cid = %req.cid, "registered task");

        Ok(RegisterResponseData {
            task_id: task.id,
            file_length: task.file_length,
            piece_size: task.piece_size,
        })
    }

    // ── Pull ──────────────────────────────────────────────────────────────────

    /// Hand the client its next pieces.
    ///
    /// Registry failures on the pull itself become a result code, not an error.
    pub async fn pull_piece_task(&self, params: PullPieceParams) -> ProtocolResult<ResultInfo> {
        require("taskId", &params.task_id)?;
        require("srcCid", &params.src_cid)?;
        let task = self.registries.tasks.get(&params.task_id).await?;
        let dst_cid = params.dst_cid.unwrap_or_default();

        let dst_pid = match self.route(&task.cdn_peer_id) {
            CdnRoute::Remote(owner) => Some(owner),
            CdnRoute::Local if dst_cid.is_empty() => None,
            CdnRoute::Local => match self.registries.dfget_tasks.get(&dst_cid, &params.task_id).await {
                Ok(t) => Some(t.peer_id),
                Err(e) => {
                    tracing::warn!(
                        task = %params.task_id,
                        src_cid = %params.src_cid,
                        dst_cid = %dst_cid,
                        error = %e,
                        "failed to resolve destination peer"
                    );
                    None
                }
            },
        };

        let req = PiecePullRequest {
            dfget_task_status: DfgetStatus::from_code(&params.status),
            piece_range: params.range,
            piece_result: PieceResult::from_code(&params.result),
            dst_cid,
            dst_pid,
        };

        match self
            .registries
            .tasks
            .get_pieces(&params.task_id, &params.src_cid, &req)
            .await
        {
            Ok(PullOutcome::Finished) => Ok(ResultInfo::with_code(codes::PEER_FINISH)),
            Ok(PullOutcome::Continue(pieces)) => {
                let entries: Vec<PieceTaskEntry> = pieces.iter().map(PieceTaskEntry::from).collect();
                Ok(ResultInfo::with_data(codes::PEER_CONTINUE, &entries))
            }
            Err(e) => {
                if e.is_cdn_fail() {
                    tracing::error!(task = %params.task_id, error = %e, "failed to get pieces");
                } else {
                    tracing::warn!(task = %params.task_id, error = %e, "failed to get pieces");
                }
                Ok(ResultInfo::new(e.code(), e.to_string()))
            }
        }
    }

    // ── Report ────────────────────────────────────────────────────────────────

    /// Record that `cid` now holds `piece_range`, fetched from `dst_cid`.
    pub async fn report_piece(&self, params: ReportPieceParams) -> ProtocolResult<ResultInfo> {
        require("taskId", &params.task_id)?;
        require("cid", &params.cid)?;
        require("pieceRange", &params.piece_range)?;
        let task = self.registries.tasks.get(&params.task_id).await?;

        let update = match self.route(&task.cdn_peer_id) {
            CdnRoute::Remote(owner) => PieceUpdateRequest {
                client_id: params.cid.clone(),
                dst_pid: owner,
                dst_cid: params.dst_cid.clone(),
                piece_status: PieceResult::Success,
                send_copy: true,
            },
            CdnRoute::Local => {
                require("dstCid", &params.dst_cid)?;
                let dst = self
                    .registries
                    .dfget_tasks
                    .get(&params.dst_cid, &params.task_id)
                    .await?;
                PieceUpdateRequest {
                    client_id: params.cid.clone(),
                    dst_pid: dst.peer_id,
                    dst_cid: params.dst_cid.clone(),
                    piece_status: PieceResult::Success,
                    send_copy: false,
                }
            }
        };

        self.registries
            .tasks
            .update_piece_status(&params.task_id, &params.piece_range, &update)
            .await
            .map_err(|e| {
                tracing::error!(task = %params.task_id, range = %params.piece_range, error = %e, "failed to update piece status");
                e
            })?;
        Ok(ResultInfo::with_code(codes::PIECE_REPORT_ACK))
    }

    // ── Service down ──────────────────────────────────────────────────────────

    /// Clean up after a client whose download service went away.
    ///
    /// An owner other than this node is told first, best-effort, whether or
    /// not HA routing is on. Local cleanup errors are returned and stop the
    /// remaining steps.
    pub async fn report_service_down(&self, params: ServiceDownParams) -> ProtocolResult<ResultInfo> {
        require("taskId", &params.task_id)?;
        require("cid", &params.cid)?;
        let task = self.registries.tasks.get(&params.task_id).await?;

        let owner = task.cdn_peer_id.as_str();
        if !owner.is_empty() && owner != self.table.local_pid() {
            let req = ServerDownRequest {
                task_id: params.task_id.clone(),
                client_id: params.cid.clone(),
            };
            self.notify_owner(owner, &req).await;
        }

        let dfget = self
            .registries
            .dfget_tasks
            .get(&params.cid, &params.task_id)
            .await?;
        self.registries
            .progress
            .delete_piece_progress_by_cid(&params.task_id, &params.cid)
            .await?;
        self.registries.progress.delete_peer_state(&dfget.peer_id).await?;
        self.registries.peers.deregister(&dfget.peer_id).await?;
        self.registries
            .dfget_tasks
            .delete(&params.cid, &params.task_id)
            .await?;

        tracing::info!(task = %params.task_id, cid = %params.cid, pid = %dfget.peer_id, "client service down");
        Ok(ResultInfo::with_code(codes::PEER_DOWN_ACK))
    }

    async fn notify_owner(&self, owner: &str, req: &ServerDownRequest) {
        let Some(info) = self.table.get(owner).await else {
            tracing::warn!(owner = %owner, task = %req.task_id, "cdn owner not in membership, skipping notify");
            return;
        };
        match info.control.server_down(req, self.notify_timeout).await {
            Ok(true) => tracing::debug!(owner = %owner, task = %req.task_id, "cdn owner notified"),
            Ok(false) => tracing::warn!(owner = %owner, task = %req.task_id, "cdn owner declined server down"),
            Err(e) => tracing::error!(owner = %owner, task = %req.task_id, error = %e, "failed to notify cdn owner"),
        }
    }

    /// Control-channel side of a server-down notice from another supernode.
    ///
    /// Drops the client's piece progress and its dfget task. Answers whether
    /// both steps succeeded.
    pub async fn handle_remote_server_down(&self, req: &ServerDownRequest) -> bool {
        let mut ok = true;
        if let Err(e) = self
            .registries
            .progress
            .delete_piece_progress_by_cid(&req.task_id, &req.client_id)
            .await
        {
            tracing::warn!(task = %req.task_id, cid = %req.client_id, error = %e, "failed to delete piece progress");
            ok = false;
        }
        match self.registries.dfget_tasks.delete(&req.client_id, &req.task_id).await {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(task = %req.task_id, cid = %req.client_id, error = %e, "failed to delete dfget task");
                ok = false;
            }
        }
        tracing::info!(task = %req.task_id, cid = %req.client_id, ok, "remote server down handled");
        ok
    }
}
