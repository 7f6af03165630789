//! Protocol data types exchanged with dfget clients and the registries.
//!
//! JSON field names follow the dfget client (camelCase).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wire::{codes, piece_num, DfgetStatus, PieceResult};

// ── Peers ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCreateRequest {
    pub ip: String,
    pub host_name: String,
    pub port: i32,
    #[serde(default)]
    pub version: String,
    /// Requested peer ID. Generated by the peer registry when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCreateResponse {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub ip: String,
    pub host_name: String,
    pub port: i32,
    pub version: String,
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Body of `POST /peer/registry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRegisterRequest {
    pub cid: String,
    pub call_system: String,
    pub dfdaemon: bool,
    /// `key:value` strings.
    pub headers: Vec<String>,
    pub identifier: String,
    pub md5: String,
    pub path: String,
    pub raw_url: String,
    pub task_url: String,
    pub super_node_ip: String,
    pub ip: String,
    pub host_name: String,
    pub port: i32,
    pub version: String,
    pub peer_id: Option<String>,
    pub insecure: bool,
    #[serde(rename = "rootCAs")]
    pub root_cas: Vec<String>,
}

impl TaskRegisterRequest {
    /// Check required fields. Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.cid.is_empty() {
            return Err("cid is required".into());
        }
        if self.ip.is_empty() {
            return Err("ip is required".into());
        }
        if self.raw_url.is_empty() {
            return Err("rawUrl is required".into());
        }
        if !(1..=65535).contains(&self.port) {
            return Err(format!("port {} out of range", self.port));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreateRequest {
    pub cid: String,
    pub call_system: String,
    pub dfdaemon: bool,
    pub headers: HashMap<String, String>,
    pub identifier: String,
    pub md5: String,
    pub path: String,
    pub peer_id: String,
    pub raw_url: String,
    pub task_url: String,
    pub supernode_ip: String,
    /// Supernode that fetches this task from the origin.
    pub cdn_peer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub raw_url: String,
    pub task_url: String,
    pub md5: String,
    pub file_length: i64,
    pub piece_size: i32,
    #[serde(rename = "cdnPeerID")]
    pub cdn_peer_id: String,
}

/// A client's participation in a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfgetTask {
    pub cid: String,
    pub task_id: String,
    pub peer_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponseData {
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: i32,
}

// ── Pieces ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiecePullRequest {
    pub dfget_task_status: DfgetStatus,
    pub piece_range: String,
    pub piece_result: PieceResult,
    pub dst_cid: String,
    #[serde(rename = "dstPID")]
    pub dst_pid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceUpdateRequest {
    pub client_id: String,
    #[serde(rename = "dstPID")]
    pub dst_pid: String,
    #[serde(rename = "dstCID")]
    pub dst_cid: String,
    pub piece_status: PieceResult,
    /// The update belongs to a task owned by another supernode and must be
    /// replicated there.
    pub send_copy: bool,
}

/// A piece available from some peer, as known to the task registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceInfo {
    pub piece_range: String,
    pub piece_size: i32,
    pub piece_md5: String,
    pub cid: String,
    pub peer_ip: String,
    pub peer_port: i32,
    pub path: String,
}

/// One entry of a "continue" pull response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceTaskEntry {
    pub range: String,
    pub piece_num: i64,
    pub piece_size: i32,
    pub piece_md5: String,
    pub cid: String,
    pub peer_ip: String,
    pub peer_port: i32,
    pub path: String,
    pub down_link: i32,
}

impl From<&PieceInfo> for PieceTaskEntry {
    fn from(p: &PieceInfo) -> Self {
        Self {
            range: p.piece_range.clone(),
            piece_num: piece_num(&p.piece_range),
            piece_size: p.piece_size,
            piece_md5: p.piece_md5.clone(),
            cid: p.cid.clone(),
            peer_ip: p.peer_ip.clone(),
            peer_port: p.peer_port,
            path: p.path.clone(),
            down_link: 0,
        }
    }
}

// ── Query parameters ──────────────────────────────────────────────────────────

/// Query of `GET /peer/task`. `status` and `result` are numeric wire codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PullPieceParams {
    pub task_id: String,
    pub src_cid: String,
    pub dst_cid: Option<String>,
    pub status: String,
    pub result: String,
    pub range: String,
}

/// Query of `GET /peer/piece/suc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportPieceParams {
    pub task_id: String,
    pub cid: String,
    pub dst_cid: String,
    pub piece_range: String,
}

/// Query of `GET /peer/service/down`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDownParams {
    pub task_id: String,
    pub cid: String,
}

// ── Control channel ───────────────────────────────────────────────────────────

/// Request body of `RpcManager.RpcDfgetServerDown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDownRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

// ── Result envelope ───────────────────────────────────────────────────────────

/// Envelope for every peer-facing response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResultInfo {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }

    /// Result with the default message for `code`.
    pub fn with_code(code: i32) -> Self {
        Self::new(code, codes::message(code))
    }

    /// Result carrying a payload. Serialization failure degrades to a system error.
    pub fn with_data<T: Serialize>(code: i32, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                code,
                msg: codes::message(code).to_string(),
                data: Some(value),
            },
            Err(e) => Self::new(codes::SYSTEM_ERROR, e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }
}

/// Turn `key:value` header strings into a map. Entries without a colon are dropped.
pub fn parse_headers(headers: &[String]) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|h| h.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
