//! drift wire format — the values that cross process boundaries.
//!
//! Three things live here:
//!   - the membership record every supernode publishes in the coordination store,
//!   - the numeric status/result codes dfget clients send on piece pulls,
//!   - the result codes carried in every `ResultInfo` response.
//!
//! The membership record layout is shared with supernodes already deployed.
//! Field order and the `@` delimiter must not change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between membership record fields.
pub const RECORD_DELIMITER: char = '@';

/// Number of fields in a membership record.
pub const RECORD_FIELDS: usize = 6;

/// Control-channel method invoked on a task's CDN owner when a client goes down.
pub const SERVER_DOWN_METHOD: &str = "RpcManager.RpcDfgetServerDown";

// ── Membership record ────────────────────────────────────────────────────────

/// One supernode as published under the membership prefix.
///
/// Wire: `ip@listenPort@downloadPort@controlPort@hostname@PID`, integers in decimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupernodeRecord {
    pub ip: String,
    pub listen_port: u16,
    pub download_port: u16,
    pub control_port: u16,
    pub hostname: String,
    pub pid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("expected {RECORD_FIELDS} fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} {value:?}")]
    BadPort { field: &'static str, value: String },
    #[error("{field} {value:?} contains the record delimiter")]
    Delimiter { field: &'static str, value: String },
}

impl SupernodeRecord {
    /// Encode as the delimited store value.
    ///
    /// Text fields holding the delimiter would shift every later field on decode.
    pub fn encode(&self) -> Result<String, RecordError> {
        for (field, value) in [("ip", &self.ip), ("hostname", &self.hostname), ("pid", &self.pid)] {
            if value.contains(RECORD_DELIMITER) {
                return Err(RecordError::Delimiter {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(format!(
            "{ip}{d}{lp}{d}{dp}{d}{cp}{d}{host}{d}{pid}",
            ip = self.ip,
            lp = self.listen_port,
            dp = self.download_port,
            cp = self.control_port,
            host = self.hostname,
            pid = self.pid,
            d = RECORD_DELIMITER,
        ))
    }

    /// Decode a delimited store value.
    ///
    /// An empty PID decodes fine; callers decide whether that is acceptable.
    pub fn decode(value: &str) -> Result<Self, RecordError> {
        let fields: Vec<&str> = value.split(RECORD_DELIMITER).collect();
        if fields.len() != RECORD_FIELDS {
            return Err(RecordError::FieldCount(fields.len()));
        }
        Ok(Self {
            ip: fields[0].to_string(),
            listen_port: parse_port("listen port", fields[1])?,
            download_port: parse_port("download port", fields[2])?,
            control_port: parse_port("control port", fields[3])?,
            hostname: fields[4].to_string(),
            pid: fields[5].to_string(),
        })
    }

    /// `ip:port` of the control channel.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.ip, self.control_port)
    }

    /// Coordination store key for this record.
    pub fn key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.pid)
    }
}

impl fmt::Display for SupernodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.pid, self.ip, self.listen_port)
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, RecordError> {
    value.parse().map_err(|_| RecordError::BadPort {
        field,
        value: value.to_string(),
    })
}

// ── Piece pull codes ─────────────────────────────────────────────────────────

/// Lifecycle of the requesting dfget downloader.
///
/// Wire codes 700/701/702. Anything else maps to `Unrecognized`, which is
/// passed through to the task registry as an empty symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DfgetStatus {
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[default]
    #[serde(rename = "")]
    Unrecognized,
}

impl DfgetStatus {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "700" => Self::Started,
            "701" => Self::Running,
            "702" => Self::Finished,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Unrecognized => "",
        }
    }
}

/// Outcome of the previous piece transfer.
///
/// Wire codes 500/501/502/503.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PieceResult {
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "INVALID")]
    Invalid,
    #[serde(rename = "SEMI_SUCCESS")]
    SemiSuccess,
    #[default]
    #[serde(rename = "")]
    Unrecognized,
}

impl PieceResult {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "500" => Self::Failed,
            "501" => Self::Success,
            "502" => Self::Invalid,
            "503" => Self::SemiSuccess,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failed => "FAILED",
            Self::Success => "SUCCESS",
            Self::Invalid => "INVALID",
            Self::SemiSuccess => "SEMI_SUCCESS",
            Self::Unrecognized => "",
        }
    }
}

// ── Result codes ─────────────────────────────────────────────────────────────

/// Codes carried in `ResultInfo.code`.
pub mod codes {
    pub const SUCCESS: i32 = 200;
    pub const SYSTEM_ERROR: i32 = 500;
    pub const PARAM_ERROR: i32 = 501;
    pub const TARGET_NOT_FOUND: i32 = 502;
    pub const PEER_FINISH: i32 = 600;
    pub const PEER_CONTINUE: i32 = 601;
    pub const PEER_WAIT: i32 = 602;
    pub const PEER_LIMITED: i32 = 603;
    pub const SOURCE_ERROR: i32 = 604;
    pub const PEER_DOWN_ACK: i32 = 605;
    pub const PIECE_REPORT_ACK: i32 = 606;

    /// Default message for a code.
    pub fn message(code: i32) -> &'static str {
        match code {
            SUCCESS => "success",
            SYSTEM_ERROR => "system error",
            PARAM_ERROR => "param is illegal",
            TARGET_NOT_FOUND => "target not found",
            PEER_FINISH => "peer finished",
            PEER_CONTINUE => "peer continue",
            PEER_WAIT => "peer wait",
            PEER_LIMITED => "peer limited",
            SOURCE_ERROR => "source error",
            PEER_DOWN_ACK => "peer down",
            PIECE_REPORT_ACK => "piece report",
            _ => "",
        }
    }
}

// ── Pieces and tasks ─────────────────────────────────────────────────────────

/// Piece index for a `start-end` byte range: `start / (end - start + 1)`.
/// Returns -1 for a malformed range.
pub fn piece_num(range: &str) -> i64 {
    let Some((start, end)) = range.split_once('-') else {
        return -1;
    };
    let (Ok(start), Ok(end)) = (start.trim().parse::<i64>(), end.trim().parse::<i64>()) else {
        return -1;
    };
    if start < 0 || end < start {
        return -1;
    }
    start / (end - start + 1)
}

/// Task ID derived from the source URL and an optional identifier.
pub fn task_id(url: &str, identifier: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(url.as_bytes());
    if !identifier.is_empty() {
        hasher.update(identifier.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}
