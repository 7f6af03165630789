//! Control-channel client for one remote supernode.
//!
//! The channel is dialed lazily. `ConnectionState` records the outcome of the
//! last dial or call so the membership table can report it without forcing a
//! connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;

use drift_core::types::ServerDownRequest;
use drift_core::wire::SERVER_DOWN_METHOD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            _ => Self::Unconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Failed => 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial {0} timed out")]
    DialTimeout(String),
    #[error("call to {0} timed out")]
    CallTimeout(String),
    #[error("control request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{addr} answered {status}")]
    Rejected { addr: String, status: u16 },
}

/// Client for a remote supernode's control port.
#[derive(Debug)]
pub struct ControlClient {
    addr: String,
    dial_timeout: Duration,
    http: reqwest::Client,
    state: AtomicU8,
}

impl ControlClient {
    /// Create an unconnected client for `addr` (`ip:port`).
    pub fn new(addr: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout,
            http: reqwest::Client::new(),
            state: AtomicU8::new(ConnectionState::Unconnected.as_u8()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Dial the control port, bounded by the dial timeout.
    pub async fn connect(&self) -> Result<(), ControlError> {
        self.set_state(ConnectionState::Connecting);
        let dialed = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr)).await;
        match dialed {
            Ok(Ok(_)) => {
                self.set_state(ConnectionState::Connected);
                tracing::debug!(addr = %self.addr, "control channel connected");
                Ok(())
            }
            Ok(Err(source)) => {
                self.set_state(ConnectionState::Failed);
                Err(ControlError::Dial {
                    addr: self.addr.clone(),
                    source,
                })
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed);
                Err(ControlError::DialTimeout(self.addr.clone()))
            }
        }
    }

    /// Connect unless already connected.
    pub async fn ensure_connected(&self) -> Result<(), ControlError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect().await
    }

    /// Ask the remote supernode to clean up after a client that went down.
    /// The whole exchange, dial included, is bounded by `timeout`.
    pub async fn server_down(
        &self,
        req: &ServerDownRequest,
        timeout: Duration,
    ) -> Result<bool, ControlError> {
        match tokio::time::timeout(timeout, self.call_server_down(req)).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed);
                Err(ControlError::CallTimeout(self.addr.clone()))
            }
        }
    }

    async fn call_server_down(&self, req: &ServerDownRequest) -> Result<bool, ControlError> {
        self.ensure_connected().await?;
        let url = format!("http://{}/rpc/{}", self.addr, SERVER_DOWN_METHOD);
        let resp = self.http.post(url).json(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ControlError::Rejected {
                addr: self.addr.clone(),
                status: status.as_u16(),
            });
        }
        Ok(resp.json::<bool>().await?)
    }
}
