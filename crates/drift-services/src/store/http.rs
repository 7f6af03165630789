//! HTTP client for a coordination store hosted by another supernode.
//!
//! The hosting supernode mounts its `MemoryStore` under `/store/*` on its
//! control port. Watches are long polls by revision; when the host reports
//! that the requested revision was compacted away the client emits a resync
//! batch and carries on from the host's current revision.
//!
//! Each endpoint hosts its own store, not a replica of a shared one. A client
//! binds to the first endpoint that answers and stays there: once the bound
//! host is gone every call fails with `Unavailable` instead of moving the
//! node onto a store holding a different membership set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;

use super::memory::{renew_period, WatchPoll};
use super::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, Revision,
    StoreError, WatchResponse, WatchStream,
};

/// How long the host holds a watch poll open.
pub const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack added to request timeouts on top of the poll hold time.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

// ── Wire ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantRequest {
    pub ttl_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantResponse {
    pub lease: LeaseId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub lease: LeaseId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevisionResponse {
    pub revision: Revision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RangeQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchQuery {
    pub prefix: String,
    pub after: Revision,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Store client over HTTP, bound on first use to one of its endpoints.
#[derive(Clone)]
pub struct HttpStore {
    endpoints: Vec<String>,
    bound: Arc<OnceCell<String>>,
    client: reqwest::Client,
    closed: CancellationToken,
    dial_timeout: Duration,
}

impl HttpStore {
    /// `endpoints` are `host:port` or full `http://` base URLs.
    pub fn new(endpoints: &[String], dial_timeout: Duration) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no store endpoints configured".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()?;
        Ok(Self {
            endpoints: endpoints.iter().map(|e| base_url(e)).collect(),
            bound: Arc::new(OnceCell::new()),
            client,
            closed: CancellationToken::new(),
            dial_timeout,
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Base URL this client is bound to, if any call has bound it yet.
    pub fn bound_endpoint(&self) -> Option<&str> {
        self.bound.get().map(String::as_str)
    }

    async fn endpoint(&self) -> Result<&str, StoreError> {
        self.bound
            .get_or_try_init(|| self.bind())
            .await
            .map(String::as_str)
    }

    /// First endpoint, in configured order, whose store answers.
    async fn bind(&self) -> Result<String, StoreError> {
        for base in &self.endpoints {
            let answered = self
                .client
                .get(format!("{base}/store/revision"))
                .timeout(self.dial_timeout)
                .send()
                .await;
            match answered {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(endpoint = %base, "bound to coordination store");
                    return Ok(base.clone());
                }
                Ok(resp) => {
                    tracing::debug!(endpoint = %base, status = %resp.status(), "store endpoint refused");
                }
                Err(e) => {
                    tracing::debug!(endpoint = %base, error = %e, "store endpoint unreachable");
                }
            }
        }
        Err(StoreError::Unavailable(format!(
            "no store answered at {}",
            self.endpoints.join(", ")
        )))
    }

    /// Send a request to the bound endpoint.
    async fn send<F>(&self, timeout: Duration, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let base = self.endpoint().await?;
        build(&self.client, base)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    StoreError::Unavailable(format!("store at {base} unreachable: {e}"))
                } else {
                    e.into()
                }
            })
    }

    async fn current_revision(&self) -> Result<Revision, StoreError> {
        let resp = self
            .send(self.dial_timeout, |c, base| c.get(format!("{base}/store/revision")))
            .await?;
        let body: RevisionResponse = decode(resp, None).await?;
        Ok(body.revision)
    }

    async fn renew(&self, lease: LeaseId) -> Result<KeepAliveResponse, StoreError> {
        let body = LeaseRequest { lease };
        let resp = self
            .send(self.dial_timeout, |c, base| {
                c.post(format!("{base}/store/lease/keepalive")).json(&body)
            })
            .await?;
        decode(resp, Some(lease)).await
    }

    async fn poll(&self, prefix: &str, after: Revision) -> Result<WatchPoll, StoreError> {
        let query = WatchQuery {
            prefix: prefix.to_string(),
            after,
            timeout_ms: Some(WATCH_POLL_TIMEOUT.as_millis() as u64),
        };
        let resp = self
            .send(WATCH_POLL_TIMEOUT + REQUEST_SLACK, |c, base| {
                c.get(format!("{base}/store/watch")).query(&query)
            })
            .await?;
        decode(resp, None).await
    }
}

#[async_trait]
impl CoordinationStore for HttpStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.ensure_open()?;
        let body = GrantRequest { ttl_secs };
        let resp = self
            .send(self.dial_timeout, |c, base| {
                c.post(format!("{base}/store/lease/grant")).json(&body)
            })
            .await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            return Err(StoreError::InvalidTtl(ttl_secs));
        }
        let granted: GrantResponse = decode(resp, None).await?;
        Ok(granted.lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        self.ensure_open()?;
        let first = self.renew(lease).await?;
        let period = renew_period(first.ttl_secs);

        let (tx, rx) = mpsc::channel(16);
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = store.closed.cancelled() => break,
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
                        tracing::warn!(lease, error = %e, "keep-alive stopped");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let body = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            lease,
        };
        let resp = self
            .send(self.dial_timeout, |c, base| {
                c.post(format!("{base}/store/kv/put")).json(&body)
            })
            .await?;
        let _: RevisionResponse = decode(resp, lease).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.ensure_open()?;
        let query = RangeQuery {
            prefix: prefix.to_string(),
        };
        let resp = self
            .send(self.dial_timeout, |c, base| {
                c.get(format!("{base}/store/kv/range")).query(&query)
            })
            .await?;
        decode(resp, None).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.ensure_open()?;
        let mut after = self.current_revision().await?;

        let (tx, rx) = mpsc::channel(64);
        let store = self.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = store.closed.cancelled() => break,
                    _ = tx.closed() => break,
                    r = store.poll(&prefix, after) => r,
                };
                let poll = match polled {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "watch poll failed");
                        break;
                    }
                };
                let batch = if poll.compacted {
                    tracing::warn!(prefix = %prefix, after, "watch revision compacted, resyncing");
                    Some(WatchResponse::resync(&prefix, poll.revision))
                } else if poll.events.is_empty() {
                    None
                } else {
                    Some(WatchResponse {
                        events: poll.events,
                    })
                };
                after = poll.revision.max(after);
                if let Some(batch) = batch {
                    if tx.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        let body = LeaseRequest { lease };
        let resp = self
            .send(self.dial_timeout, |c, base| {
                c.post(format!("{base}/store/lease/revoke")).json(&body)
            })
            .await?;
        check(resp, Some(lease))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.cancel();
        Ok(())
    }
}

fn base_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Map host status codes onto store errors.
fn check(resp: reqwest::Response, lease: Option<LeaseId>) -> Result<reqwest::Response, StoreError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => match lease {
            Some(id) => Err(StoreError::LeaseNotFound(id)),
            None => Err(StoreError::Unavailable(format!("{} not found", resp.url().path()))),
        },
        s => Err(StoreError::Unavailable(format!("store returned {s}"))),
    }
}

async fn decode<T: DeserializeOwned>(
    resp: reqwest::Response,
    lease: Option<LeaseId>,
) -> Result<T, StoreError> {
    Ok(check(resp, lease)?.json::<T>().await?)
}
