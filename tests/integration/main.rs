//! drift integration test harness.
//!
//! Every test runs whole supernodes inside the test process: registries,
//! coordinator, and the peer and control HTTP servers bound to loopback on
//! ephemeral ports. Supernodes share a coordination store either directly
//! (`MemoryClient`) or over HTTP (`HttpStore`) through a hosting supernode.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use drift_core::config::HaConfig;
use drift_core::types::PeerCreateRequest;
use drift_core::wire::SupernodeRecord;
use drift_services::coordinator::CoordinatorResult;
use drift_services::memory::MemoryRegistries;
use drift_services::registry::PeerRegistry;
use drift_services::store::{CoordinationStore, MemoryStore};
use drift_services::{Coordinator, MembershipTable, Protocol};

mod membership;
mod protocol;
mod store;

// ── Harness ───────────────────────────────────────────────────────────────────

/// HA settings used by the tests: short lease, quick dials.
pub fn test_ha() -> HaConfig {
    HaConfig {
        enabled: true,
        lease_ttl_secs: 2,
        dial_timeout_ms: 500,
        notify_timeout_ms: 1_000,
        ..HaConfig::default()
    }
}

/// One in-process supernode.
pub struct Supernode {
    pub pid: String,
    pub mem: MemoryRegistries,
    pub table: Arc<MembershipTable>,
    pub protocol: Protocol,
    pub coordinator: Arc<Coordinator>,
    pub peer_url: String,
    pub control_url: String,
    pub watch: Option<JoinHandle<CoordinatorResult<()>>>,
    pub cancel: CancellationToken,
}

impl Supernode {
    /// Start servers and register this supernode as a peer of itself.
    /// Nothing is published until `join` is called.
    pub async fn start(
        pid: &str,
        store: Arc<dyn CoordinationStore>,
        hosted: Option<MemoryStore>,
        ha: &HaConfig,
    ) -> Result<Self> {
        let mem = MemoryRegistries::new();
        mem.peers
            .register(PeerCreateRequest {
                ip: "127.0.0.1".into(),
                host_name: pid.into(),
                port: 8001,
                version: "test".into(),
                peer_id: Some(pid.into()),
            })
            .await
            .context("self registration")?;

        let table = Arc::new(MembershipTable::new(pid, ha.dial_timeout()));
        let protocol = Protocol::new(
            ha.enabled,
            ha.notify_timeout(),
            Arc::clone(&table),
            mem.registries(),
        );
        let registries = mem.registries();
        let coordinator = Arc::new(Coordinator::new(
            store,
            Arc::clone(&table),
            registries.peers,
            registries.progress,
            ha,
        ));

        let cancel = CancellationToken::new();

        let peer_listener = TcpListener::bind("127.0.0.1:0").await?;
        let peer_url = format!("http://{}", peer_listener.local_addr()?);
        let peer_app = drift_api::peer_router(drift_api::ApiState {
            protocol: protocol.clone(),
            ha_enabled: ha.enabled,
        });
        tokio::spawn(drift_api::serve_listener(peer_app, peer_listener, cancel.clone()));

        let control_listener = TcpListener::bind("127.0.0.1:0").await?;
        let control_url = format!("http://{}", control_listener.local_addr()?);
        let control_app = drift_api::control_router(protocol.clone(), hosted);
        tokio::spawn(drift_api::serve_listener(
            control_app,
            control_listener,
            cancel.clone(),
        ));

        Ok(Self {
            pid: pid.into(),
            mem,
            table,
            protocol,
            coordinator,
            peer_url,
            control_url,
            watch: None,
            cancel,
        })
    }

    pub fn control_port(&self) -> u16 {
        self.control_url
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    pub fn record(&self) -> SupernodeRecord {
        SupernodeRecord {
            ip: "127.0.0.1".into(),
            listen_port: 8002,
            download_port: 8001,
            control_port: self.control_port(),
            hostname: self.pid.clone(),
            pid: self.pid.clone(),
        }
    }

    /// Publish the membership record and start watching.
    pub async fn join(&mut self, ttl_secs: i64) -> Result<()> {
        self.coordinator.publish(&self.record(), ttl_secs).await?;
        let coordinator = Arc::clone(&self.coordinator);
        let cancel = self.cancel.clone();
        self.watch = Some(tokio::spawn(async move {
            coordinator.watch_membership(&cancel).await
        }));
        Ok(())
    }

    /// Stop servers and the watch without revoking the lease.
    pub async fn crash(&self) {
        self.cancel.cancel();
        let _ = self.coordinator.shutdown().await;
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// GET `url` and decode the JSON body.
pub async fn get_json(url: &str) -> Result<(u16, serde_json::Value)> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let status = resp.status().as_u16();
    let body = resp.json().await.context("failed to parse response")?;
    Ok((status, body))
}

/// POST `body` to `url` and decode the JSON response.
pub async fn post_json(url: &str, body: &serde_json::Value) -> Result<(u16, serde_json::Value)> {
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let status = resp.status().as_u16();
    let body = resp.json().await.context("failed to parse response")?;
    Ok((status, body))
}
