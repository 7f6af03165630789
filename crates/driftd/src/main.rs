//! driftd — supernode daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drift_core::config::DriftConfig;
use drift_core::types::PeerCreateRequest;
use drift_services::memory::MemoryRegistries;
use drift_services::store::MemoryStore;
use drift_services::{MembershipTable, Protocol};

mod ha;

fn socket_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    format!("{ip}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {ip}:{port}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DriftConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DriftConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DriftConfig::default()
    });
    tracing::info!(
        advertise_ip = %config.node.advertise_ip,
        listen_port = config.node.listen_port,
        ha = config.ha.enabled,
        "driftd starting"
    );

    let peer_addr = socket_addr(&config.node.bind_ip, config.node.listen_port)?;
    let control_addr = socket_addr(&config.node.bind_ip, config.node.control_port)?;

    // Registries
    let memory = MemoryRegistries::new();
    let registries = memory.registries();

    // The supernode is a peer too; its peer ID is its PID in the cluster.
    let local_pid = registries
        .peers
        .register(PeerCreateRequest {
            ip: config.node.advertise_ip.clone(),
            host_name: config.node.resolved_hostname(),
            port: i32::from(config.node.download_port),
            version: env!("CARGO_PKG_VERSION").to_string(),
            peer_id: None,
        })
        .await
        .context("failed to register supernode as peer")?
        .id;
    tracing::info!(pid = %local_pid, "supernode registered");

    let table = Arc::new(MembershipTable::new(local_pid, config.ha.dial_timeout()));
    let protocol = Protocol::new(
        config.ha.enabled,
        config.ha.notify_timeout(),
        Arc::clone(&table),
        registries.clone(),
    );

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // ── HA ───────────────────────────────────────────────────────────────────
    let embedded = (config.ha.enabled && config.ha.store_endpoints.is_empty()).then(MemoryStore::new);
    let hosted = embedded.clone().filter(|_| config.ha.serve_store);

    let control_task = config.ha.enabled.then(|| {
        let app = drift_api::control_router(protocol.clone(), hosted);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { drift_api::serve(app, control_addr, shutdown).await })
    });

    let cluster = if config.ha.enabled {
        let store = ha::store_client(&config, embedded.as_ref())?;
        Some(ha::join(&config, store, Arc::clone(&table), &registries, shutdown.clone()).await?)
    } else {
        None
    };

    // ── Peer API ─────────────────────────────────────────────────────────────
    let state = drift_api::ApiState {
        protocol,
        ha_enabled: config.ha.enabled,
    };
    let peer_task = {
        let app = drift_api::peer_router(state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { drift_api::serve(app, peer_addr, shutdown).await })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────
    let (watch_task, coordinator) = match cluster {
        Some(c) => (Some(c.watch), Some(c.coordinator)),
        None => (None, None),
    };
    let watch_exit = async {
        match watch_task {
            Some(h) => h.await,
            None => std::future::pending().await,
        }
    };
    let control_exit = async {
        match control_task {
            Some(h) => h.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => tracing::info!("shutting down"),
        r = peer_task            => tracing::error!("peer server exited: {:?}", r),
        r = control_exit         => tracing::error!("control server exited: {:?}", r),
        r = watch_exit           => tracing::error!("membership watch exited: {:?}", r),
    }
    shutdown.cancel();

    if let Some(coordinator) = coordinator {
        ha::leave(&coordinator).await;
    }
    if let Some(store) = embedded {
        store.shutdown();
    }
    tracing::info!("driftd stopped");
    Ok(())
}
