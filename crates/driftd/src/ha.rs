//! Cluster membership startup: store selection, publishing and the watch task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use drift_core::config::DriftConfig;
use drift_core::wire::SupernodeRecord;
use drift_services::coordinator::CoordinatorResult;
use drift_services::store::{CoordinationStore, HttpStore, MemoryStore};
use drift_services::{Coordinator, MembershipTable, Registries};

pub struct Cluster {
    pub coordinator: Arc<Coordinator>,
    pub watch: JoinHandle<CoordinatorResult<()>>,
}

/// Pick the coordination store client for this node.
///
/// Remote endpoints win. Without them the embedded store is used directly.
pub fn store_client(
    config: &DriftConfig,
    embedded: Option<&MemoryStore>,
) -> Result<Arc<dyn CoordinationStore>> {
    if !config.ha.store_endpoints.is_empty() {
        let store = HttpStore::new(&config.ha.store_endpoints, config.ha.dial_timeout())
            .context("failed to build store client")?;
        tracing::info!(endpoints = ?config.ha.store_endpoints, "using remote coordination store");
        return Ok(Arc::new(store));
    }
    let store = embedded.context("HA enabled without store endpoints or an embedded store")?;
    tracing::info!("using embedded coordination store");
    Ok(Arc::new(store.client()))
}

/// Publish this supernode and start following the membership.
pub async fn join(
    config: &DriftConfig,
    store: Arc<dyn CoordinationStore>,
    table: Arc<MembershipTable>,
    registries: &Registries,
    cancel: CancellationToken,
) -> Result<Cluster> {
    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::clone(&table),
        Arc::clone(&registries.peers),
        Arc::clone(&registries.progress),
        &config.ha,
    ));

    let record = SupernodeRecord {
        ip: config.node.advertise_ip.clone(),
        listen_port: config.node.listen_port,
        download_port: config.node.download_port,
        control_port: config.node.control_port,
        hostname: config.node.resolved_hostname(),
        pid: table.local_pid().to_string(),
    };
    coordinator
        .publish(&record, config.ha.lease_ttl_secs)
        .await
        .context("failed to publish membership record")?;

    let watch = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.watch_membership(&cancel).await })
    };

    Ok(Cluster { coordinator, watch })
}

/// Leave the cluster: revoke the lease, then close the store client.
pub async fn leave(coordinator: &Coordinator) {
    if let Err(e) = coordinator.release_lease().await {
        tracing::warn!(error = %e, "failed to release lease");
    }
    if let Err(e) = coordinator.shutdown().await {
        tracing::warn!(error = %e, "failed to close coordination store");
    }
}
