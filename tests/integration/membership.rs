use crate::*;

use drift_services::control::ConnectionState;
use drift_services::store::HttpStore;

const CONVERGE: Duration = Duration::from_secs(5);

/// Two supernodes see each other, then one leaves cleanly and the other
/// drops its peer record and progress state.
#[tokio::test]
async fn test_clean_leave_is_reconciled() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();

    let mut s2 = Supernode::start("p2", Arc::new(store.client()), None, &ha).await?;
    s2.join(ha.lease_ttl_secs).await?;
    let mut s1 = Supernode::start("p1", Arc::new(store.client()), None, &ha).await?;
    s1.join(ha.lease_ttl_secs).await?;

    assert!(eventually(CONVERGE, || s2.mem.peers.contains("p1")).await, "p2 never saw p1");
    assert!(eventually(CONVERGE, || s1.mem.peers.contains("p2")).await, "p1 never saw p2");
    assert_eq!(s2.table.len().await, 1);

    s2.mem.progress.touch_peer("p1");
    s1.coordinator.release_lease().await?;

    assert!(
        eventually(CONVERGE, || !s2.mem.peers.contains("p1")).await,
        "p1 still registered on p2"
    );
    assert!(!s2.mem.progress.has_peer_state("p1"));
    assert_eq!(s2.table.len().await, 0);
    // p2 keeps itself.
    assert!(s2.mem.peers.contains("p2"));

    s1.crash().await;
    s2.crash().await;
    store.shutdown();
    Ok(())
}

/// A supernode that stops renewing its lease is dropped once the TTL runs out.
#[tokio::test]
async fn test_crashed_supernode_expires() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();

    let mut s2 = Supernode::start("p2", Arc::new(store.client()), None, &ha).await?;
    s2.join(ha.lease_ttl_secs).await?;
    let mut s1 = Supernode::start("p1", Arc::new(store.client()), None, &ha).await?;
    s1.join(ha.lease_ttl_secs).await?;
    assert!(eventually(CONVERGE, || s2.mem.peers.contains("p1")).await);

    s1.crash().await;

    assert!(
        eventually(CONVERGE, || !s2.mem.peers.contains("p1")).await,
        "expired lease not detected"
    );
    s2.crash().await;
    store.shutdown();
    Ok(())
}

/// Rejoining with the same PID does not duplicate anything.
#[tokio::test]
async fn test_rejoin_is_idempotent() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();

    let mut s2 = Supernode::start("p2", Arc::new(store.client()), None, &ha).await?;
    s2.join(ha.lease_ttl_secs).await?;
    let s1 = Supernode::start("p1", Arc::new(store.client()), None, &ha).await?;
    s1.coordinator.publish(&s1.record(), ha.lease_ttl_secs).await?;
    assert!(eventually(CONVERGE, || s2.mem.peers.contains("p1")).await);

    s1.coordinator.publish(&s1.record(), ha.lease_ttl_secs).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(s2.mem.peers.ids(), vec!["p1", "p2"]);

    s1.crash().await;
    s2.crash().await;
    store.shutdown();
    Ok(())
}

/// Membership over the HTTP store hosted by another supernode.
#[tokio::test]
async fn test_membership_over_http_store() -> Result<()> {
    let hosted = MemoryStore::new();
    let ha = test_ha();

    let mut host = Supernode::start("host", Arc::new(hosted.client()), Some(hosted.clone()), &ha).await?;
    host.join(ha.lease_ttl_secs).await?;

    let remote = HttpStore::new(&[host.control_url.clone()], ha.dial_timeout())?;
    let mut s1 = Supernode::start("p1", Arc::new(remote), None, &ha).await?;
    s1.join(ha.lease_ttl_secs).await?;

    assert!(eventually(CONVERGE, || host.mem.peers.contains("p1")).await, "host never saw p1");
    assert!(eventually(CONVERGE, || s1.mem.peers.contains("host")).await, "p1 never saw host");

    // The lease outlives its TTL while p1 keeps renewing over HTTP.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(host.mem.peers.contains("p1"));

    s1.coordinator.release_lease().await?;
    assert!(eventually(CONVERGE, || !host.mem.peers.contains("p1")).await);

    s1.crash().await;
    host.crash().await;
    hosted.shutdown();
    Ok(())
}

/// `/supernodes` reports what the membership table holds.
#[tokio::test]
async fn test_supernodes_route() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();

    let mut s2 = Supernode::start("p2", Arc::new(store.client()), None, &ha).await?;
    s2.join(ha.lease_ttl_secs).await?;
    let mut s1 = Supernode::start("p1", Arc::new(store.client()), None, &ha).await?;
    s1.join(ha.lease_ttl_secs).await?;
    assert!(eventually(CONVERGE, || s2.mem.peers.contains("p1")).await);

    let (status, body) = get_json(&format!("{}/supernodes", s2.peer_url)).await?;
    assert_eq!(status, 200);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"]["localPid"], "p2");
    assert_eq!(body["data"]["haEnabled"], true);
    let nodes = body["data"]["supernodes"].as_array().context("supernodes array")?;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["pid"], "p1");
    assert_eq!(nodes[0]["control_port"], s1.control_port());
    assert_eq!(
        serde_json::to_value(ConnectionState::Unconnected)?,
        nodes[0]["connection"]
    );

    s1.crash().await;
    s2.crash().await;
    store.shutdown();
    Ok(())
}
