use crate::*;

use drift_services::store::{EventKind, HttpStore, StoreError};

async fn hosted() -> Result<(MemoryStore, Supernode, HttpStore)> {
    let store = MemoryStore::new();
    let ha = test_ha();
    let host = Supernode::start("host", Arc::new(store.client()), Some(store.clone()), &ha).await?;
    let client = HttpStore::new(&[host.control_url.clone()], ha.dial_timeout())?;
    Ok((store, host, client))
}

#[tokio::test]
async fn test_http_store_kv_and_lease() -> Result<()> {
    let (store, host, client) = hosted().await?;

    let lease = client.grant(5).await?;
    assert!(lease > 0);
    client.put("/sn/a", "1", Some(lease)).await?;
    client.put("/sn/b", "2", None).await?;
    client.put("/other", "3", None).await?;

    let kvs = client.get_prefix("/sn/").await?;
    let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["/sn/a", "/sn/b"]);
    assert_eq!(kvs[0].lease, Some(lease));

    client.revoke(lease).await?;
    let kvs = client.get_prefix("/sn/").await?;
    assert_eq!(kvs.len(), 1);
    assert_eq!(kvs[0].key, "/sn/b");
    // The store itself agrees.
    assert_eq!(store.get_prefix("/sn/").await.len(), 1);

    client.close().await?;
    host.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_store_errors() -> Result<()> {
    let (store, host, client) = hosted().await?;

    assert!(matches!(client.grant(0).await, Err(StoreError::InvalidTtl(0))));
    assert!(matches!(
        client.put("/sn/a", "1", Some(999)).await,
        Err(StoreError::LeaseNotFound(999))
    ));
    assert!(matches!(client.revoke(999).await, Err(StoreError::LeaseNotFound(999))));
    assert!(matches!(client.keep_alive(999).await, Err(StoreError::LeaseNotFound(999))));

    client.close().await?;
    assert!(matches!(client.grant(5).await, Err(StoreError::Closed)));

    host.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_store_unreachable() -> Result<()> {
    // Nothing listens on the discard port.
    let client = HttpStore::new(&["127.0.0.1:9".to_string()], Duration::from_millis(300))?;
    assert!(client.get_prefix("/sn/").await.is_err());
    Ok(())
}

/// A client stays on the store it bound to; losing that host is an error,
/// never a silent move to another host's store.
#[tokio::test]
async fn test_http_store_does_not_switch_stores() -> Result<()> {
    let ha = test_ha();
    let store_a = MemoryStore::new();
    let host_a = Supernode::start("a", Arc::new(store_a.client()), Some(store_a.clone()), &ha).await?;
    let store_b = MemoryStore::new();
    let host_b = Supernode::start("b", Arc::new(store_b.client()), Some(store_b.clone()), &ha).await?;

    let client = HttpStore::new(
        &[host_a.control_url.clone(), host_b.control_url.clone()],
        ha.dial_timeout(),
    )?;
    let lease = client.grant(5).await?;
    client.put("/sn/a", "1", Some(lease)).await?;
    assert_eq!(client.bound_endpoint(), Some(host_a.control_url.as_str()));
    assert_eq!(store_a.get_prefix("/sn/").await.len(), 1);

    host_a.crash().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.get_prefix("/sn/").await.is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "bound host still answering");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(client.put("/sn/b", "2", None).await.is_err());
    assert!(store_b.get_prefix("/sn/").await.is_empty());
    assert_eq!(client.bound_endpoint(), Some(host_a.control_url.as_str()));

    client.close().await?;
    host_b.crash().await;
    store_a.shutdown();
    store_b.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_store_binds_past_dead_endpoint() -> Result<()> {
    let (store, host, _) = hosted().await?;
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = dead.local_addr()?.to_string();
    drop(dead);

    let client = HttpStore::new(&[dead_addr, host.control_url.clone()], test_ha().dial_timeout())?;
    client.put("/sn/a", "1", None).await?;
    assert_eq!(client.bound_endpoint(), Some(host.control_url.as_str()));
    assert_eq!(store.get_prefix("/sn/").await.len(), 1);

    client.close().await?;
    host.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_store_watch_reports_put_and_expiry() -> Result<()> {
    let (store, host, client) = hosted().await?;

    let mut watch = client.watch("/sn/").await?;
    let lease = client.grant(1).await?;
    client.put("/sn/a", "1", Some(lease)).await?;
    client.put("/other", "x", None).await?;

    let batch = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await?
        .context("watch closed")?;
    assert_eq!(batch.events[0].kind, EventKind::Put);
    assert_eq!(batch.events[0].key, "/sn/a");
    assert!(batch.events.iter().all(|e| e.key.starts_with("/sn/")));

    // Unrenewed, the lease runs out and the key goes with it.
    let batch = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await?
        .context("watch closed")?;
    assert_eq!(batch.events[0].kind, EventKind::Delete);
    assert_eq!(batch.events[0].key, "/sn/a");

    client.close().await?;
    host.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_store_keep_alive_holds_lease() -> Result<()> {
    let (store, host, client) = hosted().await?;

    let lease = client.grant(1).await?;
    client.put("/sn/a", "1", Some(lease)).await?;
    let mut acks = client.keep_alive(lease).await?;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(client.get_prefix("/sn/").await?.len(), 1);
    let ack = acks.recv().await.context("keep-alive ended")?;
    assert_eq!(ack.lease, lease);

    drop(acks);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while !store.get_prefix("/sn/").await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "lease outlived its keep-alive");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.close().await?;
    host.crash().await;
    store.shutdown();
    Ok(())
}
