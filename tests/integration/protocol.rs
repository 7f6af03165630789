use crate::*;

use drift_core::types::{DfgetTask, PieceInfo, TaskInfo};
use drift_core::wire::codes;
use drift_services::registry::TaskRegistry;
use serde_json::json;

const CONVERGE: Duration = Duration::from_secs(5);

fn piece(range: &str) -> PieceInfo {
    PieceInfo {
        piece_range: range.into(),
        piece_size: 4,
        piece_md5: "5d41402abc4b2a76b9719d911017c592".into(),
        cid: "cdn".into(),
        peer_ip: "127.0.0.1".into(),
        peer_port: 8001,
        path: "/qtdown/data".into(),
    }
}

/// register → pull (wait) → pull (continue) → report → pull (finish) → service down.
#[tokio::test]
async fn test_piece_protocol_over_http() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();
    let s = Supernode::start("sn", Arc::new(store.client()), None, &ha).await?;

    let (status, body) = post_json(
        &format!("{}/peer/registry", s.peer_url),
        &json!({
            "cid": "c1",
            "ip": "127.0.0.1",
            "hostName": "client",
            "port": 15001,
            "rawUrl": "http://origin/file",
            "headers": ["Accept:*/*"],
        }),
    )
    .await?;
    assert_eq!(status, 200);
    assert_eq!(body["code"], codes::SUCCESS);
    let task_id = body["data"]["taskId"].as_str().context("taskId")?.to_string();
    assert_eq!(s.mem.tasks.get(&task_id).await?.cdn_peer_id, "sn");

    let pull_url = format!(
        "{}/peer/task?taskId={task_id}&srcCid=c1&status=700&result=501&range=",
        s.peer_url
    );
    let (_, wait) = get_json(&pull_url).await?;
    assert_eq!(wait["code"], codes::PEER_WAIT);

    s.mem.tasks.add_piece(&task_id, piece("0-3"));
    s.mem.tasks.add_piece(&task_id, piece("4-7"));
    let (_, cont) = get_json(&pull_url).await?;
    assert_eq!(cont["code"], codes::PEER_CONTINUE);
    let entries = cont["data"].as_array().context("piece list")?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["pieceNum"], 1);
    assert_eq!(entries[1]["range"], "4-7");

    // The pieces came from the CDN peer; register its dfget task so reports resolve.
    s.mem.dfget_tasks.insert(DfgetTask {
        cid: "cdn".into(),
        task_id: task_id.clone(),
        peer_id: "sn".into(),
        path: String::new(),
    });
    for range in ["0-3", "4-7"] {
        let (_, ack) = get_json(&format!(
            "{}/peer/piece/suc?taskId={task_id}&cid=c1&dstCid=cdn&pieceRange={range}",
            s.peer_url
        ))
        .await?;
        assert_eq!(ack["code"], codes::PIECE_REPORT_ACK);
    }
    let (range, update) = s.mem.tasks.last_update(&task_id, "c1").context("report recorded")?;
    assert_eq!(range, "4-7");
    assert_eq!(update.dst_pid, "sn");
    assert!(!update.send_copy);

    let (_, done) = get_json(&pull_url).await?;
    assert_eq!(done["code"], codes::PEER_FINISH);

    let (_, down) = get_json(&format!(
        "{}/peer/service/down?taskId={task_id}&cid=c1",
        s.peer_url
    ))
    .await?;
    assert_eq!(down["code"], codes::PEER_DOWN_ACK);
    assert!(!s.mem.dfget_tasks.contains("c1", &task_id));
    assert!(s.mem.tasks.last_pull(&task_id, "c1").is_none());

    s.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bad_register_is_a_param_error() -> Result<()> {
    let store = MemoryStore::new();
    let s = Supernode::start("sn", Arc::new(store.client()), None, &test_ha()).await?;

    let (status, body) = post_json(
        &format!("{}/peer/registry", s.peer_url),
        &json!({ "cid": "c1", "ip": "127.0.0.1", "port": 15001 }),
    )
    .await?;
    assert_eq!(status, 400);
    assert_eq!(body["code"], codes::PARAM_ERROR);

    let resp = reqwest::Client::new()
        .post(format!("{}/peer/registry", s.peer_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], codes::PARAM_ERROR);

    s.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_missing_task_id_is_a_param_error() -> Result<()> {
    let store = MemoryStore::new();
    let s = Supernode::start("sn", Arc::new(store.client()), None, &test_ha()).await?;

    for path in [
        "/peer/task?srcCid=c1&status=700&result=501",
        "/peer/piece/suc?cid=c1&dstCid=c2&pieceRange=0-3",
        "/peer/service/down?cid=c1",
    ] {
        let (status, body) = get_json(&format!("{}{path}", s.peer_url)).await?;
        assert_eq!(status, 400, "{path}");
        assert_eq!(body["code"], codes::PARAM_ERROR, "{path}");
    }

    s.crash().await;
    store.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_unknown_task_is_not_found() -> Result<()> {
    let store = MemoryStore::new();
    let s = Supernode::start("sn", Arc::new(store.client()), None, &test_ha()).await?;

    let (status, body) = get_json(&format!(
        "{}/peer/piece/suc?taskId=missing&cid=c1&dstCid=c2&pieceRange=0-3",
        s.peer_url
    ))
    .await?;
    assert_eq!(status, 404);
    assert_eq!(body["code"], codes::TARGET_NOT_FOUND);

    s.crash().await;
    store.shutdown();
    Ok(())
}

/// A client of a task owned by another supernode goes down: the owner is
/// told over the control channel and drops the client's state too.
#[tokio::test]
async fn test_service_down_notifies_cdn_owner() -> Result<()> {
    let store = MemoryStore::new();
    let ha = test_ha();

    let mut owner = Supernode::start("owner", Arc::new(store.client()), None, &ha).await?;
    owner.join(ha.lease_ttl_secs).await?;
    let mut edge = Supernode::start("edge", Arc::new(store.client()), None, &ha).await?;
    edge.join(ha.lease_ttl_secs).await?;
    assert!(eventually(CONVERGE, || edge.mem.peers.contains("owner")).await);

    let task = TaskInfo {
        id: "t1".into(),
        raw_url: "http://origin/file".into(),
        piece_size: 4,
        cdn_peer_id: "owner".into(),
        ..Default::default()
    };
    let client = DfgetTask {
        cid: "c1".into(),
        task_id: "t1".into(),
        peer_id: "client-1".into(),
        path: String::new(),
    };
    for node in [&owner, &edge] {
        node.mem.tasks.insert_task(task.clone());
        node.mem.dfget_tasks.insert(client.clone());
        node.mem.progress.record_piece("t1", "c1", "0-3");
    }
    edge.mem
        .peers
        .register(PeerCreateRequest {
            ip: "127.0.0.1".into(),
            host_name: "client".into(),
            port: 15001,
            version: String::new(),
            peer_id: Some("client-1".into()),
        })
        .await?;

    // Pulls and reports on the edge name the owner as destination.
    edge.mem.tasks.add_piece("t1", piece("0-3"));
    let (_, pulled) = get_json(&format!(
        "{}/peer/task?taskId=t1&srcCid=c1&dstCid=c1&status=701&result=501&range=0-3",
        edge.peer_url
    ))
    .await?;
    assert_eq!(pulled["code"], codes::PEER_CONTINUE);
    let last = edge.mem.tasks.last_pull("t1", "c1").context("pull recorded")?;
    assert_eq!(last.dst_pid.as_deref(), Some("owner"));

    let (_, down) = get_json(&format!(
        "{}/peer/service/down?taskId=t1&cid=c1",
        edge.peer_url
    ))
    .await?;
    assert_eq!(down["code"], codes::PEER_DOWN_ACK);

    assert!(!edge.mem.dfget_tasks.contains("c1", "t1"));
    assert!(!edge.mem.peers.contains("client-1"));
    assert!(!owner.mem.dfget_tasks.contains("c1", "t1"));
    assert!(!owner.mem.progress.has_piece_progress("t1", "c1"));
    let owner_info = edge.table.get("owner").await.context("owner in table")?;
    assert_eq!(
        owner_info.control.state(),
        drift_services::control::ConnectionState::Connected
    );

    owner.crash().await;
    edge.crash().await;
    store.shutdown();
    Ok(())
}

/// The control RPC answers with a bare boolean.
#[tokio::test]
async fn test_server_down_rpc_shape() -> Result<()> {
    let store = MemoryStore::new();
    let s = Supernode::start("sn", Arc::new(store.client()), None, &test_ha()).await?;

    let (status, body) = post_json(
        &format!("{}/rpc/RpcManager.RpcDfgetServerDown", s.control_url),
        &json!({ "taskID": "t1", "clientID": "c1" }),
    )
    .await?;
    assert_eq!(status, 200);
    assert_eq!(body, json!(true));

    s.crash().await;
    store.shutdown();
    Ok(())
}
