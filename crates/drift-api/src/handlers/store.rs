//! /store/* handlers: the coordination store hosted for other supernodes.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;

use drift_services::store::http::{
    GrantRequest, GrantResponse, LeaseRequest, PutRequest, RangeQuery, RevisionResponse,
    WatchQuery, WATCH_POLL_TIMEOUT,
};
use drift_services::store::memory::WatchPoll;
use drift_services::store::{KeepAliveResponse, KeyValue, MemoryStore, StoreError};

/// Longest a watch poll may be held open.
const MAX_POLL: Duration = Duration::from_secs(30);

fn store_error(e: StoreError) -> (StatusCode, String) {
    let status = match e {
        StoreError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidTtl(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// ── Leases ────────────────────────────────────────────────────────────────────

pub async fn handle_lease_grant(
    State(store): State<MemoryStore>,
    Json(req): Json<GrantRequest>,
) -> Result<Json<GrantResponse>, (StatusCode, String)> {
    let lease = store.grant(req.ttl_secs).await.map_err(store_error)?;
    Ok(Json(GrantResponse { lease }))
}

pub async fn handle_lease_keep_alive(
    State(store): State<MemoryStore>,
    Json(req): Json<LeaseRequest>,
) -> Result<Json<KeepAliveResponse>, (StatusCode, String)> {
    store.renew(req.lease).await.map(Json).map_err(store_error)
}

pub async fn handle_lease_revoke(
    State(store): State<MemoryStore>,
    Json(req): Json<LeaseRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    store.revoke(req.lease).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Keys ──────────────────────────────────────────────────────────────────────

pub async fn handle_kv_put(
    State(store): State<MemoryStore>,
    Json(req): Json<PutRequest>,
) -> Result<Json<RevisionResponse>, (StatusCode, String)> {
    let revision = store
        .put(&req.key, &req.value, req.lease)
        .await
        .map_err(store_error)?;
    Ok(Json(RevisionResponse { revision }))
}

pub async fn handle_kv_range(
    State(store): State<MemoryStore>,
    Query(q): Query<RangeQuery>,
) -> Json<Vec<KeyValue>> {
    Json(store.get_prefix(&q.prefix).await)
}

// ── Watch ─────────────────────────────────────────────────────────────────────

pub async fn handle_watch(
    State(store): State<MemoryStore>,
    Query(q): Query<WatchQuery>,
) -> Json<WatchPoll> {
    let timeout = q
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(WATCH_POLL_TIMEOUT)
        .min(MAX_POLL);
    Json(store.poll_events(&q.prefix, q.after, timeout).await)
}

pub async fn handle_revision(State(store): State<MemoryStore>) -> Json<RevisionResponse> {
    Json(RevisionResponse {
        revision: store.revision().await,
    })
}
