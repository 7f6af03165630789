pub mod handlers;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use drift_core::wire::SERVER_DOWN_METHOD;
use drift_services::store::MemoryStore;
use drift_services::Protocol;

pub use handlers::ApiState;

/// Peer-facing routes served on the listen port.
pub fn peer_router(state: ApiState) -> Router {
    Router::new()
        .route("/peer/registry", post(handlers::handle_register))
        .route("/peer/task", get(handlers::handle_pull_piece_task))
        .route("/peer/piece/suc", get(handlers::handle_report_piece))
        .route("/peer/service/down", get(handlers::handle_service_down))
        .route("/supernodes", get(handlers::handle_supernodes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Control-channel routes served on the control port.
///
/// With `store` set, the coordination store is hosted here too.
pub fn control_router(protocol: Protocol, store: Option<MemoryStore>) -> Router {
    let rpc = Router::new()
        .route(
            &format!("/rpc/{SERVER_DOWN_METHOD}"),
            post(handlers::handle_rpc_server_down),
        )
        .with_state(protocol);

    let app = match store {
        Some(store) => rpc.merge(store_router(store)),
        None => rpc,
    };
    app.layer(TraceLayer::new_for_http())
}

/// Coordination store routes for supernodes using `HttpStore`.
pub fn store_router(store: MemoryStore) -> Router {
    Router::new()
        .route("/store/lease/grant", post(handlers::handle_lease_grant))
        .route("/store/lease/keepalive", post(handlers::handle_lease_keep_alive))
        .route("/store/lease/revoke", post(handlers::handle_lease_revoke))
        .route("/store/kv/put", post(handlers::handle_kv_put))
        .route("/store/kv/range", get(handlers::handle_kv_range))
        .route("/store/watch", get(handlers::handle_watch))
        .route("/store/revision", get(handlers::handle_revision))
        .with_state(store)
}

/// Bind `addr` and serve `app` until `shutdown` fires.
pub async fn serve(app: Router, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(app, listener, shutdown).await
}

/// Serve `app` on an already bound listener until `shutdown` fires.
pub async fn serve_listener(
    app: Router,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!(%addr, "HTTP stopped");
    Ok(())
}
