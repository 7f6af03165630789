//! Control-channel RPC handlers.

use axum::extract::State;
use axum::Json;

use drift_core::types::ServerDownRequest;
use drift_services::Protocol;

/// `RpcManager.RpcDfgetServerDown`: a client of a task this node owns went down.
pub async fn handle_rpc_server_down(
    State(protocol): State<Protocol>,
    Json(req): Json<ServerDownRequest>,
) -> Json<bool> {
    Json(protocol.handle_remote_server_down(&req).await)
}
